//! Reorg-safe block, confirmation and spend notifications on top of a
//! light-client backend.
//!
//! A single dispatcher task follows the backend's chain updates, feeds the
//! transaction tracker and fans every new tip out to block-epoch
//! subscribers. Confirmation and spend subscriptions live in the tracker;
//! when one may already be satisfied by past blocks, a resolver task is
//! spawned to look it up.

use std::sync::{
    Arc, Mutex, OnceLock, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use bitcoin::{BlockHash, OutPoint, ScriptBuf, Txid, hashes::Hash};
use futures_util::future::join_all;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

use crate::{
    bitcoin_client::{BitcoinRpc, types::Capabilities},
    block::BlockEpoch,
    config::Config,
    error::Error,
    lifecycle::Lifecycle,
    tx_notifier::TxNotifier,
};

use self::{
    dispatcher::{Dispatcher, EpochClients, Registration},
    epoch::{BlockEpochRegistration, EpochCancel},
    types::{
        ConfNtfn, ConfRequest, ConfirmationEvent, HistoricalDispatch, SpendEvent, SpendNtfn,
        SpendRequest,
    },
};

pub mod catchup;
mod dispatcher;
pub mod epoch;
pub mod historical;
pub mod types;

pub use epoch::BlockEpochEvent;

/// Builds the tracker once the starting height is known. Receives the
/// best height and the reorg safety limit.
pub type TxNotifierFactory<N> = Box<dyn FnOnce(u32, u32) -> N + Send>;

type Pending = (
    mpsc::UnboundedReceiver<Registration>,
    mpsc::UnboundedReceiver<EpochCancel>,
);

pub struct ChainNotifier<C: BitcoinRpc, N: TxNotifier> {
    config: Config,
    backend: C,
    lifecycle: Lifecycle,

    make_tx_notifier: Mutex<Option<TxNotifierFactory<N>>>,
    tx_notifier: OnceLock<Arc<N>>,
    best: Arc<RwLock<BlockEpoch>>,

    epoch_client_counter: AtomicU64,
    conf_client_counter: AtomicU64,
    spend_client_counter: AtomicU64,

    registrations: mpsc::UnboundedSender<Registration>,
    cancels: mpsc::UnboundedSender<EpochCancel>,
    pending: Mutex<Option<Pending>>,

    quit: CancellationToken,
    tasks: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<EpochClients>>>,
}

impl<C: BitcoinRpc, N: TxNotifier> ChainNotifier<C, N> {
    pub fn new(config: Config, backend: C, make_tx_notifier: TxNotifierFactory<N>) -> Self {
        let (registrations, registrations_rx) = mpsc::unbounded_channel();
        let (cancels, cancels_rx) = mpsc::unbounded_channel();
        Self {
            config,
            backend,
            lifecycle: Lifecycle::new(),
            make_tx_notifier: Mutex::new(Some(make_tx_notifier)),
            tx_notifier: OnceLock::new(),
            best: Arc::new(RwLock::new(BlockEpoch::new(0, BlockHash::all_zeros()))),
            epoch_client_counter: AtomicU64::new(0),
            conf_client_counter: AtomicU64::new(0),
            spend_client_counter: AtomicU64::new(0),
            registrations,
            cancels,
            pending: Mutex::new(Some((registrations_rx, cancels_rx))),
            quit: CancellationToken::new(),
            tasks: TaskTracker::new(),
            dispatcher: Mutex::new(None),
        }
    }

    /// Backend capabilities with the ones disabled by configuration
    /// masked out.
    fn capabilities(&self) -> Capabilities {
        let backend = self.backend.capabilities();
        Capabilities {
            compact_filters: backend.compact_filters && !self.config.disable_compact_filters,
            tx_index: backend.tx_index && !self.config.disable_tx_index,
        }
    }

    /// Starts following the chain. A failed start leaves the notifier as
    /// it was, so it can be retried.
    pub async fn start(&self) -> Result<(), Error> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        info!("Chain notifier starting");

        if let Err(e) = self.start_dispatcher().await {
            error!("Unable to start chain notifier: {}", e);
            self.lifecycle.abort_start();
            return Err(e);
        }
        Ok(())
    }

    async fn start_dispatcher(&self) -> Result<(), Error> {
        // Subscribe before reading the tip so no block slips in between.
        let notifications = self.backend.subscribe();
        let (hash, height) = self.backend.get_best_block().await?;
        let best = BlockEpoch::new(height, hash);
        *self.best.write().unwrap_or_else(PoisonError::into_inner) = best;

        self.backend.start_rescan(&hash).await?;

        let make_tx_notifier = self
            .make_tx_notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (Some(make_tx_notifier), Some((registrations, cancels))) = (
            make_tx_notifier,
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        ) else {
            return Err(Error::NotStarted);
        };
        let tx_notifier = Arc::new(make_tx_notifier(height, self.config.reorg_safety_limit));
        let _ = self.tx_notifier.set(tx_notifier.clone());

        let dispatcher = Dispatcher {
            backend: self.backend.clone(),
            tx_notifier,
            best: self.best.clone(),
            capabilities: self.capabilities(),
            backend_stores_reorgs: self.config.backend_stores_reorgs,
            quit: self.quit.clone(),
            tasks: self.tasks.clone(),
            clients: EpochClients::new(),
        };
        let handle = self
            .tasks
            .spawn(dispatcher.run(registrations, cancels, notifications));
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("Chain notifier started at {}", best);
        Ok(())
    }

    /// Shuts down. When this returns every subscriber channel is closed
    /// and no task started by the notifier is still running.
    pub async fn stop(&self) -> Result<(), Error> {
        if !self.lifecycle.stop() {
            return Ok(());
        }
        info!("Chain notifier shutting down");

        if let Err(e) = self.backend.stop_rescan().await {
            warn!("Unable to stop rescan: {}", e);
        }
        self.quit.cancel();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(clients) => {
                    join_all(clients.into_values().map(|r| r.teardown())).await;
                }
                Err(e) => error!("Chain dispatcher task failed: {}", e),
            }
        }

        self.tasks.close();
        self.tasks.wait().await;

        if let Some(tx_notifier) = self.tx_notifier.get() {
            tx_notifier.tear_down();
        }
        info!("Chain notifier stopped");
        Ok(())
    }

    pub fn best_block(&self) -> BlockEpoch {
        *self.best.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tx_notifier(&self) -> Option<Arc<N>> {
        self.tx_notifier.get().cloned()
    }

    fn running_tx_notifier(&self) -> Result<Arc<N>, Error> {
        if self.lifecycle.is_stopped() || self.quit.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.tx_notifier.get().cloned().ok_or(Error::NotStarted)
    }

    fn send_registration(&self, registration: Registration) -> Result<(), Error> {
        if self.quit.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.registrations
            .send(registration)
            .map_err(|_| Error::ShuttingDown)
    }

    /// Subscribes to new tips. With `best_block`, every block after it up
    /// to the current tip is delivered first; without it, the current tip
    /// is.
    pub async fn register_block_epoch_ntfn(
        &self,
        best_block: Option<BlockEpoch>,
    ) -> Result<BlockEpochEvent, Error> {
        self.running_tx_notifier()?;

        let epoch_id = self.epoch_client_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (registration, event) = BlockEpochRegistration::new(
            epoch_id,
            best_block,
            self.config.epoch_queue_size,
            self.quit.clone(),
            self.cancels.clone(),
        );

        let (result_tx, result_rx) = oneshot::channel();
        self.send_registration(Registration::BlockEpoch {
            registration,
            result_tx,
        })?;

        select! {
            res = result_rx => res.map_err(|_| Error::ShuttingDown)??,
            _ = self.quit.cancelled() => return Err(Error::ShuttingDown),
        }
        Ok(event)
    }

    /// Subscribes to `num_confs` confirmations of `txid`, or of any
    /// transaction paying to `script` when `txid` is `None`. Blocks from
    /// `height_hint` on are searched for an existing confirmation.
    pub fn register_confirmations_ntfn(
        &self,
        txid: Option<Txid>,
        script: ScriptBuf,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<ConfirmationEvent, Error> {
        let tx_notifier = self.running_tx_notifier()?;
        if num_confs == 0 {
            return Err(Error::InvalidRequest(
                "number of confirmations must be at least 1".to_string(),
            ));
        }
        let request = ConfRequest::new(txid, script)?;
        let conf_id = self.conf_client_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let cancel = {
            let tx_notifier = tx_notifier.clone();
            let request = request.clone();
            Box::new(move || tx_notifier.cancel_conf(&request, conf_id))
        };
        let (sender, event) = ConfirmationEvent::new(num_confs, cancel);

        info!(
            "New confirmation subscription: conf_id={}, {}, num_confs={}, height_hint={}",
            conf_id, request, num_confs, height_hint
        );
        let registration = tx_notifier
            .register_conf(ConfNtfn {
                conf_id,
                request,
                num_confs,
                height_hint,
                event: sender,
            })
            .map_err(Error::TxNotifier)?;

        if let Some(dispatch) = registration.historical_dispatch {
            self.send_registration(Registration::Historical(HistoricalDispatch::Conf(
                dispatch,
            )))?;
        }
        Ok(event)
    }

    /// Subscribes to the spend of `outpoint`, whose output pays to
    /// `script`.
    pub fn register_spend_ntfn(
        &self,
        outpoint: OutPoint,
        script: ScriptBuf,
        height_hint: u32,
    ) -> Result<SpendEvent, Error> {
        let tx_notifier = self.running_tx_notifier()?;
        let request = SpendRequest::new(outpoint, script)?;
        let spend_id = self.spend_client_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let cancel = {
            let tx_notifier = tx_notifier.clone();
            let request = request.clone();
            Box::new(move || tx_notifier.cancel_spend(&request, spend_id))
        };
        let (sender, event) = SpendEvent::new(cancel);

        info!(
            "New spend subscription: spend_id={}, {}, height_hint={}",
            spend_id, request, height_hint
        );
        let registration = tx_notifier
            .register_spend(SpendNtfn {
                spend_id,
                request,
                height_hint,
                event: sender,
            })
            .map_err(Error::TxNotifier)?;

        if let Some(dispatch) = registration.historical_dispatch {
            self.send_registration(Registration::Historical(HistoricalDispatch::Spend(
                dispatch,
            )))?;
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitcoin_client::mock::MockBitcoinRpc, test_utils::new_test_chain,
        tx_notifier::mock::MockTxNotifier,
    };

    #[tokio::test]
    async fn dropped_epoch_event_leaves_the_dispatcher() {
        let notifier = ChainNotifier::new(
            Config::default(),
            MockBitcoinRpc::new(new_test_chain(5)),
            Box::new(|height, _| MockTxNotifier::new(height)),
        );
        notifier.start().await.unwrap();

        let kept = notifier.register_block_epoch_ntfn(None).await.unwrap();
        let dropped = notifier.register_block_epoch_ntfn(None).await.unwrap();
        drop(dropped);
        // Cancels are served before registrations, so the dropped client
        // is gone once this one is in.
        let last = notifier.register_block_epoch_ntfn(None).await.unwrap();

        notifier.quit.cancel();
        let handle = notifier.dispatcher.lock().unwrap().take().unwrap();
        let clients = handle.await.unwrap();
        assert_eq!(
            clients.keys().copied().collect::<Vec<_>>(),
            vec![kept.epoch_id(), last.epoch_id()]
        );

        join_all(clients.into_values().map(|r| r.teardown())).await;
        notifier.stop().await.unwrap();
    }
}
