use std::sync::{Arc, PoisonError, RwLock};

use bitcoin::{BlockHash, Transaction, block::Header};
use indexmap::IndexMap;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    bitcoin_client::{BitcoinRpc, types::{Capabilities, ChainNotification}},
    block::BlockEpoch,
    error::Error,
    tx_notifier::TxNotifier,
};

use super::{
    catchup::{client_missed_blocks, common_ancestor, missed_blocks, parent_hash},
    epoch::{BlockEpochRegistration, EpochCancel},
    historical::{HistoricalResolver, resolve_and_report},
    types::HistoricalDispatch,
};

pub(crate) enum Registration {
    BlockEpoch {
        registration: BlockEpochRegistration,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    Historical(HistoricalDispatch),
}

pub(crate) type EpochClients = IndexMap<u64, BlockEpochRegistration>;

/// Owns the best tip and the block-epoch subscribers. Everything that
/// touches either runs on this one task, in arrival order.
pub(crate) struct Dispatcher<C, N> {
    pub backend: C,
    pub tx_notifier: Arc<N>,
    pub best: Arc<RwLock<BlockEpoch>>,
    pub capabilities: Capabilities,
    pub backend_stores_reorgs: bool,
    pub quit: CancellationToken,
    pub tasks: TaskTracker,
    pub clients: EpochClients,
}

impl<C: BitcoinRpc, N: TxNotifier> Dispatcher<C, N> {
    pub async fn run(
        mut self,
        mut registrations: mpsc::UnboundedReceiver<Registration>,
        mut cancels: mpsc::UnboundedReceiver<EpochCancel>,
        mut notifications: mpsc::UnboundedReceiver<ChainNotification>,
    ) -> EpochClients {
        loop {
            select! {
                biased;
                _ = self.quit.cancelled() => break,
                Some(cancel) = cancels.recv() => self.handle_cancel(cancel).await,
                Some(registration) = registrations.recv() => {
                    self.handle_registration(registration).await
                }
                Some(notification) = notifications.recv() => {
                    self.handle_chain_update(notification).await
                }
            }
        }
        info!("Chain dispatcher exiting with {} epoch clients", self.clients.len());
        self.clients
    }

    fn best(&self) -> BlockEpoch {
        *self.best.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_best(&self, epoch: BlockEpoch) {
        *self.best.write().unwrap_or_else(PoisonError::into_inner) = epoch;
    }

    async fn handle_cancel(&mut self, cancel: EpochCancel) {
        info!("Cancelling epoch notification, epoch_id={}", cancel.epoch_id);
        if let Some(registration) = self.clients.shift_remove(&cancel.epoch_id) {
            registration.teardown().await;
        }
    }

    async fn handle_registration(&mut self, registration: Registration) {
        match registration {
            Registration::BlockEpoch {
                registration,
                result_tx,
            } => {
                info!(
                    "New block epoch subscription, epoch_id={}",
                    registration.epoch_id
                );
                match self.catch_up_client(&registration).await {
                    Ok(()) => {
                        self.clients.insert(registration.epoch_id, registration);
                        let _ = result_tx.send(Ok(()));
                    }
                    Err(e) => {
                        error!(
                            "Unable to catch up epoch client {}: {}",
                            registration.epoch_id, e
                        );
                        registration.teardown().await;
                        let _ = result_tx.send(Err(e));
                    }
                }
            }
            Registration::Historical(dispatch) => {
                debug!("Dispatching {}", dispatch);
                let resolver = HistoricalResolver::new(
                    self.backend.clone(),
                    self.capabilities,
                    self.quit.clone(),
                );
                self.tasks.spawn(resolve_and_report(
                    resolver,
                    self.tx_notifier.clone(),
                    dispatch,
                ));
            }
        }
    }

    async fn catch_up_client(&self, registration: &BlockEpochRegistration) -> Result<(), Error> {
        let best = self.best();
        let Some(client_best) = registration.best_block else {
            registration.notify(best, &self.quit).await;
            return Ok(());
        };

        let missed = client_missed_blocks(
            &self.backend,
            client_best,
            best.height,
            self.backend_stores_reorgs,
        )
        .await?;
        for epoch in missed {
            registration.notify(epoch, &self.quit).await;
        }
        Ok(())
    }

    async fn notify_block_epochs(&self, epoch: BlockEpoch) {
        for registration in self.clients.values() {
            registration.notify(epoch, &self.quit).await;
        }
    }

    async fn handle_chain_update(&mut self, notification: ChainNotification) {
        match notification {
            ChainNotification::BlockConnected {
                height,
                header,
                txs,
            } => {
                if let Err(e) = self.on_block_connected(height, &header, txs).await {
                    error!(
                        "Unable to connect block {} at height {}: {}",
                        header.block_hash(),
                        height,
                        e
                    );
                }
            }
            ChainNotification::BlockDisconnected { height, header } => {
                let best = self.best();
                let res = if height == best.height && header.block_hash() == best.hash {
                    self.disconnect_tip(best, header.prev_blockhash).await
                } else {
                    info!("Missed disconnected blocks, attempting to catch up");
                    self.rewind(height.saturating_sub(1)).await
                };
                if let Err(e) = res {
                    error!(
                        "Unable to rewind chain from height {} to height {}: {}",
                        best.height,
                        height.saturating_sub(1),
                        e
                    );
                }
            }
            ChainNotification::RelevantTx { tx, block } => {
                let height = block.map(|b| b.height).unwrap_or(0);
                if let Err(e) = self.tx_notifier.process_relevant_spend_tx(&tx, height) {
                    error!(
                        "Unable to process relevant tx {}: {:#}",
                        tx.compute_txid(),
                        e
                    );
                }
            }
        }
    }

    async fn on_block_connected(
        &mut self,
        height: u32,
        header: &Header,
        txs: Vec<Transaction>,
    ) -> Result<(), Error> {
        let hash = header.block_hash();
        let best = self.best();
        if hash == best.hash {
            debug!("Ignoring repeated notification for block {}", hash);
            return Ok(());
        }

        if header.prev_blockhash != best.hash {
            info!(
                "Missed blocks, attempting to catch up from height {} to {}",
                best.height, height
            );
            for epoch in self.missed_blocks(height, header).await? {
                self.connect_block(epoch, None).await?;
            }
        }

        self.connect_block(BlockEpoch::new(height, hash), Some(txs))
            .await
    }

    /// Rewinds to the fork point of the new block's branch and returns
    /// the blocks between it and the new block.
    async fn missed_blocks(&mut self, height: u32, header: &Header) -> Result<Vec<BlockEpoch>, Error> {
        let best = self.best();
        let parent = BlockEpoch::new(height.saturating_sub(1), header.prev_blockhash);

        let ancestor = if self.backend_stores_reorgs {
            common_ancestor(&self.backend, best, parent).await?
        } else {
            best
        };
        self.rewind(ancestor.height).await?;

        missed_blocks(&self.backend, ancestor.height, parent.height).await
    }

    async fn connect_block(
        &mut self,
        epoch: BlockEpoch,
        txs: Option<Vec<Transaction>>,
    ) -> Result<(), Error> {
        let txs = match txs {
            Some(txs) => txs,
            None => self.backend.get_block(&epoch.hash).await?.txdata,
        };

        self.tx_notifier
            .connect_tip(&epoch.hash, epoch.height, &txs)
            .map_err(Error::TxNotifier)?;

        debug!("New block: height={}, hash={}", epoch.height, epoch.hash);
        self.set_best(epoch);
        self.notify_block_epochs(epoch).await;

        self.tx_notifier
            .notify_height(epoch.height)
            .map_err(Error::TxNotifier)
    }

    /// Disconnects tips one at a time until the best height is
    /// `target_height`. The best tip tracks every completed step, so a
    /// failure leaves it at the last height reached.
    async fn rewind(&mut self, target_height: u32) -> Result<(), Error> {
        loop {
            let best = self.best();
            if best.height <= target_height {
                return Ok(());
            }
            let parent = parent_hash(&self.backend, &best, self.backend_stores_reorgs).await?;
            self.disconnect_tip(best, parent).await?;
        }
    }

    async fn disconnect_tip(&mut self, tip: BlockEpoch, parent: BlockHash) -> Result<(), Error> {
        if tip.height == 0 {
            warn!("Refusing to disconnect block at height 0");
            return Ok(());
        }

        self.tx_notifier
            .disconnect_tip(tip.height)
            .map_err(Error::TxNotifier)?;
        info!(
            "Block disconnected from main chain: height={}, hash={}",
            tip.height, tip.hash
        );

        let new_best = BlockEpoch::new(tip.height - 1, parent);
        self.set_best(new_best);
        self.notify_block_epochs(new_best).await;
        Ok(())
    }
}
