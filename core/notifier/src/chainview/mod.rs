//! A view of the best chain filtered down to the transactions that spend a
//! watched set of outputs. Consumers read connected blocks and stale
//! (disconnected) blocks from two channels fed by one ordered queue.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bitcoin::{BlockHash, Transaction, block::Header, hashes::Hash};
use tokio::{select, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bitcoin_client::{BitcoinRpc, types::ChainNotification},
    block::{BlockEpoch, FilteredBlock},
    config::Config,
    error::Error,
    lifecycle::Lifecycle,
};

use self::{
    filter::{WatchedOutput, WatchedOutputs},
    queue::{BlockEvent, BlockEventQueue},
};

pub mod filter;
pub mod queue;

#[derive(Debug)]
struct FilterUpdate {
    update_height: u32,
}

struct Shared<C> {
    backend: C,
    watched: WatchedOutputs,
    best: RwLock<BlockEpoch>,
    block_queue: BlockEventQueue,
}

pub struct FilteredChainView<C: BitcoinRpc> {
    shared: Arc<Shared<C>>,
    lifecycle: Lifecycle,
    filter_updates: mpsc::UnboundedSender<FilterUpdate>,
    pending_updates: Mutex<Option<mpsc::UnboundedReceiver<FilterUpdate>>>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: BitcoinRpc> FilteredChainView<C> {
    pub fn new(config: &Config, backend: C) -> Self {
        let (filter_updates, pending_updates) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                backend,
                watched: WatchedOutputs::new(),
                best: RwLock::new(BlockEpoch::new(0, BlockHash::all_zeros())),
                block_queue: BlockEventQueue::new(config.block_queue_size),
            }),
            lifecycle: Lifecycle::new(),
            filter_updates,
            pending_updates: Mutex::new(Some(pending_updates)),
            cancel_token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), Error> {
        if !self.lifecycle.start() {
            return Ok(());
        }

        if let Err(e) = self.start_view().await {
            error!("Unable to start filtered chain view: {}", e);
            self.lifecycle.abort_start();
            return Err(e);
        }
        Ok(())
    }

    async fn start_view(&self) -> Result<(), Error> {
        // Subscribe before reading the tip so no block slips in between.
        let notifications = self.shared.backend.subscribe();
        let (hash, height) = self.shared.backend.get_best_block().await?;
        self.shared.set_best(BlockEpoch::new(height, hash));

        self.shared.backend.start_rescan(&hash).await?;
        self.shared.block_queue.start();

        let Some(updates) = self
            .pending_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        let handle = tokio::spawn(run(
            self.shared.clone(),
            notifications,
            updates,
            self.cancel_token.clone(),
        ));
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("Filtered chain view started at height {}", height);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), Error> {
        if !self.lifecycle.stop() {
            return Ok(());
        }
        info!("Filtered chain view shutting down");

        self.cancel_token.cancel();
        if let Err(e) = self.shared.backend.stop_rescan().await {
            warn!("Unable to stop rescan: {}", e);
        }

        // The loop may be parked on a full queue; stopping the queue first
        // releases it.
        self.shared.block_queue.stop().await;
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    pub fn best_block(&self) -> BlockEpoch {
        self.shared.best()
    }

    pub fn watched(&self) -> &WatchedOutputs {
        &self.shared.watched
    }

    /// Adds `ops` to the watched set. When `update_height` is below the
    /// current best height, the blocks above it are re-examined so spends
    /// of the new outputs that were already mined are delivered too.
    pub fn update_filter(
        &self,
        ops: Vec<WatchedOutput>,
        update_height: u32,
    ) -> Result<(), Error> {
        if self.lifecycle.is_stopped() || self.cancel_token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        debug!(
            "Updating chain filter with {} outputs at height {}",
            ops.len(),
            update_height
        );
        self.shared.watched.add(&ops);

        self.filter_updates
            .send(FilterUpdate { update_height })
            .map_err(|_| Error::ShuttingDown)
    }

    /// Returns the transactions of block `hash` that spend a watched
    /// output, dropping those outputs from the watched set.
    pub async fn filter_block(&self, hash: &BlockHash) -> Result<FilteredBlock, Error> {
        let backend = &self.shared.backend;
        let height = backend.get_block_height(hash).await?;

        if self.shared.watched.is_empty() {
            return Ok(FilteredBlock::empty(*hash, height));
        }

        if backend.capabilities().compact_filters {
            let Some(filter) = backend.get_cfilter(hash).await? else {
                return Ok(FilteredBlock::empty(*hash, height));
            };
            let scripts = self.shared.watched.scripts();
            let matched = filter
                .match_any(hash, scripts.iter().map(|s| s.as_bytes()))
                .map_err(|source| Error::Filter {
                    hash: *hash,
                    source,
                })?;
            if !matched {
                return Ok(FilteredBlock::empty(*hash, height));
            }
        }

        let txs = backend.get_filter_block(hash).await?;
        Ok(FilteredBlock {
            hash: *hash,
            height,
            transactions: self.shared.watched.take_spending(txs),
        })
    }

    /// Connected blocks. Only the first caller gets the receiver.
    pub fn filtered_blocks(&self) -> Option<mpsc::Receiver<FilteredBlock>> {
        self.shared.block_queue.new_blocks()
    }

    /// Disconnected blocks. Only the first caller gets the receiver.
    pub fn disconnected_blocks(&self) -> Option<mpsc::Receiver<FilteredBlock>> {
        self.shared.block_queue.stale_blocks()
    }
}

impl<C: BitcoinRpc> Shared<C> {
    fn best(&self) -> BlockEpoch {
        *self.best.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_best(&self, epoch: BlockEpoch) {
        *self.best.write().unwrap_or_else(PoisonError::into_inner) = epoch;
    }

    async fn on_block_connected(
        &self,
        height: u32,
        header: &Header,
        txs: Vec<Transaction>,
    ) -> Result<(), Error> {
        let hash = header.block_hash();
        let spent = self.watched.remove_spent(&txs);
        if !spent.is_empty() {
            debug!(
                "Block {} at height {} spent {} watched outputs",
                hash,
                height,
                spent.len()
            );
        }

        self.set_best(BlockEpoch::new(height, hash));
        self.block_queue
            .add(BlockEvent::connected(FilteredBlock {
                hash,
                height,
                transactions: txs,
            }))
            .await
    }

    async fn on_block_disconnected(&self, height: u32, header: &Header) -> Result<(), Error> {
        let hash = header.block_hash();
        debug!("Block {} at height {} disconnected", hash, height);

        self.set_best(BlockEpoch::new(
            height.saturating_sub(1),
            header.prev_blockhash,
        ));
        self.block_queue
            .add(BlockEvent::disconnected(FilteredBlock::empty(hash, height)))
            .await
    }

    /// Walks `update_height+1 ..= best` one block at a time, re-delivering
    /// blocks that spend newly watched outputs.
    async fn rewind(&self, update_height: u32, cancel_token: &CancellationToken) -> Result<(), Error> {
        let best = self.best();
        if update_height >= best.height {
            return Ok(());
        }
        info!(
            "Rewinding chain view from height {} to {} for filter update",
            best.height, update_height
        );

        let mut prev_hash = self.backend.get_block_hash(update_height).await?;
        for height in update_height + 1..=best.height {
            if cancel_token.is_cancelled() {
                return Err(Error::ShuttingDown);
            }

            let hash = self.backend.get_block_hash(height).await?;
            let block = self.backend.get_block(&hash).await?;
            if block.header.prev_blockhash != prev_hash {
                warn!(
                    "Chain changed during rewind at height {}, leaving the rest to block notifications",
                    height
                );
                return Ok(());
            }
            prev_hash = hash;

            let transactions = self.watched.take_spending(block.txdata);
            if transactions.is_empty() {
                continue;
            }
            debug!(
                "Rewind found {} spends of watched outputs at height {}",
                transactions.len(),
                height
            );
            self.block_queue
                .add(BlockEvent::connected(FilteredBlock {
                    hash,
                    height,
                    transactions,
                }))
                .await?;
        }
        Ok(())
    }
}

async fn run<C: BitcoinRpc>(
    shared: Arc<Shared<C>>,
    mut notifications: mpsc::UnboundedReceiver<ChainNotification>,
    mut updates: mpsc::UnboundedReceiver<FilterUpdate>,
    cancel_token: CancellationToken,
) {
    loop {
        select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("Filtered chain view exiting");
                return;
            }
            Some(update) = updates.recv() => {
                if let Err(e) = shared.rewind(update.update_height, &cancel_token).await {
                    error!(
                        "Unable to rewind chain view to height {}: {}",
                        update.update_height, e
                    );
                }
            }
            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    warn!("Backend notification stream closed");
                    return;
                };
                let res = match notification {
                    ChainNotification::BlockConnected { height, header, txs } => {
                        shared.on_block_connected(height, &header, txs).await
                    }
                    ChainNotification::BlockDisconnected { height, header } => {
                        shared.on_block_disconnected(height, &header).await
                    }
                    ChainNotification::RelevantTx { .. } => Ok(()),
                };
                match res {
                    Ok(()) => {}
                    Err(Error::QueueStopped) => return,
                    Err(e) => error!("Unable to process block notification: {}", e),
                }
            }
        }
    }
}
