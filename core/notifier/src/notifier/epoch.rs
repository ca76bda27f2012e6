use tokio::{select, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{block::BlockEpoch, queue::ConcurrentQueue};

#[derive(Debug)]
pub(crate) struct EpochCancel {
    pub epoch_id: u64,
}

/// The dispatcher's handle on one block-epoch subscriber: a queue the
/// dispatcher pushes into without blocking, and the proxy task that moves
/// epochs from the queue into the subscriber's channel.
pub(crate) struct BlockEpochRegistration {
    pub epoch_id: u64,
    pub best_block: Option<BlockEpoch>,
    queue: ConcurrentQueue<BlockEpoch>,
    chan_in: mpsc::Sender<BlockEpoch>,
    cancel_token: CancellationToken,
    proxy: Option<JoinHandle<()>>,
}

impl BlockEpochRegistration {
    pub fn new(
        epoch_id: u64,
        best_block: Option<BlockEpoch>,
        buffer_size: usize,
        quit: CancellationToken,
        cancels: mpsc::UnboundedSender<EpochCancel>,
    ) -> (Self, BlockEpochEvent) {
        let mut queue = ConcurrentQueue::new(buffer_size);
        let chan_in = queue.chan_in();
        let queue_out = queue.take_chan_out();
        queue.start();

        let (epoch_tx, epochs) = mpsc::channel(buffer_size);
        let cancel_token = CancellationToken::new();
        let proxy = queue_out.map(|queue_out| {
            tokio::spawn(proxy(
                queue_out,
                epoch_tx,
                cancel_token.clone(),
                quit.clone(),
            ))
        });

        (
            Self {
                epoch_id,
                best_block,
                queue,
                chan_in,
                cancel_token,
                proxy,
            },
            BlockEpochEvent {
                epochs,
                epoch_id,
                cancels,
                quit,
                cancelled: false,
            },
        )
    }

    /// Queues `epoch` for the subscriber. Gives up if the subscriber
    /// cancels or the notifier shuts down first.
    pub async fn notify(&self, epoch: BlockEpoch, quit: &CancellationToken) {
        select! {
            biased;
            _ = self.cancel_token.cancelled() => {}
            _ = quit.cancelled() => {}
            res = self.chan_in.send(epoch) => {
                if res.is_err() {
                    debug!("Epoch queue for client {} closed", self.epoch_id);
                }
            }
        }
    }

    /// Stops the queue and the proxy. Once the proxy has exited the
    /// subscriber's channel is closed.
    pub async fn teardown(mut self) {
        self.queue.stop();
        self.cancel_token.cancel();
        if let Some(proxy) = self.proxy.take() {
            let _ = proxy.await;
        }
    }
}

impl Drop for BlockEpochRegistration {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn proxy(
    mut queue_out: mpsc::Receiver<BlockEpoch>,
    epoch_tx: mpsc::Sender<BlockEpoch>,
    cancel_token: CancellationToken,
    quit: CancellationToken,
) {
    loop {
        let epoch = select! {
            biased;
            _ = cancel_token.cancelled() => return,
            _ = quit.cancelled() => return,
            epoch = queue_out.recv() => match epoch {
                Some(epoch) => epoch,
                None => return,
            },
        };

        select! {
            biased;
            _ = cancel_token.cancelled() => return,
            _ = quit.cancelled() => return,
            res = epoch_tx.send(epoch) => {
                if res.is_err() {
                    return;
                }
            }
        }
    }
}

/// A block-epoch subscription. `epochs` yields every new tip in chain
/// order and closes once the subscription is cancelled or the notifier
/// stops. Dropping it cancels the subscription.
pub struct BlockEpochEvent {
    pub epochs: mpsc::Receiver<BlockEpoch>,
    epoch_id: u64,
    cancels: mpsc::UnboundedSender<EpochCancel>,
    quit: CancellationToken,
    cancelled: bool,
}

impl BlockEpochEvent {
    pub fn epoch_id(&self) -> u64 {
        self.epoch_id
    }

    /// Unsubscribes, then drains `epochs` until the notifier closes it so
    /// the proxy is never left blocked on a full channel.
    pub async fn cancel(&mut self) {
        if !self.send_cancel() {
            return;
        }

        loop {
            select! {
                epoch = self.epochs.recv() => {
                    if epoch.is_none() {
                        return;
                    }
                }
                _ = self.quit.cancelled() => return,
            }
        }
    }

    fn send_cancel(&mut self) -> bool {
        if self.cancelled {
            return false;
        }
        self.cancelled = true;
        self.cancels
            .send(EpochCancel {
                epoch_id: self.epoch_id,
            })
            .is_ok()
    }
}

impl Drop for BlockEpochEvent {
    fn drop(&mut self) {
        self.send_cancel();
    }
}
