use std::sync::{Mutex, PoisonError};

use tokio::{select, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{block::FilteredBlock, error::Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockEventKind {
    Connected,
    Disconnected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockEvent {
    pub kind: BlockEventKind,
    pub block: FilteredBlock,
}

impl BlockEvent {
    pub fn connected(block: FilteredBlock) -> Self {
        Self {
            kind: BlockEventKind::Connected,
            block,
        }
    }

    pub fn disconnected(block: FilteredBlock) -> Self {
        Self {
            kind: BlockEventKind::Disconnected,
            block,
        }
    }
}

type Pending = (
    mpsc::Receiver<BlockEvent>,
    mpsc::Sender<FilteredBlock>,
    mpsc::Sender<FilteredBlock>,
);

/// A single FIFO of block events, handed to the consumer as two channels:
/// new blocks and stale blocks. Only one event is ever outstanding, so a
/// disconnect can't be observed before the connect queued ahead of it.
pub struct BlockEventQueue {
    events_tx: mpsc::Sender<BlockEvent>,
    pending: Mutex<Option<Pending>>,
    new_blocks: Mutex<Option<mpsc::Receiver<FilteredBlock>>>,
    stale_blocks: Mutex<Option<mpsc::Receiver<FilteredBlock>>>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BlockEventQueue {
    pub fn new(capacity: usize) -> Self {
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (new_tx, new_rx) = mpsc::channel(1);
        let (stale_tx, stale_rx) = mpsc::channel(1);
        Self {
            events_tx,
            pending: Mutex::new(Some((events_rx, new_tx, stale_tx))),
            new_blocks: Mutex::new(Some(new_rx)),
            stale_blocks: Mutex::new(Some(stale_rx)),
            cancel_token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let Some((events_rx, new_tx, stale_tx)) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let handle = tokio::spawn(run(events_rx, new_tx, stale_tx, self.cancel_token.clone()));
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Appends to the tail. Waits only when the queue is at capacity.
    pub async fn add(&self, event: BlockEvent) -> Result<(), Error> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::QueueStopped);
        }
        select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(Error::QueueStopped),
            res = self.events_tx.send(event) => res.map_err(|_| Error::QueueStopped),
        }
    }

    /// Connected blocks, in order. Only the first caller gets the receiver.
    pub fn new_blocks(&self) -> Option<mpsc::Receiver<FilteredBlock>> {
        self.new_blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn stale_blocks(&self) -> Option<mpsc::Receiver<FilteredBlock>> {
        self.stale_blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

async fn run(
    mut events_rx: mpsc::Receiver<BlockEvent>,
    new_tx: mpsc::Sender<FilteredBlock>,
    stale_tx: mpsc::Sender<FilteredBlock>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = select! {
            biased;
            _ = cancel_token.cancelled() => return,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let kind = event.kind;
        let out = match kind {
            BlockEventKind::Connected => &new_tx,
            BlockEventKind::Disconnected => &stale_tx,
        };

        select! {
            biased;
            _ = cancel_token.cancelled() => return,
            delivered = deliver(out, event.block) => {
                if !delivered {
                    debug!("Block event consumer gone, dropping {:?} event", kind);
                }
            }
        }
    }
}

/// Sends `block` and waits until the consumer has taken it.
async fn deliver(out: &mpsc::Sender<FilteredBlock>, block: FilteredBlock) -> bool {
    if out.send(block).await.is_err() {
        return false;
    }
    out.reserve().await.is_ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bitcoin::{BlockHash, hashes::Hash};
    use tokio::time::timeout;

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn block(n: u8, height: u32) -> FilteredBlock {
        FilteredBlock::empty(BlockHash::from_byte_array([n; 32]), height)
    }

    #[tokio::test]
    async fn demuxes_in_order() {
        let queue = BlockEventQueue::new(8);
        let mut new_blocks = queue.new_blocks().unwrap();
        let mut stale_blocks = queue.stale_blocks().unwrap();
        queue.start();

        queue.add(BlockEvent::connected(block(1, 1))).await.unwrap();
        queue.add(BlockEvent::disconnected(block(1, 1))).await.unwrap();
        queue.add(BlockEvent::connected(block(2, 1))).await.unwrap();

        // The disconnect is not offered until the connect ahead of it is taken.
        assert!(
            timeout(Duration::from_millis(100), stale_blocks.recv())
                .await
                .is_err()
        );

        let first = timeout(TEST_TIMEOUT, new_blocks.recv()).await.unwrap().unwrap();
        assert_eq!(first, block(1, 1));
        let stale = timeout(TEST_TIMEOUT, stale_blocks.recv()).await.unwrap().unwrap();
        assert_eq!(stale, block(1, 1));
        let second = timeout(TEST_TIMEOUT, new_blocks.recv()).await.unwrap().unwrap();
        assert_eq!(second, block(2, 1));

        queue.stop().await;
    }

    #[tokio::test]
    async fn concurrent_producers_keep_their_order() {
        let queue = std::sync::Arc::new(BlockEventQueue::new(4));
        let mut new_blocks = queue.new_blocks().unwrap();
        queue.start();

        let producers: Vec<_> = (1..=2u8)
            .map(|n| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for height in 0..20 {
                        queue.add(BlockEvent::connected(block(n, height))).await.unwrap();
                    }
                })
            })
            .collect();

        let mut last = [None, None];
        for _ in 0..40 {
            let got = timeout(TEST_TIMEOUT, new_blocks.recv()).await.unwrap().unwrap();
            let producer = if got.hash == block(1, 0).hash { 0 } else { 1 };
            if let Some(prev) = last[producer] {
                assert_eq!(got.height, prev + 1);
            } else {
                assert_eq!(got.height, 0);
            }
            last[producer] = Some(got.height);
        }
        assert_eq!(last, [Some(19), Some(19)]);

        for producer in producers {
            producer.await.unwrap();
        }
        queue.stop().await;
    }

    #[tokio::test]
    async fn add_after_stop_fails() {
        let queue = BlockEventQueue::new(8);
        queue.start();
        queue.stop().await;

        match queue.add(BlockEvent::connected(block(1, 1))).await {
            Err(Error::QueueStopped) => {}
            other => panic!("expected QueueStopped, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn receivers_are_handed_out_once() {
        let queue = BlockEventQueue::new(8);
        assert!(queue.new_blocks().is_some());
        assert!(queue.new_blocks().is_none());
        assert!(queue.stale_blocks().is_some());
        assert!(queue.stale_blocks().is_none());
    }
}
