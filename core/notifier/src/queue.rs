use std::collections::VecDeque;

use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// An unbounded FIFO between a producer and a consumer that each see a
/// bounded channel. A mover task spills into an in-memory overflow list
/// whenever the consumer falls behind, so the producer only ever waits for
/// the input buffer to drain.
pub struct ConcurrentQueue<T> {
    chan_in: mpsc::Sender<T>,
    chan_out: Option<mpsc::Receiver<T>>,
    pending: Option<(mpsc::Receiver<T>, mpsc::Sender<T>)>,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> ConcurrentQueue<T> {
    pub fn new(buffer_size: usize) -> Self {
        let (chan_in, in_rx) = mpsc::channel(buffer_size);
        let (out_tx, chan_out) = mpsc::channel(buffer_size);
        Self {
            chan_in,
            chan_out: Some(chan_out),
            pending: Some((in_rx, out_tx)),
            cancel_token: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn chan_in(&self) -> mpsc::Sender<T> {
        self.chan_in.clone()
    }

    /// The consuming end. Only the first caller gets it.
    pub fn take_chan_out(&mut self) -> Option<mpsc::Receiver<T>> {
        self.chan_out.take()
    }

    pub fn start(&mut self) {
        let Some((in_rx, out_tx)) = self.pending.take() else {
            return;
        };
        self.handle = Some(tokio::spawn(run(
            in_rx,
            out_tx,
            self.cancel_token.clone(),
        )));
    }

    /// Stops the mover. Anything still in the overflow is dropped.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn run<T>(
    mut in_rx: mpsc::Receiver<T>,
    out_tx: mpsc::Sender<T>,
    cancel_token: CancellationToken,
) {
    let mut overflow: VecDeque<T> = VecDeque::new();
    let mut input_closed = false;

    loop {
        if overflow.is_empty() {
            if input_closed {
                return;
            }
            select! {
                biased;
                _ = cancel_token.cancelled() => return,
                item = in_rx.recv() => match item {
                    Some(item) => match out_tx.try_send(item) {
                        Ok(()) => {}
                        Err(TrySendError::Full(item)) => overflow.push_back(item),
                        Err(TrySendError::Closed(_)) => return,
                    },
                    None => input_closed = true,
                },
            }
        } else {
            select! {
                biased;
                _ = cancel_token.cancelled() => return,
                permit = out_tx.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(item) = overflow.pop_front() {
                            permit.send(item);
                        }
                    }
                    Err(_) => return,
                },
                item = in_rx.recv(), if !input_closed => match item {
                    Some(item) => overflow.push_back(item),
                    None => input_closed = true,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn preserves_order_past_buffer() {
        let mut queue = ConcurrentQueue::new(2);
        let mut out = queue.take_chan_out().unwrap();
        queue.start();

        let chan_in = queue.chan_in();
        for i in 0..50u32 {
            timeout(TEST_TIMEOUT, chan_in.send(i)).await.unwrap().unwrap();
        }

        for i in 0..50u32 {
            let got = timeout(TEST_TIMEOUT, out.recv()).await.unwrap().unwrap();
            assert_eq!(got, i);
        }
        queue.stop();
    }

    #[tokio::test]
    async fn producer_does_not_block_on_slow_consumer() {
        let mut queue = ConcurrentQueue::new(1);
        let _out = queue.take_chan_out().unwrap();
        queue.start();

        let chan_in = queue.chan_in();
        let sends = async {
            for i in 0..100u32 {
                chan_in.send(i).await.unwrap();
            }
        };
        timeout(TEST_TIMEOUT, sends).await.unwrap();
        queue.stop();
    }

    #[tokio::test]
    async fn stop_closes_output() {
        let mut queue = ConcurrentQueue::<u32>::new(4);
        let mut out = queue.take_chan_out().unwrap();
        queue.start();
        queue.stop();

        assert!(timeout(TEST_TIMEOUT, out.recv()).await.unwrap().is_none());
        assert!(queue.take_chan_out().is_none());
    }
}
