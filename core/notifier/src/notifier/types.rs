use std::fmt;

use bitcoin::{BlockHash, OutPoint, ScriptBuf, Transaction, Txid};
use tokio::sync::mpsc;

use crate::error::Error;

/// What a confirmation subscriber is waiting for: a specific transaction
/// paying to `script`, or, without a txid, any transaction paying to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConfRequest {
    pub txid: Option<Txid>,
    pub script: ScriptBuf,
}

impl ConfRequest {
    pub fn new(txid: Option<Txid>, script: ScriptBuf) -> Result<Self, Error> {
        if script.is_empty() {
            return Err(Error::InvalidRequest(
                "confirmation request needs an output script".to_string(),
            ));
        }
        Ok(Self { txid, script })
    }

    pub fn matches_tx(&self, tx: &Transaction) -> bool {
        if let Some(txid) = self.txid
            && tx.compute_txid() != txid
        {
            return false;
        }
        tx.output.iter().any(|out| out.script_pubkey == self.script)
    }
}

impl fmt::Display for ConfRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.txid {
            Some(txid) => write!(f, "txid={}", txid),
            None => write!(f, "script={}", self.script.to_hex_string()),
        }
    }
}

/// A spend subscriber waits for `outpoint`, whose output script is
/// `script`, to be consumed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpendRequest {
    pub outpoint: OutPoint,
    pub script: ScriptBuf,
}

impl SpendRequest {
    pub fn new(outpoint: OutPoint, script: ScriptBuf) -> Result<Self, Error> {
        if outpoint == OutPoint::null() {
            return Err(Error::InvalidRequest(
                "spend request needs an outpoint".to_string(),
            ));
        }
        if script.is_empty() {
            return Err(Error::InvalidRequest(
                "spend request needs an output script".to_string(),
            ));
        }
        Ok(Self { outpoint, script })
    }

    /// Index of the input of `tx` that spends the watched outpoint.
    pub fn spending_input(&self, tx: &Transaction) -> Option<u32> {
        tx.input
            .iter()
            .position(|input| input.previous_output == self.outpoint)
            .map(|i| i as u32)
    }
}

impl fmt::Display for SpendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outpoint={}", self.outpoint)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxConfirmation {
    pub block_hash: BlockHash,
    pub block_height: u32,
    /// Position of the transaction within its block.
    pub tx_index: u32,
    pub tx: Transaction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpendDetail {
    pub spent_outpoint: OutPoint,
    pub spender_tx: Transaction,
    pub spender_txid: Txid,
    pub spender_input_index: u32,
    pub spending_height: u32,
}

impl SpendDetail {
    pub fn new(spent_outpoint: OutPoint, tx: &Transaction, input_index: u32, height: u32) -> Self {
        Self {
            spent_outpoint,
            spender_txid: tx.compute_txid(),
            spender_tx: tx.clone(),
            spender_input_index: input_index,
            spending_height: height,
        }
    }
}

/// Outcome of a historical confirmation lookup. "In the mempool" is kept
/// apart from "not found": the former means the transaction exists and the
/// tracker will see it confirm while following the tip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxConfStatus {
    FoundFilter,
    NotFoundFilter,
    FoundIndex,
    NotFoundIndex,
    FoundMempool,
    FoundManually,
    NotFoundManually,
}

impl fmt::Display for TxConfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxConfStatus::FoundFilter => "found via compact filters",
            TxConfStatus::NotFoundFilter => "not found via compact filters",
            TxConfStatus::FoundIndex => "found in tx index",
            TxConfStatus::NotFoundIndex => "not found in tx index",
            TxConfStatus::FoundMempool => "found in mempool",
            TxConfStatus::FoundManually => "found by manual scan",
            TxConfStatus::NotFoundManually => "not found by manual scan",
        };
        f.write_str(s)
    }
}

/// A rescan the tracker asks for, covering `start_height..=end_height`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoricalConfDispatch {
    pub request: ConfRequest,
    pub start_height: u32,
    pub end_height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoricalSpendDispatch {
    pub request: SpendRequest,
    pub start_height: u32,
    pub end_height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HistoricalDispatch {
    Conf(HistoricalConfDispatch),
    Spend(HistoricalSpendDispatch),
}

impl fmt::Display for HistoricalDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoricalDispatch::Conf(d) => write!(
                f,
                "conf rescan for {} in [{}, {}]",
                d.request, d.start_height, d.end_height
            ),
            HistoricalDispatch::Spend(d) => write!(
                f,
                "spend rescan for {} in [{}, {}]",
                d.request, d.start_height, d.end_height
            ),
        }
    }
}

type CancelFn = Box<dyn FnOnce() + Send + Sync>;

/// Tracker-side ends of a confirmation subscription.
pub struct ConfirmationSender {
    pub confirmed: mpsc::Sender<TxConfirmation>,
    pub updates: mpsc::Sender<u32>,
    pub negative_conf: mpsc::Sender<i32>,
    pub done: mpsc::Sender<()>,
}

/// Subscriber side of a confirmation subscription. `updates` carries the
/// number of confirmations still missing, `negative_conf` the depth of a
/// reorg that unconfirmed the transaction. Dropping it cancels the
/// subscription.
pub struct ConfirmationEvent {
    pub confirmed: mpsc::Receiver<TxConfirmation>,
    pub updates: mpsc::Receiver<u32>,
    pub negative_conf: mpsc::Receiver<i32>,
    pub done: mpsc::Receiver<()>,
    cancel: Option<CancelFn>,
}

impl ConfirmationEvent {
    pub(crate) fn new(num_confs: u32, cancel: CancelFn) -> (ConfirmationSender, Self) {
        let (confirmed_tx, confirmed) = mpsc::channel(1);
        let (updates_tx, updates) = mpsc::channel(num_confs.max(1) as usize);
        let (negative_conf_tx, negative_conf) = mpsc::channel(1);
        let (done_tx, done) = mpsc::channel(1);
        (
            ConfirmationSender {
                confirmed: confirmed_tx,
                updates: updates_tx,
                negative_conf: negative_conf_tx,
                done: done_tx,
            },
            Self {
                confirmed,
                updates,
                negative_conf,
                done,
                cancel: Some(cancel),
            },
        )
    }

    /// Drops the subscription from the tracker. Later calls do nothing.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ConfirmationEvent {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct SpendSender {
    pub spend: mpsc::Sender<SpendDetail>,
    pub reorg: mpsc::Sender<()>,
    pub done: mpsc::Sender<()>,
}

pub struct SpendEvent {
    pub spend: mpsc::Receiver<SpendDetail>,
    pub reorg: mpsc::Receiver<()>,
    pub done: mpsc::Receiver<()>,
    cancel: Option<CancelFn>,
}

impl SpendEvent {
    pub(crate) fn new(cancel: CancelFn) -> (SpendSender, Self) {
        let (spend_tx, spend) = mpsc::channel(1);
        let (reorg_tx, reorg) = mpsc::channel(1);
        let (done_tx, done) = mpsc::channel(1);
        (
            SpendSender {
                spend: spend_tx,
                reorg: reorg_tx,
                done: done_tx,
            },
            Self {
                spend,
                reorg,
                done,
                cancel: Some(cancel),
            },
        )
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SpendEvent {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct ConfNtfn {
    pub conf_id: u64,
    pub request: ConfRequest,
    pub num_confs: u32,
    pub height_hint: u32,
    pub event: ConfirmationSender,
}

pub struct SpendNtfn {
    pub spend_id: u64,
    pub request: SpendRequest,
    pub height_hint: u32,
    pub event: SpendSender,
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;
    use crate::test_utils::{funding_tx, new_test_script, spend_tx};

    #[test]
    fn conf_request_matching() {
        let script = new_test_script(1);
        let tx = funding_tx(1, &script);
        let other = funding_tx(2, &script);

        let by_txid = ConfRequest::new(Some(tx.compute_txid()), script.clone()).unwrap();
        assert!(by_txid.matches_tx(&tx));
        assert!(!by_txid.matches_tx(&other));

        let by_script = ConfRequest::new(None, script).unwrap();
        assert!(by_script.matches_tx(&tx));
        assert!(by_script.matches_tx(&other));
        assert!(!by_script.matches_tx(&funding_tx(3, &new_test_script(2))));
    }

    #[test]
    fn requests_need_scripts() {
        assert!(ConfRequest::new(None, ScriptBuf::new()).is_err());
        let outpoint = OutPoint::new(Txid::from_byte_array([1; 32]), 0);
        assert!(SpendRequest::new(outpoint, ScriptBuf::new()).is_err());
        assert!(SpendRequest::new(OutPoint::null(), new_test_script(1)).is_err());
    }

    #[test]
    fn spending_input_index() {
        let watched = OutPoint::new(Txid::from_byte_array([9; 32]), 3);
        let other = OutPoint::new(Txid::from_byte_array([8; 32]), 0);
        let request = SpendRequest::new(watched, new_test_script(1)).unwrap();

        let tx = spend_tx(&[other, watched], &[new_test_script(2)]);
        assert_eq!(request.spending_input(&tx), Some(1));
        assert_eq!(request.spending_input(&spend_tx(&[other], &[])), None);
    }

    #[test]
    fn cancel_runs_once() {
        use std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (_sender, mut event) = ConfirmationEvent::new(
            3,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        event.cancel();
        event.cancel();
        drop(event);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_cancels() {
        use std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (_sender, event) = SpendEvent::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        drop(event);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
