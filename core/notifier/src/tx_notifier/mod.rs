//! The height-indexed transaction tracker the chain notifier feeds. It owns
//! every confirmation and spend subscription and decides when each one
//! fires; the notifier only tells it about the chain.

use anyhow::Result;
use bitcoin::{BlockHash, Transaction};

use crate::{
    error::Error,
    notifier::types::{
        ConfNtfn, ConfRequest, HistoricalConfDispatch, HistoricalDispatch,
        HistoricalSpendDispatch, SpendDetail, SpendNtfn, SpendRequest, TxConfirmation,
    },
};

pub mod mock;

/// Result of registering a confirmation subscription. A dispatch is
/// returned when the height hint is at or below the tracker's height, so
/// the transaction may already be in the chain.
#[derive(Debug)]
pub struct ConfRegistration {
    pub historical_dispatch: Option<HistoricalConfDispatch>,
    pub height: u32,
}

#[derive(Debug)]
pub struct SpendRegistration {
    pub historical_dispatch: Option<HistoricalSpendDispatch>,
    pub height: u32,
}

pub trait TxNotifier: Send + Sync + 'static {
    fn register_conf(&self, ntfn: ConfNtfn) -> Result<ConfRegistration>;

    fn register_spend(&self, ntfn: SpendNtfn) -> Result<SpendRegistration>;

    fn cancel_conf(&self, request: &ConfRequest, conf_id: u64);

    fn cancel_spend(&self, request: &SpendRequest, spend_id: u64);

    /// Completes a historical confirmation rescan. `None` means the
    /// transaction was not found in the scanned range.
    fn update_conf_details(
        &self,
        request: &ConfRequest,
        details: Option<TxConfirmation>,
    ) -> Result<()>;

    fn update_spend_details(&self, request: &SpendRequest, details: Option<SpendDetail>)
    -> Result<()>;

    fn connect_tip(&self, hash: &BlockHash, height: u32, txs: &[Transaction]) -> Result<()>;

    fn disconnect_tip(&self, height: u32) -> Result<()>;

    /// Called after every connected block, once epoch subscribers have
    /// been notified.
    fn notify_height(&self, height: u32) -> Result<()>;

    fn process_relevant_spend_tx(&self, tx: &Transaction, height: u32) -> Result<()>;

    /// A historical rescan failed and will not be retried.
    fn rescan_failed(&self, _dispatch: &HistoricalDispatch, _err: &Error) {}

    fn tear_down(&self);
}
