use bitcoin::{BlockHash, Txid, bip158};
use thiserror::Error;

use crate::bitcoin_client;

#[derive(Error, Debug)]
pub enum Error {
    #[error("chain notifier shutting down")]
    ShuttingDown,
    #[error("chain notifier not started")]
    NotStarted,
    #[error("block event queue stopped")]
    QueueStopped,
    #[error("backend error: {0}")]
    Backend(#[from] bitcoin_client::Error),
    #[error("tx notifier error: {0:#}")]
    TxNotifier(anyhow::Error),
    #[error("unable to query filter for block {hash}: {source}")]
    Filter {
        hash: BlockHash,
        source: bip158::Error,
    },
    #[error("filter for block {hash} (height {height}) matched, but no transaction did")]
    FilterMatchMiss { hash: BlockHash, height: u32 },
    #[error("unable to locate tx {txid} in block {hash}")]
    TxNotInBlock { txid: Txid, hash: BlockHash },
    #[error("unable to decode transaction {txid}: {reason}")]
    Decode { txid: Txid, reason: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no common ancestor between {0} and {1}")]
    NoCommonAncestor(BlockHash, BlockHash),
    #[error("client best height {client} is above notifier best height {best}")]
    ClientAhead { client: u32, best: u32 },
}
