use std::fmt;

use bitcoin::{BlockHash, Transaction, Txid, block::Header};

use crate::block::BlockEpoch;

/// Optional indexes the backend can serve. The historical resolver picks
/// its strategies from these.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub compact_filters: bool,
    pub tx_index: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetBlockVerboseResult {
    pub hash: BlockHash,
    pub height: u32,
    pub tx: Vec<Txid>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetRawTransactionVerboseResult {
    pub txid: Txid,
    /// Consensus-encoded transaction, hex.
    pub hex: String,
    /// Set once the transaction is in a block; `None` means mempool.
    pub blockhash: Option<BlockHash>,
    pub confirmations: Option<u32>,
}

/// Chain updates pushed by the backend to each subscriber, in chain order.
#[derive(Clone, Debug)]
pub enum ChainNotification {
    BlockConnected {
        height: u32,
        header: Header,
        txs: Vec<Transaction>,
    },
    BlockDisconnected {
        height: u32,
        header: Header,
    },
    RelevantTx {
        tx: Transaction,
        block: Option<BlockEpoch>,
    },
}

impl fmt::Display for ChainNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainNotification::BlockConnected { height, header, txs } => write!(
                f,
                "Block connected: height={} hash={} txs={}",
                height,
                header.block_hash(),
                txs.len()
            ),
            ChainNotification::BlockDisconnected { height, header } => write!(
                f,
                "Block disconnected: height={} hash={}",
                height,
                header.block_hash()
            ),
            ChainNotification::RelevantTx { tx, block } => match block {
                Some(block) => write!(f, "Relevant tx {} in block {}", tx.compute_txid(), block),
                None => write!(f, "Relevant tx {} in mempool", tx.compute_txid()),
            },
        }
    }
}
