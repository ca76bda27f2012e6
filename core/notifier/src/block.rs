use std::fmt;

use bitcoin::{BlockHash, Transaction};

/// A point on the best chain. Once handed to a subscriber an epoch is
/// never mutated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockEpoch {
    pub height: u32,
    pub hash: BlockHash,
}

impl BlockEpoch {
    pub fn new(height: u32, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl fmt::Display for BlockEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

/// A block as seen through the watched-output filter. Disconnected blocks
/// and blocks without relevant activity carry no transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilteredBlock {
    pub hash: BlockHash,
    pub height: u32,
    pub transactions: Vec<Transaction>,
}

impl FilteredBlock {
    pub fn empty(hash: BlockHash, height: u32) -> Self {
        Self {
            hash,
            height,
            transactions: vec![],
        }
    }
}
