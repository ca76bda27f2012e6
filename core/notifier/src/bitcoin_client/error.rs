use bitcoin::Txid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such mempool or blockchain transaction: {0}")]
    NoTxInfo(Txid),
    #[error("Block not found: {0}")]
    BlockNotFound(String),
    #[error("Backend does not support {0}")]
    Unsupported(&'static str),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}
