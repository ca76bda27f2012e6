use std::future::Future;

use bitcoin::{Block, BlockHash, Transaction, Txid, bip158::BlockFilter, block::Header};
use tokio::sync::mpsc;

use super::{
    error::Error,
    types::{Capabilities, ChainNotification, GetBlockVerboseResult, GetRawTransactionVerboseResult},
};

/// The light-client chain backend. Implementations own their transport;
/// every method is a single request with no retries.
pub trait BitcoinRpc: Send + Sync + Clone + 'static {
    fn get_best_block(&self) -> impl Future<Output = Result<(BlockHash, u32), Error>> + Send;

    fn get_block_hash(&self, height: u32) -> impl Future<Output = Result<BlockHash, Error>> + Send;

    fn get_block_header(
        &self,
        hash: &BlockHash,
    ) -> impl Future<Output = Result<Header, Error>> + Send;

    fn get_block_height(&self, hash: &BlockHash)
    -> impl Future<Output = Result<u32, Error>> + Send;

    fn get_block(&self, hash: &BlockHash) -> impl Future<Output = Result<Block, Error>> + Send;

    fn get_block_verbose(
        &self,
        hash: &BlockHash,
    ) -> impl Future<Output = Result<GetBlockVerboseResult, Error>> + Send;

    /// Fails with [`Error::NoTxInfo`] when neither the mempool nor the
    /// transaction index knows `txid`.
    fn get_raw_transaction_verbose(
        &self,
        txid: &Txid,
    ) -> impl Future<Output = Result<GetRawTransactionVerboseResult, Error>> + Send;

    /// Returns `None` when the backend has no filter for the block, which
    /// happens for blocks without any non-coinbase transactions.
    fn get_cfilter(
        &self,
        hash: &BlockHash,
    ) -> impl Future<Output = Result<Option<BlockFilter>, Error>> + Send;

    fn get_filter_block(
        &self,
        hash: &BlockHash,
    ) -> impl Future<Output = Result<Vec<Transaction>, Error>> + Send;

    fn start_rescan(&self, from: &BlockHash) -> impl Future<Output = Result<(), Error>> + Send;

    fn stop_rescan(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Opens a new notification stream. Each caller gets its own receiver.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChainNotification>;

    fn capabilities(&self) -> Capabilities;
}
