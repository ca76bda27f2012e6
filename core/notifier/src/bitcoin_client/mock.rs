use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use bitcoin::{
    Block, BlockHash, OutPoint, ScriptBuf, Transaction, Txid,
    bip158::{BlockFilter, BlockFilterWriter},
    block::Header,
    consensus::encode::serialize_hex,
};
use tokio::sync::mpsc;

use super::client::BitcoinRpc;
use super::error::Error;
use super::types::{
    Capabilities, ChainNotification, GetBlockVerboseResult, GetRawTransactionVerboseResult,
};
use crate::block::BlockEpoch;

/// In-memory backend. `blocks[i]` is the block at height `i`; chain
/// mutations are pushed to every subscriber the way a real backend would.
#[derive(Clone, Debug)]
pub struct MockBitcoinRpc {
    blocks: Arc<Mutex<Vec<Block>>>,
    stale_blocks: Arc<Mutex<Vec<(u32, Block)>>>,
    mempool_txs: Arc<Mutex<Vec<Transaction>>>,
    capabilities: Arc<Mutex<Capabilities>>,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ChainNotification>>>>,
    rescan_from: Arc<Mutex<Option<BlockHash>>>,
    failing: Arc<AtomicBool>,
    block_fetches: Arc<AtomicUsize>,
    cfilter_fetches: Arc<AtomicUsize>,
    index_lookups: Arc<AtomicUsize>,
    extra_filter_scripts: Arc<Mutex<HashMap<BlockHash, Vec<ScriptBuf>>>>,
}

impl MockBitcoinRpc {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks: Arc::new(Mutex::new(blocks)),
            stale_blocks: Arc::new(Mutex::new(vec![])),
            mempool_txs: Arc::new(Mutex::new(vec![])),
            capabilities: Arc::new(Mutex::new(Capabilities::default())),
            subscribers: Arc::new(Mutex::new(vec![])),
            rescan_from: Arc::new(Mutex::new(None)),
            failing: Arc::new(AtomicBool::new(false)),
            block_fetches: Arc::new(AtomicUsize::new(0)),
            cfilter_fetches: Arc::new(AtomicUsize::new(0)),
            index_lookups: Arc::new(AtomicUsize::new(0)),
            extra_filter_scripts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        *self.capabilities.lock().unwrap() = capabilities;
        self
    }

    pub fn set_mempool(&self, txs: Vec<Transaction>) {
        *self.mempool_txs.lock().unwrap() = txs;
    }

    /// Makes every block and filter fetch, and starting a rescan, fail
    /// until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes the filter served for `hash` match `script` as well, whatever
    /// the block holds.
    pub fn add_filter_script(&self, hash: BlockHash, script: ScriptBuf) {
        self.extra_filter_scripts
            .lock()
            .unwrap()
            .entry(hash)
            .or_default()
            .push(script);
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.lock().unwrap().clone()
    }

    pub fn tip(&self) -> BlockEpoch {
        let blocks = self.blocks.lock().unwrap();
        let height = blocks.len() as u32 - 1;
        BlockEpoch::new(height, blocks[height as usize].block_hash())
    }

    pub fn block_fetches(&self) -> usize {
        self.block_fetches.load(Ordering::SeqCst)
    }

    pub fn cfilter_fetches(&self) -> usize {
        self.cfilter_fetches.load(Ordering::SeqCst)
    }

    pub fn index_lookups(&self) -> usize {
        self.index_lookups.load(Ordering::SeqCst)
    }

    pub fn rescan_from(&self) -> Option<BlockHash> {
        *self.rescan_from.lock().unwrap()
    }

    /// Extends the chain by one block and notifies subscribers.
    pub fn connect_block(&self, block: Block) {
        let height = {
            let mut blocks = self.blocks.lock().unwrap();
            blocks.push(block.clone());
            blocks.len() as u32 - 1
        };
        self.notify(ChainNotification::BlockConnected {
            height,
            header: block.header,
            txs: block.txdata,
        });
    }

    /// Pops the tip and notifies subscribers. The block stays reachable
    /// by hash.
    pub fn disconnect_tip(&self) -> Option<Block> {
        let (height, block) = {
            let mut blocks = self.blocks.lock().unwrap();
            let block = blocks.pop()?;
            (blocks.len() as u32, block)
        };
        self.stale_blocks.lock().unwrap().push((height, block.clone()));
        self.notify(ChainNotification::BlockDisconnected {
            height,
            header: block.header,
        });
        Some(block)
    }

    /// Disconnects down to `fork_height`, then connects `branch`.
    pub fn reorg(&self, fork_height: u32, branch: Vec<Block>) {
        while self.tip().height > fork_height {
            self.disconnect_tip();
        }
        for block in branch {
            self.connect_block(block);
        }
    }

    /// Swaps the chain without telling anyone, as a backend that dropped
    /// its notifications would.
    pub fn replace_blocks(&self, blocks: Vec<Block>) {
        let old = std::mem::replace(&mut *self.blocks.lock().unwrap(), blocks);
        self.stale_blocks
            .lock()
            .unwrap()
            .extend(old.into_iter().enumerate().map(|(h, b)| (h as u32, b)));
    }

    pub fn notify(&self, notification: ChainNotification) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    fn find_by_hash(&self, hash: &BlockHash) -> Option<(u32, Block)> {
        let blocks = self.blocks.lock().unwrap();
        if let Some((height, block)) = blocks
            .iter()
            .enumerate()
            .find(|(_, b)| b.block_hash() == *hash)
        {
            return Some((height as u32, block.clone()));
        }
        self.stale_blocks
            .lock()
            .unwrap()
            .iter()
            .find(|(_, b)| b.block_hash() == *hash)
            .cloned()
    }

    fn find_block(&self, hash: &BlockHash) -> Result<(u32, Block), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Unexpected(format!("connection refused fetching {hash}")));
        }
        self.find_by_hash(hash)
            .ok_or_else(|| Error::BlockNotFound(hash.to_string()))
    }

    fn script_for_outpoint(blocks: &[Block], outpoint: &OutPoint) -> ScriptBuf {
        blocks
            .iter()
            .flat_map(|b| b.txdata.iter())
            .find(|tx| tx.compute_txid() == outpoint.txid)
            .and_then(|tx| tx.output.get(outpoint.vout as usize))
            .map(|out| out.script_pubkey.clone())
            .unwrap_or_default()
    }
}

impl BitcoinRpc for MockBitcoinRpc {
    async fn get_best_block(&self) -> Result<(BlockHash, u32), Error> {
        let tip = self.tip();
        Ok((tip.hash, tip.height))
    }

    async fn get_block_hash(&self, height: u32) -> Result<BlockHash, Error> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .get(height as usize)
            .map(|b| b.block_hash())
            .ok_or_else(|| Error::BlockNotFound(format!("no block at height {height}")))
    }

    async fn get_block_header(&self, hash: &BlockHash) -> Result<Header, Error> {
        self.find_by_hash(hash)
            .map(|(_, b)| b.header)
            .ok_or_else(|| Error::BlockNotFound(hash.to_string()))
    }

    async fn get_block_height(&self, hash: &BlockHash) -> Result<u32, Error> {
        self.find_by_hash(hash)
            .map(|(height, _)| height)
            .ok_or_else(|| Error::BlockNotFound(hash.to_string()))
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<Block, Error> {
        self.block_fetches.fetch_add(1, Ordering::SeqCst);
        self.find_block(hash).map(|(_, b)| b)
    }

    async fn get_block_verbose(&self, hash: &BlockHash) -> Result<GetBlockVerboseResult, Error> {
        let (height, block) = self.find_block(hash)?;
        Ok(GetBlockVerboseResult {
            hash: *hash,
            height,
            tx: block.txdata.iter().map(|tx| tx.compute_txid()).collect(),
        })
    }

    async fn get_raw_transaction_verbose(
        &self,
        txid: &Txid,
    ) -> Result<GetRawTransactionVerboseResult, Error> {
        self.index_lookups.fetch_add(1, Ordering::SeqCst);

        if let Some(tx) = self
            .mempool_txs
            .lock()
            .unwrap()
            .iter()
            .find(|tx| tx.compute_txid() == *txid)
        {
            return Ok(GetRawTransactionVerboseResult {
                txid: *txid,
                hex: serialize_hex(tx),
                blockhash: None,
                confirmations: None,
            });
        }

        if !self.capabilities.lock().unwrap().tx_index {
            return Err(Error::NoTxInfo(*txid));
        }

        let blocks = self.blocks.lock().unwrap();
        let tip = blocks.len() as u32 - 1;
        for (height, block) in blocks.iter().enumerate() {
            if let Some(tx) = block.txdata.iter().find(|tx| tx.compute_txid() == *txid) {
                return Ok(GetRawTransactionVerboseResult {
                    txid: *txid,
                    hex: serialize_hex(tx),
                    blockhash: Some(block.block_hash()),
                    confirmations: Some(tip - height as u32 + 1),
                });
            }
        }
        Err(Error::NoTxInfo(*txid))
    }

    async fn get_cfilter(&self, hash: &BlockHash) -> Result<Option<BlockFilter>, Error> {
        if !self.capabilities.lock().unwrap().compact_filters {
            return Err(Error::Unsupported("compact filters"));
        }
        self.cfilter_fetches.fetch_add(1, Ordering::SeqCst);

        let (_, block) = self.find_block(hash)?;
        if block.txdata.len() <= 1 {
            return Ok(None);
        }

        let blocks = self.blocks.lock().unwrap();
        let extra = self.extra_filter_scripts.lock().unwrap();
        let mut content = vec![];
        {
            let mut writer = BlockFilterWriter::new(&mut content, &block);
            writer.add_output_scripts();
            writer
                .add_input_scripts(|outpoint| Ok(Self::script_for_outpoint(&blocks, outpoint)))
                .map_err(|e| Error::Unexpected(format!("unable to build filter for {hash}: {e}")))?;
            for script in extra.get(hash).into_iter().flatten() {
                writer.add_element(script.as_bytes());
            }
            writer
                .finish()
                .map_err(|e| Error::Unexpected(format!("unable to build filter for {hash}: {e}")))?;
        }
        Ok(Some(BlockFilter::new(&content)))
    }

    async fn get_filter_block(&self, hash: &BlockHash) -> Result<Vec<Transaction>, Error> {
        self.block_fetches.fetch_add(1, Ordering::SeqCst);
        self.find_block(hash).map(|(_, b)| b.txdata)
    }

    async fn start_rescan(&self, from: &BlockHash) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Unexpected(format!("connection refused rescanning from {from}")));
        }
        *self.rescan_from.lock().unwrap() = Some(*from);
        Ok(())
    }

    async fn stop_rescan(&self) -> Result<(), Error> {
        *self.rescan_from.lock().unwrap() = None;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChainNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn capabilities(&self) -> Capabilities {
        *self.capabilities.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{funding_tx, gen_block, new_test_chain, new_test_script, spend_tx};

    #[tokio::test]
    async fn filter_matches_output_scripts() {
        let mut blocks = new_test_chain(2);
        let script = new_test_script(7);
        let tx = funding_tx(1, &script);
        blocks.push(gen_block(&blocks[2].block_hash(), 3, vec![tx]));
        let hash = blocks[3].block_hash();
        let rpc = MockBitcoinRpc::new(blocks).with_capabilities(Capabilities {
            compact_filters: true,
            tx_index: false,
        });

        let filter = rpc.get_cfilter(&hash).await.unwrap().unwrap();
        assert!(
            filter
                .match_any(&hash, std::iter::once(script.as_bytes()))
                .unwrap()
        );
        assert!(
            !filter
                .match_any(&hash, std::iter::once(new_test_script(8).as_bytes()))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn filter_matches_spent_and_added_scripts() {
        let mut blocks = new_test_chain(1);
        let script = new_test_script(7);
        let funding = funding_tx(1, &script);
        let spender = spend_tx(&[OutPoint::new(funding.compute_txid(), 0)], &[new_test_script(8)]);
        blocks.push(gen_block(&blocks[1].block_hash(), 2, vec![funding]));
        blocks.push(gen_block(&blocks[2].block_hash(), 3, vec![spender]));
        let hash = blocks[3].block_hash();
        let rpc = MockBitcoinRpc::new(blocks).with_capabilities(Capabilities {
            compact_filters: true,
            tx_index: false,
        });

        let filter = rpc.get_cfilter(&hash).await.unwrap().unwrap();
        assert!(
            filter
                .match_any(&hash, std::iter::once(script.as_bytes()))
                .unwrap()
        );

        let extra = new_test_script(9);
        rpc.add_filter_script(hash, extra.clone());
        let filter = rpc.get_cfilter(&hash).await.unwrap().unwrap();
        assert!(
            filter
                .match_any(&hash, std::iter::once(extra.as_bytes()))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn coinbase_only_block_has_no_filter() {
        let blocks = new_test_chain(2);
        let hash = blocks[1].block_hash();
        let rpc = MockBitcoinRpc::new(blocks).with_capabilities(Capabilities {
            compact_filters: true,
            tx_index: false,
        });
        assert!(rpc.get_cfilter(&hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn raw_transaction_requires_index() {
        let mut blocks = new_test_chain(1);
        let tx = funding_tx(1, &new_test_script(1));
        let txid = tx.compute_txid();
        blocks.push(gen_block(&blocks[1].block_hash(), 2, vec![tx]));
        let rpc = MockBitcoinRpc::new(blocks);

        match rpc.get_raw_transaction_verbose(&txid).await {
            Err(Error::NoTxInfo(id)) => assert_eq!(id, txid),
            other => panic!("expected NoTxInfo, got {:?}", other),
        }

        let rpc = rpc.with_capabilities(Capabilities {
            compact_filters: false,
            tx_index: true,
        });
        let res = rpc.get_raw_transaction_verbose(&txid).await.unwrap();
        assert_eq!(res.confirmations, Some(1));
    }

    #[tokio::test]
    async fn reorg_notifies_disconnects_then_connects() {
        let blocks = new_test_chain(3);
        let rpc = MockBitcoinRpc::new(blocks.clone());
        let mut rx = rpc.subscribe();

        let branch = crate::test_utils::gen_fork(blocks[1].block_hash(), 1, 3);
        rpc.reorg(1, branch);

        let mut seen = vec![];
        while let Ok(n) = rx.try_recv() {
            seen.push(match n {
                ChainNotification::BlockConnected { height, .. } => height as i64,
                ChainNotification::BlockDisconnected { height, .. } => -(height as i64),
                other => panic!("unexpected notification {}", other),
            });
        }
        assert_eq!(seen, vec![-3, -2, 2, 3, 4]);
        assert_eq!(rpc.tip().height, 4);
    }
}
