use std::time::Duration;

use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, WPubkeyHash, Witness,
    absolute::LockTime,
    block::{Header, Version},
    hashes::Hash,
    transaction,
};
use rand::RngCore;
use tokio::time::sleep;

use crate::block::BlockEpoch;

pub fn new_test_script(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20]))
}

pub fn new_random_script() -> ScriptBuf {
    let mut bytes = [0u8; 20];
    rand::rng().fill_bytes(&mut bytes);
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(bytes))
}

pub fn coinbase_tx(height: u32) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            // height in the script sig keeps coinbase txids distinct
            script_sig: ScriptBuf::from_bytes(height.to_le_bytes().to_vec()),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50 * 100_000_000),
            script_pubkey: new_test_script(0xff),
        }],
    }
}

/// A transaction spending `prevouts` into one output per script.
pub fn spend_tx(prevouts: &[OutPoint], outputs: &[ScriptBuf]) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: prevouts
            .iter()
            .map(|prevout| TxIn {
                previous_output: *prevout,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|script| TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: script.clone(),
            })
            .collect(),
    }
}

/// A transaction paying to `script` out of nowhere. Its input references
/// an outpoint no block creates.
pub fn funding_tx(seed: u8, script: &ScriptBuf) -> Transaction {
    let prevout = OutPoint::new(bitcoin::Txid::from_byte_array([seed; 32]), 0);
    spend_tx(&[prevout], std::slice::from_ref(script))
}

pub fn gen_block_with_nonce(
    prev_hash: &BlockHash,
    height: u32,
    nonce: u32,
    txs: Vec<Transaction>,
) -> Block {
    let mut txdata = vec![coinbase_tx(height)];
    txdata.extend(txs);

    let mut block = Block {
        header: Header {
            version: Version::ONE,
            prev_blockhash: *prev_hash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: height,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce,
        },
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

pub fn gen_block(prev_hash: &BlockHash, height: u32, txs: Vec<Transaction>) -> Block {
    gen_block_with_nonce(prev_hash, height, 0, txs)
}

/// Empty blocks at heights `start..end`, chained onto `prev_hash`.
pub fn gen_blocks(start: u32, end: u32, prev_hash: BlockHash) -> Vec<Block> {
    let mut blocks = vec![];
    let mut prev = prev_hash;

    for height in start..end {
        let block = gen_block(&prev, height, vec![]);
        prev = block.block_hash();
        blocks.push(block);
    }

    blocks
}

/// A competing branch of `len` blocks on top of `fork_hash`, which sits at
/// `fork_height`. A random nonce keeps its hashes apart from any other
/// branch built on the same parent.
pub fn gen_fork(fork_hash: BlockHash, fork_height: u32, len: u32) -> Vec<Block> {
    let nonce = rand::rng().next_u32() | 1;
    let mut blocks = vec![];
    let mut prev = fork_hash;

    for height in fork_height + 1..=fork_height + len {
        let block = gen_block_with_nonce(&prev, height, nonce, vec![]);
        prev = block.block_hash();
        blocks.push(block);
    }

    blocks
}

/// Blocks at heights `0..=tip_height`.
pub fn new_test_chain(tip_height: u32) -> Vec<Block> {
    gen_blocks(0, tip_height + 1, BlockHash::all_zeros())
}

pub fn epoch_of(blocks: &[Block], height: u32) -> BlockEpoch {
    BlockEpoch::new(height, blocks[height as usize].block_hash())
}

/// Polls `f` until it holds, giving up after `timeout`.
pub async fn wait_until<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
