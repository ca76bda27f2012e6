use std::time::Duration;

use anyhow::Result;
use bitcoin::{Block, OutPoint, ScriptBuf, Transaction};
use notifier::{
    Error,
    bitcoin_client::{mock::MockBitcoinRpc, types::Capabilities},
    block::{BlockEpoch, FilteredBlock},
    chainview::{FilteredChainView, filter::WatchedOutput},
    config::Config,
    logging,
    test_utils::{
        epoch_of, funding_tx, gen_block, gen_fork, new_random_script, new_test_chain, spend_tx,
    },
};
use tokio::{sync::mpsc, time::timeout};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    blocks: Vec<Block>,
    watched: WatchedOutput,
    spender: Transaction,
}

/// Chain up to `tip` where block 2 creates the watched output and block
/// `spend_height` spends it, next to an unrelated transaction.
fn fixture(tip: u32, spend_height: u32) -> Fixture {
    let script = new_random_script();
    let funding = funding_tx(1, &script);
    let outpoint = OutPoint::new(funding.compute_txid(), 0);
    let spender = spend_tx(&[outpoint], &[new_random_script()]);
    let unrelated = funding_tx(2, &new_random_script());

    let mut blocks = new_test_chain(1);
    blocks.push(gen_block(&blocks[1].block_hash(), 2, vec![funding]));
    while blocks.len() <= tip as usize {
        let height = blocks.len() as u32;
        let prev = blocks[height as usize - 1].block_hash();
        let txs = if height == spend_height {
            vec![unrelated.clone(), spender.clone()]
        } else {
            vec![]
        };
        blocks.push(gen_block(&prev, height, txs));
    }

    Fixture {
        blocks,
        watched: WatchedOutput { outpoint, script },
        spender,
    }
}

async fn start_view(rpc: &MockBitcoinRpc) -> Result<FilteredChainView<MockBitcoinRpc>> {
    logging::setup_test();
    let view = FilteredChainView::new(&Config::default(), rpc.clone());
    view.start().await?;
    Ok(view)
}

async fn next_block(rx: &mut mpsc::Receiver<FilteredBlock>) -> FilteredBlock {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for block")
        .expect("block channel closed")
}

#[tokio::test]
async fn test_connected_block_consumes_watched_outputs() -> Result<()> {
    let f = fixture(5, 6);
    let rpc = MockBitcoinRpc::new(f.blocks.clone());
    let view = start_view(&rpc).await?;
    let mut new_blocks = view.filtered_blocks().expect("receiver");

    view.update_filter(vec![f.watched.clone()], 5)?;
    assert!(view.watched().contains(&f.watched.outpoint));

    let block = gen_block(
        &f.blocks[5].block_hash(),
        6,
        vec![funding_tx(3, &new_random_script()), f.spender.clone()],
    );
    rpc.connect_block(block.clone());

    let filtered = next_block(&mut new_blocks).await;
    assert_eq!(filtered.hash, block.block_hash());
    assert_eq!(filtered.height, 6);
    assert_eq!(filtered.transactions, block.txdata);
    assert!(view.watched().is_empty());
    assert_eq!(view.best_block(), BlockEpoch::new(6, block.block_hash()));

    view.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_disconnected_block_is_empty() -> Result<()> {
    let blocks = new_test_chain(4);
    let rpc = MockBitcoinRpc::new(blocks.clone());
    let view = start_view(&rpc).await?;
    let mut stale_blocks = view.disconnected_blocks().expect("receiver");

    rpc.disconnect_tip();
    let stale = next_block(&mut stale_blocks).await;
    assert_eq!(stale, FilteredBlock::empty(blocks[4].block_hash(), 4));
    assert_eq!(view.best_block(), epoch_of(&blocks, 3));

    view.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_reorg_events_keep_their_order() -> Result<()> {
    let blocks = new_test_chain(5);
    let rpc = MockBitcoinRpc::new(blocks.clone());
    let view = start_view(&rpc).await?;
    let mut new_blocks = view.filtered_blocks().expect("receiver");
    let mut stale_blocks = view.disconnected_blocks().expect("receiver");

    let branch = gen_fork(blocks[3].block_hash(), 3, 3);
    rpc.reorg(3, branch.clone());

    // Nothing from the new branch shows up before the stale blocks are taken.
    assert!(
        timeout(Duration::from_millis(100), new_blocks.recv())
            .await
            .is_err()
    );
    assert_eq!(next_block(&mut stale_blocks).await.height, 5);
    assert_eq!(next_block(&mut stale_blocks).await.height, 4);
    for block in &branch {
        let filtered = next_block(&mut new_blocks).await;
        assert_eq!(filtered.hash, block.block_hash());
    }
    assert_eq!(view.best_block(), BlockEpoch::new(6, branch[2].block_hash()));

    view.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_filter_update_in_the_past_redelivers_spends() -> Result<()> {
    let f = fixture(6, 4);
    let rpc = MockBitcoinRpc::new(f.blocks.clone());
    let view = start_view(&rpc).await?;
    let mut new_blocks = view.filtered_blocks().expect("receiver");

    view.update_filter(vec![f.watched.clone()], 2)?;

    let filtered = next_block(&mut new_blocks).await;
    assert_eq!(filtered.hash, f.blocks[4].block_hash());
    assert_eq!(filtered.height, 4);
    assert_eq!(filtered.transactions, vec![f.spender.clone()]);
    assert!(!view.watched().contains(&f.watched.outpoint));

    // Blocks without spends are not re-delivered.
    assert!(
        timeout(Duration::from_millis(100), new_blocks.recv())
            .await
            .is_err()
    );

    view.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_filter_update_is_a_union() -> Result<()> {
    let rpc = MockBitcoinRpc::new(new_test_chain(3));
    let view = start_view(&rpc).await?;

    let op = |n: u8| WatchedOutput {
        outpoint: OutPoint::new(funding_tx(n, &new_random_script()).compute_txid(), 0),
        script: new_random_script(),
    };
    let (a, b) = (op(1), op(2));
    view.update_filter(vec![a.clone()], 3)?;
    view.update_filter(vec![b.clone(), a.clone()], 3)?;
    assert_eq!(view.watched().len(), 2);
    assert!(view.watched().contains(&a.outpoint));
    assert!(view.watched().contains(&b.outpoint));

    view.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_filter_block_with_compact_filters() -> Result<()> {
    let f = fixture(6, 4);
    let rpc = MockBitcoinRpc::new(f.blocks.clone()).with_capabilities(Capabilities {
        compact_filters: true,
        tx_index: false,
    });
    let view = FilteredChainView::new(&Config::default(), rpc.clone());

    // Nothing watched: answered without touching the backend's blocks.
    let empty = view.filter_block(&f.blocks[4].block_hash()).await?;
    assert_eq!(empty, FilteredBlock::empty(f.blocks[4].block_hash(), 4));
    assert_eq!(rpc.cfilter_fetches(), 0);

    view.watched().add(&[f.watched.clone()]);

    let miss = view.filter_block(&f.blocks[3].block_hash()).await?;
    assert!(miss.transactions.is_empty());
    assert_eq!(rpc.block_fetches(), 0);

    let hit = view.filter_block(&f.blocks[4].block_hash()).await?;
    assert_eq!(hit.height, 4);
    assert_eq!(hit.transactions, vec![f.spender.clone()]);
    assert_eq!(rpc.block_fetches(), 1);
    assert!(view.watched().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_filter_block_without_compact_filters() -> Result<()> {
    let f = fixture(6, 5);
    let rpc = MockBitcoinRpc::new(f.blocks.clone());
    let view = FilteredChainView::new(&Config::default(), rpc.clone());
    view.watched().add(&[f.watched.clone()]);

    let miss = view.filter_block(&f.blocks[4].block_hash()).await?;
    assert!(miss.transactions.is_empty());
    assert!(view.watched().contains(&f.watched.outpoint));

    let hit = view.filter_block(&f.blocks[5].block_hash()).await?;
    assert_eq!(hit.transactions, vec![f.spender]);
    assert_eq!(rpc.block_fetches(), 2);
    assert_eq!(rpc.cfilter_fetches(), 0);

    Ok(())
}

#[tokio::test]
async fn test_failed_start_can_be_retried() -> Result<()> {
    logging::setup_test();
    let blocks = new_test_chain(4);
    let rpc = MockBitcoinRpc::new(blocks.clone());
    let view = FilteredChainView::new(&Config::default(), rpc.clone());
    let mut stale_blocks = view.disconnected_blocks().expect("receiver");

    rpc.set_failing(true);
    assert!(view.start().await.is_err());

    rpc.set_failing(false);
    view.start().await?;
    assert_eq!(rpc.rescan_from(), Some(blocks[4].block_hash()));

    rpc.disconnect_tip();
    let stale = next_block(&mut stale_blocks).await;
    assert_eq!(stale.height, 4);

    view.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_closes_outputs_and_rejects_updates() -> Result<()> {
    let rpc = MockBitcoinRpc::new(new_test_chain(3));
    let view = start_view(&rpc).await?;
    let mut new_blocks = view.filtered_blocks().expect("receiver");
    let mut stale_blocks = view.disconnected_blocks().expect("receiver");
    assert!(view.filtered_blocks().is_none());
    assert!(view.disconnected_blocks().is_none());

    timeout(TIMEOUT, view.stop()).await??;
    view.stop().await?;
    assert!(timeout(TIMEOUT, new_blocks.recv()).await?.is_none());
    assert!(timeout(TIMEOUT, stale_blocks.recv()).await?.is_none());
    assert_eq!(rpc.rescan_from(), None);

    let watched = WatchedOutput {
        outpoint: OutPoint::new(funding_tx(1, &ScriptBuf::new()).compute_txid(), 0),
        script: new_random_script(),
    };
    assert!(matches!(
        view.update_filter(vec![watched], 0),
        Err(Error::ShuttingDown)
    ));
    Ok(())
}
