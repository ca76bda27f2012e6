//! Drives the notifier and the filtered chain view against a simulated
//! chain that mines a block every interval and reorganizes every few
//! blocks. Runs until interrupted.

use std::time::Duration;

use anyhow::{Result, bail};
use notifier::{
    bitcoin_client::{mock::MockBitcoinRpc, types::Capabilities},
    chainview::FilteredChainView,
    config::Config,
    logging,
    notifier::ChainNotifier,
    test_utils::{gen_block, gen_fork, new_test_chain},
    tx_notifier::mock::MockTxNotifier,
};
use tokio::{select, signal, task, time};
use tokio_util::sync::CancellationToken;
use tracing::info;

const BLOCK_INTERVAL: Duration = Duration::from_millis(500);
const REORG_EVERY: u32 = 5;
const REORG_DEPTH: u32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    logging::setup();
    let config = Config::load()?;
    info!("Starting chain simulation with {:?}", config);

    let rpc = MockBitcoinRpc::new(new_test_chain(10)).with_capabilities(Capabilities {
        compact_filters: true,
        tx_index: true,
    });
    let notifier = ChainNotifier::new(
        config.clone(),
        rpc.clone(),
        Box::new(|height, _| MockTxNotifier::new(height)),
    );
    let view = FilteredChainView::new(&config, rpc.clone());
    notifier.start().await?;
    view.start().await?;

    let cancel_token = CancellationToken::new();
    let mut epochs = notifier.register_block_epoch_ntfn(None).await?;
    let epoch_handle = task::spawn(async move {
        while let Some(epoch) = epochs.epochs.recv().await {
            info!("Epoch: {}", epoch);
        }
        info!("Epoch stream closed");
    });

    let (Some(mut new_blocks), Some(mut stale_blocks)) =
        (view.filtered_blocks(), view.disconnected_blocks())
    else {
        bail!("filtered block receivers already taken");
    };
    let view_handle = task::spawn(async move {
        loop {
            select! {
                Some(block) = new_blocks.recv() => {
                    info!("Filtered block connected: {}@{}", block.hash, block.height)
                }
                Some(block) = stale_blocks.recv() => {
                    info!("Filtered block disconnected: {}@{}", block.hash, block.height)
                }
                else => break,
            }
        }
    });

    let miner = {
        let cancel_token = cancel_token.clone();
        async move {
            let mut interval = time::interval(BLOCK_INTERVAL);
            loop {
                select! {
                    _ = cancel_token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let tip = rpc.tip();
                if tip.height % REORG_EVERY == 0 {
                    let fork_height = tip.height - REORG_DEPTH;
                    let fork_hash = rpc.blocks()[fork_height as usize].block_hash();
                    info!("Reorganizing {} blocks from {}", REORG_DEPTH, tip);
                    rpc.reorg(fork_height, gen_fork(fork_hash, fork_height, REORG_DEPTH + 1));
                } else {
                    rpc.connect_block(gen_block(&tip.hash, tip.height + 1, vec![]));
                }
            }
        }
    };

    select! {
        _ = miner => {}
        res = signal::ctrl_c() => {
            res?;
            info!("Interrupted, shutting down");
            cancel_token.cancel();
        }
    }

    notifier.stop().await?;
    view.stop().await?;
    for handle in [epoch_handle, view_handle] {
        handle.await?;
    }
    info!("Goodbye.");
    Ok(())
}
