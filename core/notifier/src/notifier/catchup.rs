use bitcoin::BlockHash;

use crate::{bitcoin_client::BitcoinRpc, block::BlockEpoch, error::Error};

/// Epochs for heights `(from, to]` on the backend's current chain.
pub async fn missed_blocks<C: BitcoinRpc>(
    backend: &C,
    from: u32,
    to: u32,
) -> Result<Vec<BlockEpoch>, Error> {
    if from > to {
        return Err(Error::ClientAhead {
            client: from,
            best: to,
        });
    }

    let mut missed = Vec::with_capacity((to - from) as usize);
    for height in from + 1..=to {
        let hash = backend.get_block_hash(height).await?;
        missed.push(BlockEpoch::new(height, hash));
    }
    Ok(missed)
}

/// The epochs a subscriber whose last seen block is `client_best` has to
/// be sent to reach `best_height`. When the backend keeps stale blocks, a
/// client sitting on a reorged-away block is caught up from the fork point.
pub async fn client_missed_blocks<C: BitcoinRpc>(
    backend: &C,
    client_best: BlockEpoch,
    best_height: u32,
    backend_stores_reorgs: bool,
) -> Result<Vec<BlockEpoch>, Error> {
    let mut start_height = client_best.height;
    if backend_stores_reorgs && client_best.height <= best_height {
        let chain_hash = backend.get_block_hash(client_best.height).await?;
        let chain_block = BlockEpoch::new(client_best.height, chain_hash);
        start_height = common_ancestor(backend, client_best, chain_block)
            .await?
            .height;
    }
    missed_blocks(backend, start_height, best_height).await
}

/// Walks both blocks back through their headers until they meet.
pub async fn common_ancestor<C: BitcoinRpc>(
    backend: &C,
    mut a: BlockEpoch,
    mut b: BlockEpoch,
) -> Result<BlockEpoch, Error> {
    let (start_a, start_b) = (a.hash, b.hash);
    while a.hash != b.hash {
        if a.height == 0 && b.height == 0 {
            return Err(Error::NoCommonAncestor(start_a, start_b));
        }
        if a.height >= b.height {
            a = parent(backend, &a).await?;
        } else {
            b = parent(backend, &b).await?;
        }
    }
    Ok(a)
}

async fn parent<C: BitcoinRpc>(backend: &C, epoch: &BlockEpoch) -> Result<BlockEpoch, Error> {
    let header = backend.get_block_header(&epoch.hash).await?;
    Ok(BlockEpoch::new(epoch.height - 1, header.prev_blockhash))
}

/// Hash of the block below `tip`. Stale tips are resolved through their
/// own header when the backend keeps them, since the block at
/// `tip.height - 1` on the current chain may belong to another branch.
pub async fn parent_hash<C: BitcoinRpc>(
    backend: &C,
    tip: &BlockEpoch,
    backend_stores_reorgs: bool,
) -> Result<BlockHash, Error> {
    if backend_stores_reorgs {
        Ok(backend.get_block_header(&tip.hash).await?.prev_blockhash)
    } else {
        Ok(backend.get_block_hash(tip.height - 1).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitcoin_client::mock::MockBitcoinRpc,
        test_utils::{epoch_of, gen_fork, new_test_chain},
    };

    #[tokio::test]
    async fn missed_blocks_covers_half_open_range() {
        let blocks = new_test_chain(10);
        let rpc = MockBitcoinRpc::new(blocks.clone());

        let missed = missed_blocks(&rpc, 4, 7).await.unwrap();
        assert_eq!(
            missed,
            vec![epoch_of(&blocks, 5), epoch_of(&blocks, 6), epoch_of(&blocks, 7)]
        );
        assert!(missed_blocks(&rpc, 7, 7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_ahead_is_an_error() {
        let blocks = new_test_chain(5);
        let rpc = MockBitcoinRpc::new(blocks);

        match missed_blocks(&rpc, 6, 5).await {
            Err(Error::ClientAhead { client: 6, best: 5 }) => {}
            other => panic!("expected ClientAhead, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stale_client_restarts_from_fork() {
        let blocks = new_test_chain(6);
        let rpc = MockBitcoinRpc::new(blocks.clone());
        let stale_client = epoch_of(&blocks, 5);

        let mut branch = blocks[..=3].to_vec();
        branch.extend(gen_fork(blocks[3].block_hash(), 3, 4));
        rpc.replace_blocks(branch.clone());

        let missed = client_missed_blocks(&rpc, stale_client, 7, true)
            .await
            .unwrap();
        let heights: Vec<u32> = missed.iter().map(|e| e.height).collect();
        assert_eq!(heights, vec![4, 5, 6, 7]);
        assert_eq!(missed[0], epoch_of(&branch, 4));

        let missed = client_missed_blocks(&rpc, stale_client, 7, false)
            .await
            .unwrap();
        let heights: Vec<u32> = missed.iter().map(|e| e.height).collect();
        assert_eq!(heights, vec![6, 7]);
    }

    #[tokio::test]
    async fn common_ancestor_handles_uneven_heights() {
        let blocks = new_test_chain(5);
        let fork = gen_fork(blocks[2].block_hash(), 2, 5);
        let mut all = blocks.clone();
        all.truncate(3);
        all.extend(fork.clone());
        let rpc = MockBitcoinRpc::new(blocks.clone());
        rpc.replace_blocks(all);

        let ancestor = common_ancestor(
            &rpc,
            epoch_of(&blocks, 5),
            BlockEpoch::new(7, fork[4].block_hash()),
        )
        .await
        .unwrap();
        assert_eq!(ancestor, epoch_of(&blocks, 2));
    }
}
