//! Answers "did this already happen?" for subscriptions whose height hint
//! lies in the past. Strategies, cheapest first:
//!
//! 1. walk the block range backwards matching compact filters, fetching
//!    only blocks whose filter matches;
//! 2. ask the backend's transaction index (txid requests only);
//! 3. fetch and scan every block in the range.

use std::{collections::HashSet, sync::Arc};

use bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid, consensus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::{
    bitcoin_client::{self, BitcoinRpc, types::Capabilities},
    error::Error,
    tx_notifier::TxNotifier,
};

use super::types::{
    ConfRequest, HistoricalDispatch, SpendDetail, SpendRequest, TxConfStatus, TxConfirmation,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    FilterScan,
    TxIndex,
    ManualScan,
}

/// Filters never miss a script they were built over, so a filter scan is
/// final whichever way it goes. The index is only useful for txid
/// requests and falls back to a manual scan when the lookup itself fails.
pub fn select_conf_strategies(request: &ConfRequest, capabilities: Capabilities) -> Vec<Strategy> {
    if capabilities.compact_filters {
        vec![Strategy::FilterScan]
    } else if request.txid.is_some() && capabilities.tx_index {
        vec![Strategy::TxIndex, Strategy::ManualScan]
    } else {
        vec![Strategy::ManualScan]
    }
}

pub fn select_spend_strategies(capabilities: Capabilities) -> Vec<Strategy> {
    if capabilities.compact_filters {
        vec![Strategy::FilterScan]
    } else {
        vec![Strategy::ManualScan]
    }
}

#[derive(Clone)]
pub struct HistoricalResolver<C> {
    backend: C,
    capabilities: Capabilities,
    quit: CancellationToken,
}

impl<C: BitcoinRpc> HistoricalResolver<C> {
    pub fn new(backend: C, capabilities: Capabilities, quit: CancellationToken) -> Self {
        Self {
            backend,
            capabilities,
            quit,
        }
    }

    fn check_quit(&self) -> Result<(), Error> {
        if self.quit.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    pub async fn conf_details(
        &self,
        request: &ConfRequest,
        start_height: u32,
        end_height: u32,
    ) -> Result<(Option<TxConfirmation>, TxConfStatus), Error> {
        for strategy in select_conf_strategies(request, self.capabilities) {
            match strategy {
                Strategy::FilterScan => {
                    let details = self
                        .conf_details_from_filters(request, start_height, end_height)
                        .await?;
                    let status = if details.is_some() {
                        TxConfStatus::FoundFilter
                    } else {
                        TxConfStatus::NotFoundFilter
                    };
                    return Ok((details, status));
                }
                Strategy::TxIndex => {
                    let Some(txid) = request.txid else {
                        continue;
                    };
                    match self.conf_details_from_tx_index(request, txid).await {
                        Ok(res) => return Ok(res),
                        Err(Error::ShuttingDown) => return Err(Error::ShuttingDown),
                        Err(e) => debug!(
                            "Unable to determine confirmation of {} through the backend's tx index ({}), scanning manually",
                            request, e
                        ),
                    }
                }
                Strategy::ManualScan => {
                    let details = self
                        .conf_details_manually(request, start_height, end_height)
                        .await?;
                    let status = if details.is_some() {
                        TxConfStatus::FoundManually
                    } else {
                        TxConfStatus::NotFoundManually
                    };
                    return Ok((details, status));
                }
            }
        }
        Ok((None, TxConfStatus::NotFoundManually))
    }

    async fn conf_details_from_filters(
        &self,
        request: &ConfRequest,
        start_height: u32,
        end_height: u32,
    ) -> Result<Option<TxConfirmation>, Error> {
        // Matched blocks with no output paying the script, and the
        // outpoints they spend.
        let mut unexplained = vec![];
        let mut funded = HashSet::new();

        for height in (start_height..=end_height).rev() {
            self.check_quit()?;

            let hash = self.backend.get_block_hash(height).await?;
            if !self.filter_matches(&hash, &request.script).await? {
                continue;
            }

            debug!("Filter for block {} at height {} matched {}", hash, height, request);
            let block = self.backend.get_block(&hash).await?;
            if let Some(details) = find_confirmation(request, &block, hash, height) {
                return Ok(Some(details));
            }

            // Script reuse, or a block spending an output paying the script.
            let paid = outputs_paying(&block, &request.script);
            if paid.is_empty() {
                trace!("Filter match at height {} pays nothing to {}", height, request);
                unexplained.push((height, hash, spent_outpoints(&block)));
            }
            funded.extend(paid);
        }

        for (height, hash, spent) in unexplained {
            if spent.iter().any(|outpoint| funded.contains(outpoint)) {
                continue;
            }
            if !self.spends_script(&spent, &request.script).await? {
                return Err(Error::FilterMatchMiss { hash, height });
            }
        }
        Ok(None)
    }

    /// Whether any of `spent` paid to `script`. Outputs can only be looked
    /// up through the transaction index; without one a spend is assumed.
    async fn spends_script(
        &self,
        spent: &[OutPoint],
        script: &bitcoin::Script,
    ) -> Result<bool, Error> {
        if spent.is_empty() {
            return Ok(false);
        }
        if !self.capabilities.tx_index {
            return Ok(true);
        }

        for outpoint in spent {
            self.check_quit()?;

            let res = match self.backend.get_raw_transaction_verbose(&outpoint.txid).await {
                Ok(res) => res,
                Err(bitcoin_client::Error::NoTxInfo(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let tx = decode_tx(outpoint.txid, &res.hex)?;
            if tx
                .output
                .get(outpoint.vout as usize)
                .is_some_and(|out| out.script_pubkey.as_script() == script)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn conf_details_from_tx_index(
        &self,
        request: &ConfRequest,
        txid: Txid,
    ) -> Result<(Option<TxConfirmation>, TxConfStatus), Error> {
        self.check_quit()?;

        let res = match self.backend.get_raw_transaction_verbose(&txid).await {
            Ok(res) => res,
            Err(bitcoin_client::Error::NoTxInfo(_)) => {
                return Ok((None, TxConfStatus::NotFoundIndex));
            }
            Err(e) => return Err(e.into()),
        };

        let Some(block_hash) = res.blockhash else {
            debug!("{} found in mempool", request);
            return Ok((None, TxConfStatus::FoundMempool));
        };

        let block = self.backend.get_block_verbose(&block_hash).await?;
        let Some(tx_index) = block.tx.iter().position(|id| *id == txid) else {
            return Err(Error::TxNotInBlock {
                txid,
                hash: block_hash,
            });
        };

        let tx = decode_tx(txid, &res.hex)?;

        Ok((
            Some(TxConfirmation {
                block_hash,
                block_height: block.height,
                tx_index: tx_index as u32,
                tx,
            }),
            TxConfStatus::FoundIndex,
        ))
    }

    async fn conf_details_manually(
        &self,
        request: &ConfRequest,
        start_height: u32,
        end_height: u32,
    ) -> Result<Option<TxConfirmation>, Error> {
        for height in (start_height..=end_height).rev() {
            self.check_quit()?;

            let hash = self.backend.get_block_hash(height).await?;
            let block = self.backend.get_block(&hash).await?;
            if let Some(details) = find_confirmation(request, &block, hash, height) {
                return Ok(Some(details));
            }
        }
        Ok(None)
    }

    pub async fn spend_details(
        &self,
        request: &SpendRequest,
        start_height: u32,
        end_height: u32,
    ) -> Result<Option<SpendDetail>, Error> {
        for strategy in select_spend_strategies(self.capabilities) {
            match strategy {
                Strategy::FilterScan => {
                    return self
                        .spend_details_from_filters(request, start_height, end_height)
                        .await;
                }
                Strategy::ManualScan => {
                    return self
                        .spend_details_manually(request, start_height, end_height)
                        .await;
                }
                Strategy::TxIndex => continue,
            }
        }
        Ok(None)
    }

    async fn spend_details_from_filters(
        &self,
        request: &SpendRequest,
        start_height: u32,
        end_height: u32,
    ) -> Result<Option<SpendDetail>, Error> {
        for height in (start_height..=end_height).rev() {
            self.check_quit()?;

            let hash = self.backend.get_block_hash(height).await?;
            if !self.filter_matches(&hash, &request.script).await? {
                continue;
            }

            // The block creating the output matches too.
            let block = self.backend.get_block(&hash).await?;
            match find_spend(request, &block, height) {
                Some(details) => return Ok(Some(details)),
                None => trace!("Filter match at height {} holds no spend of {}", height, request),
            }
        }
        Ok(None)
    }

    async fn spend_details_manually(
        &self,
        request: &SpendRequest,
        start_height: u32,
        end_height: u32,
    ) -> Result<Option<SpendDetail>, Error> {
        for height in (start_height..=end_height).rev() {
            self.check_quit()?;

            let hash = self.backend.get_block_hash(height).await?;
            let block = self.backend.get_block(&hash).await?;
            if let Some(details) = find_spend(request, &block, height) {
                return Ok(Some(details));
            }
        }
        Ok(None)
    }

    /// A block without a filter has no transactions besides the coinbase.
    async fn filter_matches(
        &self,
        hash: &BlockHash,
        script: &bitcoin::Script,
    ) -> Result<bool, Error> {
        let Some(filter) = self.backend.get_cfilter(hash).await? else {
            return Ok(false);
        };
        filter
            .match_any(hash, std::iter::once(script.as_bytes()))
            .map_err(|source| Error::Filter {
                hash: *hash,
                source,
            })
    }
}

fn find_confirmation(
    request: &ConfRequest,
    block: &Block,
    hash: BlockHash,
    height: u32,
) -> Option<TxConfirmation> {
    block
        .txdata
        .iter()
        .enumerate()
        .find(|(_, tx)| request.matches_tx(tx))
        .map(|(i, tx)| TxConfirmation {
            block_hash: hash,
            block_height: height,
            tx_index: i as u32,
            tx: tx.clone(),
        })
}

fn outputs_paying(block: &Block, script: &bitcoin::Script) -> Vec<OutPoint> {
    block
        .txdata
        .iter()
        .flat_map(|tx| {
            let txid = tx.compute_txid();
            tx.output
                .iter()
                .enumerate()
                .filter(|(_, out)| out.script_pubkey.as_script() == script)
                .map(move |(vout, _)| OutPoint::new(txid, vout as u32))
        })
        .collect()
}

fn spent_outpoints(block: &Block) -> Vec<OutPoint> {
    block
        .txdata
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .flat_map(|tx| tx.input.iter().map(|input| input.previous_output))
        .collect()
}

fn decode_tx(txid: Txid, hex: &str) -> Result<Transaction, Error> {
    let raw = hex::decode(hex).map_err(|e| Error::Decode {
        txid,
        reason: e.to_string(),
    })?;
    consensus::deserialize(&raw).map_err(|e| Error::Decode {
        txid,
        reason: e.to_string(),
    })
}

fn find_spend(request: &SpendRequest, block: &Block, height: u32) -> Option<SpendDetail> {
    block.txdata.iter().find_map(|tx| {
        request
            .spending_input(tx)
            .map(|input| SpendDetail::new(request.outpoint, tx, input, height))
    })
}

/// Resolves one dispatch and reports the outcome to the tracker, which
/// holds off on the subscription until it hears back. "Not found" is
/// reported like any other result.
pub async fn resolve_and_report<C: BitcoinRpc, N: TxNotifier>(
    resolver: HistoricalResolver<C>,
    tx_notifier: Arc<N>,
    dispatch: HistoricalDispatch,
) {
    let res = match &dispatch {
        HistoricalDispatch::Conf(d) => {
            match resolver
                .conf_details(&d.request, d.start_height, d.end_height)
                .await
            {
                Ok((details, status)) => {
                    info!("Historical confirmation lookup for {}: {}", d.request, status);
                    tx_notifier
                        .update_conf_details(&d.request, details)
                        .map_err(Error::TxNotifier)
                }
                Err(e) => Err(e),
            }
        }
        HistoricalDispatch::Spend(d) => {
            match resolver
                .spend_details(&d.request, d.start_height, d.end_height)
                .await
            {
                Ok(details) => {
                    info!(
                        "Historical spend lookup for {}: {}",
                        d.request,
                        if details.is_some() { "found" } else { "not found" }
                    );
                    tx_notifier
                        .update_spend_details(&d.request, details)
                        .map_err(Error::TxNotifier)
                }
                Err(e) => Err(e),
            }
        }
    };

    match res {
        Ok(()) => {}
        Err(Error::ShuttingDown) => debug!("Abandoning {} on shutdown", dispatch),
        Err(e) => {
            error!("Unable to complete {}: {}", dispatch, e);
            tx_notifier.rescan_failed(&dispatch, &e);
        }
    }
}
