use std::{collections::HashMap, sync::Mutex};

use anyhow::{Result, bail};
use bitcoin::{BlockHash, Transaction, Txid};

use super::{ConfRegistration, SpendRegistration, TxNotifier};
use crate::{
    error::Error,
    notifier::types::{
        ConfNtfn, ConfRequest, HistoricalConfDispatch, HistoricalDispatch,
        HistoricalSpendDispatch, SpendDetail, SpendNtfn, SpendRequest, TxConfirmation,
    },
};

#[derive(Default)]
struct State {
    height: u32,
    torn_down: bool,
    confs: HashMap<u64, ConfNtfn>,
    spends: HashMap<u64, SpendNtfn>,
    connected: Vec<(BlockHash, u32)>,
    disconnected: Vec<u32>,
    notified: Vec<u32>,
    conf_updates: Vec<(ConfRequest, Option<TxConfirmation>)>,
    spend_updates: Vec<(SpendRequest, Option<SpendDetail>)>,
    relevant: Vec<(Txid, u32)>,
    failures: Vec<String>,
    cancelled: Vec<u64>,
}

/// Records everything the notifier tells it and fires subscriptions the
/// simple way: a confirmation once enough blocks sit on top, a spend as
/// soon as it is seen.
#[derive(Default)]
pub struct MockTxNotifier {
    state: Mutex<State>,
}

impl MockTxNotifier {
    pub fn new(height: u32) -> Self {
        Self {
            state: Mutex::new(State {
                height,
                ..Default::default()
            }),
        }
    }

    pub fn height(&self) -> u32 {
        self.state.lock().unwrap().height
    }

    pub fn connected_tips(&self) -> Vec<(BlockHash, u32)> {
        self.state.lock().unwrap().connected.clone()
    }

    pub fn disconnected_tips(&self) -> Vec<u32> {
        self.state.lock().unwrap().disconnected.clone()
    }

    pub fn notified_heights(&self) -> Vec<u32> {
        self.state.lock().unwrap().notified.clone()
    }

    pub fn conf_updates(&self) -> Vec<(ConfRequest, Option<TxConfirmation>)> {
        self.state.lock().unwrap().conf_updates.clone()
    }

    pub fn spend_updates(&self) -> Vec<(SpendRequest, Option<SpendDetail>)> {
        self.state.lock().unwrap().spend_updates.clone()
    }

    pub fn relevant_txs(&self) -> Vec<(Txid, u32)> {
        self.state.lock().unwrap().relevant.clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.state.lock().unwrap().failures.clone()
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.lock().unwrap().torn_down
    }
}

fn dispatch_conf(ntfn: &ConfNtfn, details: &TxConfirmation, height: u32) {
    let confs = height.saturating_sub(details.block_height) + 1;
    if confs >= ntfn.num_confs {
        let _ = ntfn.event.confirmed.try_send(details.clone());
    } else {
        let _ = ntfn.event.updates.try_send(ntfn.num_confs - confs);
    }
}

impl TxNotifier for MockTxNotifier {
    fn register_conf(&self, ntfn: ConfNtfn) -> Result<ConfRegistration> {
        let mut state = self.state.lock().unwrap();
        if state.torn_down {
            bail!("tx notifier torn down");
        }
        let historical_dispatch = (ntfn.height_hint <= state.height).then(|| HistoricalConfDispatch {
            request: ntfn.request.clone(),
            start_height: ntfn.height_hint,
            end_height: state.height,
        });
        let height = state.height;
        state.confs.insert(ntfn.conf_id, ntfn);
        Ok(ConfRegistration {
            historical_dispatch,
            height,
        })
    }

    fn register_spend(&self, ntfn: SpendNtfn) -> Result<SpendRegistration> {
        let mut state = self.state.lock().unwrap();
        if state.torn_down {
            bail!("tx notifier torn down");
        }
        let historical_dispatch =
            (ntfn.height_hint <= state.height).then(|| HistoricalSpendDispatch {
                request: ntfn.request.clone(),
                start_height: ntfn.height_hint,
                end_height: state.height,
            });
        let height = state.height;
        state.spends.insert(ntfn.spend_id, ntfn);
        Ok(SpendRegistration {
            historical_dispatch,
            height,
        })
    }

    fn cancel_conf(&self, _request: &ConfRequest, conf_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.confs.remove(&conf_id);
        state.cancelled.push(conf_id);
    }

    fn cancel_spend(&self, _request: &SpendRequest, spend_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.spends.remove(&spend_id);
        state.cancelled.push(spend_id);
    }

    fn update_conf_details(
        &self,
        request: &ConfRequest,
        details: Option<TxConfirmation>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(details) = &details {
            for ntfn in state.confs.values().filter(|n| n.request == *request) {
                dispatch_conf(ntfn, details, state.height);
            }
        }
        state.conf_updates.push((request.clone(), details));
        Ok(())
    }

    fn update_spend_details(
        &self,
        request: &SpendRequest,
        details: Option<SpendDetail>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(details) = &details {
            for ntfn in state.spends.values().filter(|n| n.request == *request) {
                let _ = ntfn.event.spend.try_send(details.clone());
            }
        }
        state.spend_updates.push((request.clone(), details));
        Ok(())
    }

    fn connect_tip(&self, hash: &BlockHash, height: u32, txs: &[Transaction]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if height != state.height + 1 {
            bail!(
                "received blocks out of order: current height={}, new height={}",
                state.height,
                height
            );
        }
        state.height = height;
        state.connected.push((*hash, height));

        for (i, tx) in txs.iter().enumerate() {
            for ntfn in state.spends.values() {
                if let Some(input) = ntfn.request.spending_input(tx) {
                    let details = SpendDetail::new(ntfn.request.outpoint, tx, input, height);
                    let _ = ntfn.event.spend.try_send(details);
                }
            }
            for ntfn in state.confs.values().filter(|n| n.request.matches_tx(tx)) {
                let details = TxConfirmation {
                    block_hash: *hash,
                    block_height: height,
                    tx_index: i as u32,
                    tx: tx.clone(),
                };
                dispatch_conf(ntfn, &details, height);
            }
        }
        Ok(())
    }

    fn disconnect_tip(&self, height: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if height != state.height {
            bail!(
                "received blocks out of order: current height={}, disconnected height={}",
                state.height,
                height
            );
        }
        state.height = height - 1;
        state.disconnected.push(height);
        Ok(())
    }

    fn notify_height(&self, height: u32) -> Result<()> {
        self.state.lock().unwrap().notified.push(height);
        Ok(())
    }

    fn process_relevant_spend_tx(&self, tx: &Transaction, height: u32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .relevant
            .push((tx.compute_txid(), height));
        Ok(())
    }

    fn rescan_failed(&self, dispatch: &HistoricalDispatch, err: &Error) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push(format!("{}: {}", dispatch, err));
    }

    fn tear_down(&self) {
        let mut state = self.state.lock().unwrap();
        state.torn_down = true;
        state.confs.clear();
        state.spends.clear();
    }
}
