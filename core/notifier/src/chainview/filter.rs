use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use bitcoin::{OutPoint, ScriptBuf, Transaction};

/// An unspent output the view is asked to follow, together with the
/// script it pays to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WatchedOutput {
    pub outpoint: OutPoint,
    pub script: ScriptBuf,
}

/// The set of watched outputs. It only grows through [`add`] and only
/// shrinks when a block spends an entry.
///
/// [`add`]: WatchedOutputs::add
#[derive(Debug, Default)]
pub struct WatchedOutputs {
    outputs: RwLock<HashMap<OutPoint, ScriptBuf>>,
}

impl WatchedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, ops: &[WatchedOutput]) {
        let mut outputs = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
        for op in ops {
            outputs.insert(op.outpoint, op.script.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.outputs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(outpoint)
    }

    pub fn scripts(&self) -> Vec<ScriptBuf> {
        self.outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Drops every entry spent by an input of `txs` and returns them.
    pub fn remove_spent(&self, txs: &[Transaction]) -> Vec<OutPoint> {
        let mut outputs = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
        txs.iter()
            .flat_map(|tx| tx.input.iter())
            .filter_map(|input| {
                outputs
                    .remove(&input.previous_output)
                    .map(|_| input.previous_output)
            })
            .collect()
    }

    /// Keeps only the transactions that spend a watched output, dropping
    /// the outputs they spend.
    pub fn take_spending(&self, txs: Vec<Transaction>) -> Vec<Transaction> {
        let mut outputs = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
        txs.into_iter()
            .filter(|tx| {
                let mut spends = false;
                for input in &tx.input {
                    spends |= outputs.remove(&input.previous_output).is_some();
                }
                spends
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{Txid, hashes::Hash};

    use super::*;
    use crate::test_utils::{new_test_script, spend_tx};

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([n; 32]), 0)
    }

    fn watched(n: u8) -> WatchedOutput {
        WatchedOutput {
            outpoint: outpoint(n),
            script: new_test_script(n),
        }
    }

    #[test]
    fn add_is_a_union() {
        let set = WatchedOutputs::new();
        set.add(&[watched(1), watched(2)]);
        set.add(&[watched(2), watched(3)]);
        assert_eq!(set.len(), 3);
        assert!(set.contains(&outpoint(1)));
        assert!(set.contains(&outpoint(3)));
    }

    #[test]
    fn remove_spent_is_exact() {
        let set = WatchedOutputs::new();
        set.add(&[watched(1), watched(2)]);

        let tx = spend_tx(&[outpoint(1), outpoint(9)], &[new_test_script(5)]);
        assert_eq!(set.remove_spent(&[tx.clone()]), vec![outpoint(1)]);
        assert!(!set.contains(&outpoint(1)));
        assert!(set.contains(&outpoint(2)));

        assert!(set.remove_spent(&[tx]).is_empty());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn take_spending_filters_transactions() {
        let set = WatchedOutputs::new();
        set.add(&[watched(1)]);

        let spender = spend_tx(&[outpoint(1)], &[new_test_script(5)]);
        let unrelated = spend_tx(&[outpoint(7)], &[new_test_script(6)]);
        let kept = set.take_spending(vec![unrelated, spender.clone()]);

        assert_eq!(kept, vec![spender]);
        assert!(set.is_empty());
    }
}
