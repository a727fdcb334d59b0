//! Ordering of committed transactions inside a drained batch

use crate::bundle::SequencedTransaction;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderingStrategy {
    /// Commit order, greedy packing
    #[default]
    ArrivalOrder,
    /// Highest fee first; ties keep commit order
    FeePriority,
}

impl OrderingStrategy {
    pub fn order(&self, batch: &mut [SequencedTransaction]) {
        match self {
            OrderingStrategy::ArrivalOrder => {}
            OrderingStrategy::FeePriority => {
                batch.sort_by(|a, b| b.transaction.fee.cmp(&a.transaction.fee));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequencer_types::{AccountId, Transaction, TRANSFER_GAS};

    fn with_fee(index: u64, fee: u64) -> SequencedTransaction {
        let key = ed25519_dalek::SigningKey::from_bytes(&[5; 32]);
        SequencedTransaction {
            index,
            transaction: Transaction::signed_at(&key, AccountId::new([6; 32]), 1, index, fee, TRANSFER_GAS, 0),
            queued_at: 0,
        }
    }

    fn indexes(batch: &[SequencedTransaction]) -> Vec<u64> {
        batch.iter().map(|t| t.index).collect()
    }

    #[test]
    fn test_fee_priority_is_stable() {
        let mut batch = vec![with_fee(1, 5), with_fee(2, 9), with_fee(3, 5), with_fee(4, 1)];
        OrderingStrategy::FeePriority.order(&mut batch);
        assert_eq!(indexes(&batch), vec![2, 1, 3, 4]);
    }

    #[test]
    fn test_arrival_order_untouched() {
        let mut batch = vec![with_fee(1, 5), with_fee(2, 9)];
        OrderingStrategy::ArrivalOrder.order(&mut batch);
        assert_eq!(indexes(&batch), vec![1, 2]);
    }
}
