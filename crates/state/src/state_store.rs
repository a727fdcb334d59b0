//! Account balances and nonces driven by committed transfers
//!
//! Only `StateReplication` mutates the store, applying committed entries in
//! index order. Maps are ordered so snapshots and state roots are
//! byte-identical across replicas.

use crate::error::ReplicationError;
use parking_lot::RwLock;
use sequencer_types::{AccountId, Amount, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Serializable image of the whole store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub last_applied_index: u64,
    pub last_applied_term: u64,
    pub balances: BTreeMap<AccountId, Amount>,
    /// Next expected nonce per sender
    pub nonces: BTreeMap<AccountId, u64>,
    pub collected_fees: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    NonceGap { expected: u64, got: u64 },
    InsufficientBalance { balance: Amount, required: Amount },
    Overflow,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NonceGap { expected, got } => {
                write!(f, "nonce gap: expected {}, got {}", expected, got)
            }
            RejectReason::InsufficientBalance { balance, required } => {
                write!(f, "insufficient balance: have {}, need {}", balance, required)
            }
            RejectReason::Overflow => write!(f, "amount overflow"),
        }
    }
}

/// Result of applying one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied,
    /// Nonce already consumed; replay is a no-op
    Duplicate,
    Rejected(RejectReason),
}

pub struct StateStore {
    inner: RwLock<StateSnapshot>,
}

impl StateStore {
    /// Create a store funded with genesis balances
    pub fn new(genesis: &[(AccountId, Amount)]) -> Self {
        let mut state = StateSnapshot::default();
        for (account, balance) in genesis {
            *state.balances.entry(*account).or_insert(0) += balance;
        }
        Self {
            inner: RwLock::new(state),
        }
    }

    pub fn balance(&self, account: &AccountId) -> Amount {
        self.inner.read().balances.get(account).copied().unwrap_or(0)
    }

    /// Next nonce the account must use
    pub fn nonce(&self, account: &AccountId) -> u64 {
        self.inner.read().nonces.get(account).copied().unwrap_or(0)
    }

    pub fn last_applied_index(&self) -> u64 {
        self.inner.read().last_applied_index
    }

    pub fn last_applied_term(&self) -> u64 {
        self.inner.read().last_applied_term
    }

    pub fn collected_fees(&self) -> Amount {
        self.inner.read().collected_fees
    }

    /// Advance the watermark for an entry that carries no transaction
    pub fn record_noop(&self, index: u64, term: u64) {
        let mut state = self.inner.write();
        state.last_applied_index = index;
        state.last_applied_term = term;
    }

    /// Apply a transfer at log position `index`
    pub fn apply_transaction(&self, index: u64, term: u64, tx: &Transaction) -> ApplyOutcome {
        let mut state = self.inner.write();
        state.last_applied_index = index;
        state.last_applied_term = term;

        let expected = state.nonces.get(&tx.sender).copied().unwrap_or(0);
        if tx.nonce < expected {
            return ApplyOutcome::Duplicate;
        }
        if tx.nonce > expected {
            return ApplyOutcome::Rejected(RejectReason::NonceGap {
                expected,
                got: tx.nonce,
            });
        }

        let Some(required) = tx.total_cost() else {
            return ApplyOutcome::Rejected(RejectReason::Overflow);
        };
        let balance = state.balances.get(&tx.sender).copied().unwrap_or(0);
        if balance < required {
            return ApplyOutcome::Rejected(RejectReason::InsufficientBalance { balance, required });
        }
        let recipient_balance = if tx.recipient == tx.sender {
            balance - required
        } else {
            state.balances.get(&tx.recipient).copied().unwrap_or(0)
        };
        let Some(credited) = recipient_balance.checked_add(tx.amount) else {
            return ApplyOutcome::Rejected(RejectReason::Overflow);
        };
        let Some(fees) = state.collected_fees.checked_add(tx.fee) else {
            return ApplyOutcome::Rejected(RejectReason::Overflow);
        };

        state.balances.insert(tx.sender, balance - required);
        state.balances.insert(tx.recipient, credited);
        state.collected_fees = fees;
        state.nonces.insert(tx.sender, expected + 1);
        ApplyOutcome::Applied
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.read().clone()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ReplicationError> {
        Ok(bincode::serialize(&*self.inner.read())?)
    }

    /// Replace the whole state with a decoded snapshot
    pub fn restore(&self, data: &[u8]) -> Result<StateSnapshot, ReplicationError> {
        let state: StateSnapshot = bincode::deserialize(data)?;
        *self.inner.write() = state.clone();
        Ok(state)
    }

    /// blake3 over the encoded state, for comparing replicas
    pub fn state_root(&self) -> Result<[u8; 32], ReplicationError> {
        let bytes = self.encode()?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use sequencer_types::TRANSFER_GAS;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn transfer(from: &SigningKey, to: AccountId, amount: Amount, nonce: u64, fee: Amount) -> Transaction {
        Transaction::signed_at(from, to, amount, nonce, fee, TRANSFER_GAS, 0)
    }

    #[test]
    fn test_transfer_moves_balance_and_fee() {
        let alice = key(1);
        let bob = AccountId::from(&key(2));
        let store = StateStore::new(&[(AccountId::from(&alice), 100)]);

        let outcome = store.apply_transaction(1, 1, &transfer(&alice, bob, 40, 0, 2));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(store.balance(&AccountId::from(&alice)), 58);
        assert_eq!(store.balance(&bob), 40);
        assert_eq!(store.collected_fees(), 2);
        assert_eq!(store.nonce(&AccountId::from(&alice)), 1);
        assert_eq!(store.last_applied_index(), 1);
    }

    #[test]
    fn test_replay_is_duplicate() {
        let alice = key(1);
        let bob = AccountId::from(&key(2));
        let store = StateStore::new(&[(AccountId::from(&alice), 100)]);
        let tx = transfer(&alice, bob, 10, 0, 0);

        store.apply_transaction(1, 1, &tx);
        let root = store.snapshot().balances;
        assert_eq!(store.apply_transaction(2, 1, &tx), ApplyOutcome::Duplicate);
        assert_eq!(store.snapshot().balances, root);
        assert_eq!(store.last_applied_index(), 2);
    }

    #[test]
    fn test_rejections_leave_state_untouched() {
        let alice = key(1);
        let bob = AccountId::from(&key(2));
        let store = StateStore::new(&[(AccountId::from(&alice), 10)]);

        assert_eq!(
            store.apply_transaction(1, 1, &transfer(&alice, bob, 5, 3, 0)),
            ApplyOutcome::Rejected(RejectReason::NonceGap { expected: 0, got: 3 })
        );
        assert_eq!(
            store.apply_transaction(2, 1, &transfer(&alice, bob, 10, 0, 1)),
            ApplyOutcome::Rejected(RejectReason::InsufficientBalance { balance: 10, required: 11 })
        );
        assert_eq!(store.balance(&AccountId::from(&alice)), 10);
        assert_eq!(store.nonce(&AccountId::from(&alice)), 0);
    }

    #[test]
    fn test_self_transfer_only_burns_fee() {
        let alice = key(1);
        let me = AccountId::from(&alice);
        let store = StateStore::new(&[(me, 50)]);

        store.apply_transaction(1, 1, &transfer(&alice, me, 20, 0, 3));
        assert_eq!(store.balance(&me), 47);
    }

    #[test]
    fn test_snapshot_restore_matches_root() {
        let alice = key(1);
        let bob = AccountId::from(&key(2));
        let source = StateStore::new(&[(AccountId::from(&alice), 100)]);
        source.apply_transaction(1, 1, &transfer(&alice, bob, 25, 0, 1));

        let replica = StateStore::new(&[]);
        let restored = replica.restore(&source.encode().unwrap()).unwrap();
        assert_eq!(restored.last_applied_index, 1);
        assert_eq!(replica.state_root().unwrap(), source.state_root().unwrap());
        assert_eq!(replica.balance(&bob), 25);
    }
}
