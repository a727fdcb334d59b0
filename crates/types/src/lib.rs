//! Shared types for the replicated sequencer
//!
//! Everything that crosses a crate boundary or the wire lives here:
//! node and account identities, and the signed transfer transaction that
//! is ordered by consensus and applied to the state store.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cluster member identifier
pub type NodeId = u64;

/// Token amount in the smallest unit
pub type Amount = u64;

/// Gas charged for a plain transfer when the client does not set a limit
pub const TRANSFER_GAS: u64 = 21_000;

/// Current wall-clock time in unix milliseconds
pub fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Account identity (an ed25519 verifying key)
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<&SigningKey> for AccountId {
    fn from(key: &SigningKey) -> Self {
        Self(key.verifying_key().to_bytes())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.to_string();
        write!(f, "AccountId({})", &s[..s.len().min(8)])
    }
}

impl FromStr for AccountId {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| TransactionError::MalformedAccount(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransactionError::MalformedAccount(s.to_string()))?;
        Ok(Self(arr))
    }
}

/// Transaction identity: blake3 over the signed transfer fields
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct TransactionId(pub [u8; 32]);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.to_string();
        write!(f, "TransactionId({})", &s[..s.len().min(8)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction id does not match its contents")]
    IdMismatch,

    #[error("sender is not a valid ed25519 key")]
    MalformedSender,

    #[error("invalid transaction signature")]
    InvalidSignature,

    #[error("malformed account id: {0}")]
    MalformedAccount(String),
}

/// Fields covered by the sender's signature
#[derive(BorshSerialize)]
struct TransferMessage {
    sender: AccountId,
    recipient: AccountId,
    amount: Amount,
    nonce: u64,
    fee: Amount,
    gas_limit: u64,
    submitted_at: u64,
}

/// A signed transfer, immutable once accepted into the log
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub sender: AccountId,
    pub recipient: AccountId,
    pub amount: Amount,
    pub nonce: u64,
    pub fee: Amount,
    pub gas_limit: u64,
    pub signature: Vec<u8>,
    /// Unix millis when the client created the transaction
    pub submitted_at: u64,
}

impl Transaction {
    /// Build and sign a transfer stamped with the current time
    pub fn new_signed(
        key: &SigningKey,
        recipient: AccountId,
        amount: Amount,
        nonce: u64,
        fee: Amount,
        gas_limit: u64,
    ) -> Self {
        Self::signed_at(key, recipient, amount, nonce, fee, gas_limit, unix_millis())
    }

    /// Build and sign a transfer with an explicit timestamp
    #[allow(clippy::too_many_arguments)]
    pub fn signed_at(
        key: &SigningKey,
        recipient: AccountId,
        amount: Amount,
        nonce: u64,
        fee: Amount,
        gas_limit: u64,
        submitted_at: u64,
    ) -> Self {
        let mut tx = Self {
            id: TransactionId::default(),
            sender: AccountId::from(key),
            recipient,
            amount,
            nonce,
            fee,
            gas_limit,
            signature: Vec::new(),
            submitted_at,
        };
        let message = tx.signing_bytes();
        tx.signature = key.sign(&message).to_bytes().to_vec();
        tx.id = tx.compute_id();
        tx
    }

    /// Bytes the sender signs
    pub fn signing_bytes(&self) -> Vec<u8> {
        let message = TransferMessage {
            sender: self.sender,
            recipient: self.recipient,
            amount: self.amount,
            nonce: self.nonce,
            fee: self.fee,
            gas_limit: self.gas_limit,
            submitted_at: self.submitted_at,
        };
        borsh::to_vec(&message).unwrap_or_default()
    }

    /// Compute the id from the signed fields and the signature
    pub fn compute_id(&self) -> TransactionId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.signing_bytes());
        hasher.update(&self.signature);
        TransactionId(*hasher.finalize().as_bytes())
    }

    /// Check the id and the sender's signature
    pub fn verify(&self) -> Result<(), TransactionError> {
        if self.compute_id() != self.id {
            return Err(TransactionError::IdMismatch);
        }
        let key = VerifyingKey::from_bytes(&self.sender.0)
            .map_err(|_| TransactionError::MalformedSender)?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| TransactionError::InvalidSignature)?;
        key.verify(&self.signing_bytes(), &signature)
            .map_err(|_| TransactionError::InvalidSignature)
    }

    /// Total debit from the sender if applied
    pub fn total_cost(&self) -> Option<Amount> {
        self.amount.checked_add(self.fee)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("sender", &self.sender)
            .field("recipient", &self.recipient)
            .field("amount", &self.amount)
            .field("nonce", &self.nonce)
            .field("fee", &self.fee)
            .field("gas_limit", &self.gas_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_signed_transaction_verifies() {
        let alice = key(1);
        let bob = AccountId::from(&key(2));
        let tx = Transaction::signed_at(&alice, bob, 50, 0, 1, TRANSFER_GAS, 1_000);

        assert_eq!(tx.sender, AccountId::from(&alice));
        assert!(tx.verify().is_ok());
        assert_eq!(tx.total_cost(), Some(51));
    }

    #[test]
    fn test_tampered_transaction_rejected() {
        let alice = key(1);
        let bob = AccountId::from(&key(2));
        let mut tx = Transaction::signed_at(&alice, bob, 50, 0, 1, TRANSFER_GAS, 1_000);

        tx.amount = 5_000;
        assert_eq!(tx.verify(), Err(TransactionError::IdMismatch));

        tx.id = tx.compute_id();
        assert_eq!(tx.verify(), Err(TransactionError::InvalidSignature));
    }

    #[test]
    fn test_id_is_deterministic() {
        let alice = key(3);
        let bob = AccountId::from(&key(4));
        let a = Transaction::signed_at(&alice, bob, 7, 2, 0, TRANSFER_GAS, 42);
        let b = Transaction::signed_at(&alice, bob, 7, 2, 0, TRANSFER_GAS, 42);
        assert_eq!(a.id, b.id);

        let c = Transaction::signed_at(&alice, bob, 7, 3, 0, TRANSFER_GAS, 42);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_account_id_display_roundtrip() {
        let account = AccountId::from(&key(9));
        let parsed: AccountId = account.to_string().parse().unwrap();
        assert_eq!(parsed, account);
        assert!("not-base58!".parse::<AccountId>().is_err());
    }
}
