//! Storage layer for tokenmeter.
//!
//! This crate persists credit transactions, account balances and the chat
//! messages the reconciliation worker reads. Three backends implement the same
//! traits:
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`; the production backend.
//! - [`RocksStore`]: embedded `RocksDB` (feature `rocksdb-backend`).
//! - [`MemoryStore`]: in-process maps, for tests and local runs.
//!
//! # Concurrency
//!
//! Every state change of a transaction goes through
//! [`LedgerStore::transition_transaction`], a conditional update that applies
//! only when the stored status equals the expected one. Balances change only
//! through [`BalanceStore::increment_balance`], an atomic increment. Neither
//! operation reads a value back into the caller and writes it again.
//!
//! # Example
//!
//! ```no_run
//! use tokenmeter_core::{Account, UserId};
//! use tokenmeter_store::{BalanceStore, MemoryStore};
//!
//! # async fn demo() -> tokenmeter_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//! store.insert_account(&Account::new(user_id, 100.0)).await?;
//! let account = store.get_account(&user_id).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
#[cfg(feature = "rocksdb-backend")]
pub mod keys;
pub mod memory;
pub mod postgres;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tokenmeter_core::{
    Account, BalanceDelta, ChatMessage, Completion, CreditTransaction, MessageId,
    TransactionId, TransactionStatus, Transition, UserId,
};

/// One page of a user's transactions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionPage {
    /// Transactions on this page, newest first.
    pub transactions: Vec<CreditTransaction>,
    /// Number of transactions matching the filter across all pages.
    pub total: u64,
}

/// Durable store of credit transactions.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new transaction.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the ID already exists.
    async fn insert_transaction(&self, transaction: &CreditTransaction) -> Result<()>;

    /// Get a transaction by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>>;

    /// Get the transaction that completed with `message_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_transaction_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<CreditTransaction>>;

    /// Apply `transition` only if the stored status equals `expected`.
    ///
    /// Returns the updated record, or `None` if the record is missing or its
    /// status differs. The check and the write are a single atomic step.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn transition_transaction(
        &self,
        transaction_id: &TransactionId,
        expected: TransactionStatus,
        transition: &Transition,
    ) -> Result<Option<CreditTransaction>>;

    /// All pending transactions created strictly before `cutoff`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<CreditTransaction>>;

    /// List a user's transactions, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_user_transactions(
        &self,
        user_id: &UserId,
        status: Option<TransactionStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<TransactionPage>;
}

/// Durable per-user credit balances.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Insert a new account.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the user already has an account.
    async fn insert_account(&self, account: &Account) -> Result<()>;

    /// Get an account by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_account(&self, user_id: &UserId) -> Result<Option<Account>>;

    /// Atomically add `delta` to an account.
    ///
    /// Returns the updated account, or `None` if the user has no account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn increment_balance(
        &self,
        user_id: &UserId,
        delta: &BalanceDelta,
    ) -> Result<Option<Account>>;
}

/// Read access to chat messages owned by the chat service.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Get the message produced under `transaction_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_by_transaction_id(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<ChatMessage>>;
}

/// The completion of one transaction together with the charge it implies.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    /// The transaction being completed.
    pub transaction_id: TransactionId,
    /// The user being charged.
    pub user_id: UserId,
    /// Usage and cost recorded on the transaction.
    pub completion: Completion,
    /// Increment applied to the user's account.
    pub delta: BalanceDelta,
}

impl Settlement {
    /// Build a settlement that charges the completion's actual cost.
    #[must_use]
    pub fn new(transaction_id: TransactionId, user_id: UserId, completion: Completion) -> Self {
        let delta = BalanceDelta::charge(completion.actual_cost, completion.total_tokens);
        Self {
            transaction_id,
            user_id,
            completion,
            delta,
        }
    }
}

/// Result of applying a [`Settlement`].
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    /// Both writes applied.
    Settled {
        /// The completed transaction.
        transaction: CreditTransaction,
        /// The charged account.
        account: Account,
    },
    /// The transaction was missing or no longer pending; nothing changed.
    NotPending,
    /// The user has no account; nothing remains applied.
    AccountMissing,
    /// The balance write failed and the completion was rolled back; nothing
    /// remains applied.
    ChargeFailed,
}

/// A store holding both the ledger and the balances.
#[async_trait]
pub trait Store: LedgerStore + BalanceStore {
    /// Complete the transaction and charge the account in one multi-statement
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::TransactionsUnsupported` if the backend cannot
    /// run multi-statement transactions; nothing is written in that case.
    async fn settle_atomically(&self, settlement: &Settlement) -> Result<SettleOutcome>;
}
