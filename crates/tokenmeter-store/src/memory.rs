//! In-memory storage implementation.
//!
//! Backs tests and local runs. All state sits behind one mutex, so every
//! conditional update and increment is trivially atomic. A store built with
//! [`MemoryStore::standalone`] refuses multi-statement transactions, which
//! exercises the compensating settlement path.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tokenmeter_core::{
    Account, BalanceDelta, ChatMessage, CreditTransaction, MessageId, TransactionId,
    TransactionStatus, Transition, UserId,
};

use crate::error::{Result, StoreError};
use crate::{
    BalanceStore, LedgerStore, MessageStore, SettleOutcome, Settlement, Store, TransactionPage,
};

#[derive(Default)]
struct Inner {
    transactions: BTreeMap<TransactionId, CreditTransaction>,
    accounts: HashMap<UserId, Account>,
    messages: HashMap<TransactionId, ChatMessage>,
}

/// In-memory store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    supports_transactions: bool,
}

impl MemoryStore {
    /// Create an empty store that supports atomic settlement.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            supports_transactions: true,
        }
    }

    /// Create an empty store that rejects multi-statement transactions.
    #[must_use]
    pub fn standalone() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            supports_transactions: false,
        }
    }

    /// Store a chat message under its transaction ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the message has no transaction ID.
    pub fn put_message(&self, message: ChatMessage) -> Result<()> {
        let transaction_id = message.transaction_id.ok_or_else(|| {
            StoreError::Conflict(format!("message {} has no transaction", message.message_id))
        })?;
        self.lock()?.messages.insert(transaction_id, message);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_transaction(&self, transaction: &CreditTransaction) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.transactions.contains_key(&transaction.transaction_id) {
            return Err(StoreError::Conflict(format!(
                "transaction {} already exists",
                transaction.transaction_id
            )));
        }
        inner
            .transactions
            .insert(transaction.transaction_id, transaction.clone());
        Ok(())
    }

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        Ok(self.lock()?.transactions.get(transaction_id).cloned())
    }

    async fn get_transaction_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<CreditTransaction>> {
        Ok(self
            .lock()?
            .transactions
            .values()
            .find(|tx| tx.message_id.as_ref() == Some(message_id))
            .cloned())
    }

    async fn transition_transaction(
        &self,
        transaction_id: &TransactionId,
        expected: TransactionStatus,
        transition: &Transition,
    ) -> Result<Option<CreditTransaction>> {
        let mut inner = self.lock()?;
        let Some(tx) = inner.transactions.get_mut(transaction_id) else {
            return Ok(None);
        };
        if tx.apply(expected, transition, Utc::now()) {
            Ok(Some(tx.clone()))
        } else {
            Ok(None)
        }
    }

    async fn find_pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<CreditTransaction>> {
        let mut stuck: Vec<_> = self
            .lock()?
            .transactions
            .values()
            .filter(|tx| tx.is_pending() && tx.created_at < cutoff)
            .cloned()
            .collect();
        stuck.sort_by_key(|tx| tx.created_at);
        Ok(stuck)
    }

    async fn list_user_transactions(
        &self,
        user_id: &UserId,
        status: Option<TransactionStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<TransactionPage> {
        let inner = self.lock()?;
        let mut matching: Vec<_> = inner
            .transactions
            .values()
            .filter(|tx| tx.user_id == *user_id)
            .filter(|tx| status.map_or(true, |s| tx.status == s))
            .collect();
        matching.sort_by(|a, b| {
            (b.created_at, b.transaction_id).cmp(&(a.created_at, a.transaction_id))
        });

        Ok(TransactionPage {
            total: matching.len() as u64,
            transactions: matching
                .into_iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
        })
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.accounts.contains_key(&account.user_id) {
            return Err(StoreError::Conflict(format!(
                "account {} already exists",
                account.user_id
            )));
        }
        inner.accounts.insert(account.user_id, account.clone());
        Ok(())
    }

    async fn get_account(&self, user_id: &UserId) -> Result<Option<Account>> {
        Ok(self.lock()?.accounts.get(user_id).cloned())
    }

    async fn increment_balance(
        &self,
        user_id: &UserId,
        delta: &BalanceDelta,
    ) -> Result<Option<Account>> {
        let mut inner = self.lock()?;
        Ok(inner.accounts.get_mut(user_id).map(|account| {
            account.apply(delta, Utc::now());
            account.clone()
        }))
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get_by_transaction_id(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<ChatMessage>> {
        Ok(self.lock()?.messages.get(transaction_id).cloned())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn settle_atomically(&self, settlement: &Settlement) -> Result<SettleOutcome> {
        if !self.supports_transactions {
            return Err(StoreError::TransactionsUnsupported);
        }

        let mut inner = self.lock()?;
        let inner = &mut *inner;

        let pending = inner
            .transactions
            .get(&settlement.transaction_id)
            .is_some_and(CreditTransaction::is_pending);
        if !pending {
            return Ok(SettleOutcome::NotPending);
        }
        let (Some(tx), Some(account)) = (
            inner.transactions.get_mut(&settlement.transaction_id),
            inner.accounts.get_mut(&settlement.user_id),
        ) else {
            return Ok(SettleOutcome::AccountMissing);
        };

        let now = Utc::now();
        tx.apply(
            TransactionStatus::Pending,
            &Transition::Complete(settlement.completion.clone()),
            now,
        );
        account.apply(&settlement.delta, now);

        Ok(SettleOutcome::Settled {
            transaction: tx.clone(),
            account: account.clone(),
        })
    }
}
