//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the store traits.
//!
//! `RocksDB` has no conditional write, so every read-check-write sequence runs
//! under `write_lock` and commits through a single `WriteBatch`. Reads do not
//! take the lock.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use tokenmeter_core::{
    Account, BalanceDelta, ChatMessage, CreditTransaction, MessageId, TransactionId,
    TransactionStatus, Transition, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{
    BalanceStore, LedgerStore, MessageStore, SettleOutcome, Settlement, Store, TransactionPage,
};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Store a chat message under its transaction ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the message has no transaction ID.
    pub fn put_message(&self, message: &ChatMessage) -> Result<()> {
        let transaction_id = message.transaction_id.ok_or_else(|| {
            StoreError::Conflict(format!("message {} has no transaction", message.message_id))
        })?;
        let cf = self.cf(cf::MESSAGES)?;
        self.db
            .put_cf(
                &cf,
                keys::transaction_key(&transaction_id),
                Self::serialize(message)?,
            )
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("rocksdb write lock poisoned".into()))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, family: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(family)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn read_transaction(&self, transaction_id: &TransactionId) -> Result<Option<CreditTransaction>> {
        self.get(cf::TRANSACTIONS, &keys::transaction_key(transaction_id))
    }

    fn read_account(&self, user_id: &UserId) -> Result<Option<Account>> {
        self.get(cf::ACCOUNTS, &keys::account_key(user_id))
    }

    /// Stage a transaction record and keep its indexes in step with its status.
    fn stage_transaction(&self, batch: &mut WriteBatch, tx: &CreditTransaction) -> Result<()> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_pending = self.cf(cf::PENDING_TRANSACTIONS)?;
        let cf_by_message = self.cf(cf::TRANSACTIONS_BY_MESSAGE)?;

        let tx_key = keys::transaction_key(&tx.transaction_id);
        batch.put_cf(&cf_tx, &tx_key, Self::serialize(tx)?);

        if tx.is_pending() {
            batch.put_cf(&cf_pending, &tx_key, []);
        } else {
            batch.delete_cf(&cf_pending, &tx_key);
        }
        if let Some(message_id) = &tx.message_id {
            batch.put_cf(&cf_by_message, keys::message_key(message_id), &tx_key);
        }
        Ok(())
    }

    fn stage_account(&self, batch: &mut WriteBatch, account: &Account) -> Result<()> {
        let cf = self.cf(cf::ACCOUNTS)?;
        batch.put_cf(&cf, keys::account_key(&account.user_id), Self::serialize(account)?);
        Ok(())
    }

    fn insert_transaction_sync(&self, tx: &CreditTransaction) -> Result<()> {
        let _guard = self.lock()?;
        if self.read_transaction(&tx.transaction_id)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "transaction {} already exists",
                tx.transaction_id
            )));
        }

        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let mut batch = WriteBatch::default();
        self.stage_transaction(&mut batch, tx)?;
        batch.put_cf(
            &cf_by_user,
            keys::user_transaction_key(&tx.user_id, &tx.transaction_id),
            [],
        );
        self.write(batch)
    }

    fn transition_sync(
        &self,
        transaction_id: &TransactionId,
        expected: TransactionStatus,
        transition: &Transition,
    ) -> Result<Option<CreditTransaction>> {
        let _guard = self.lock()?;
        let Some(mut tx) = self.read_transaction(transaction_id)? else {
            return Ok(None);
        };
        let previous_message = tx.message_id;
        if !tx.apply(expected, transition, Utc::now()) {
            return Ok(None);
        }

        let mut batch = WriteBatch::default();
        self.stage_transaction(&mut batch, &tx)?;
        if let Some(message_id) = previous_message.filter(|_| tx.message_id.is_none()) {
            let cf_by_message = self.cf(cf::TRANSACTIONS_BY_MESSAGE)?;
            batch.delete_cf(&cf_by_message, keys::message_key(&message_id));
        }
        self.write(batch)?;
        Ok(Some(tx))
    }

    fn find_pending_before_sync(&self, cutoff: DateTime<Utc>) -> Result<Vec<CreditTransaction>> {
        let cf_pending = self.cf(cf::PENDING_TRANSACTIONS)?;
        let mut stuck = Vec::new();

        for item in self.db.iterator_cf(&cf_pending, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let Some(transaction_id) = keys::decode_transaction_id(&key) else {
                tracing::warn!(key_len = key.len(), "Skipping malformed pending index key");
                continue;
            };
            if let Some(tx) = self.read_transaction(&transaction_id)? {
                if tx.is_pending() && tx.created_at < cutoff {
                    stuck.push(tx);
                }
            }
        }

        stuck.sort_by_key(|tx| tx.created_at);
        Ok(stuck)
    }

    fn list_user_transactions_sync(
        &self,
        user_id: &UserId,
        status: Option<TransactionStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<TransactionPage> {
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let prefix = keys::user_transactions_prefix(user_id);

        let mut matching = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf_by_user, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(id) = keys::extract_transaction_id_from_user_key(&key) else {
                continue;
            };
            if let Some(tx) = self.read_transaction(&id)? {
                if status.map_or(true, |s| tx.status == s) {
                    matching.push(tx);
                }
            }
        }

        // Newest first by creation time, then by id.
        matching.sort_by(|a, b| {
            (b.created_at, b.transaction_id).cmp(&(a.created_at, a.transaction_id))
        });
        let total = matching.len() as u64;
        let transactions = matching.into_iter().skip(offset).take(limit).collect();

        Ok(TransactionPage {
            transactions,
            total,
        })
    }

    fn insert_account_sync(&self, account: &Account) -> Result<()> {
        let _guard = self.lock()?;
        if self.read_account(&account.user_id)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "account {} already exists",
                account.user_id
            )));
        }
        let mut batch = WriteBatch::default();
        self.stage_account(&mut batch, account)?;
        self.write(batch)
    }

    fn increment_balance_sync(
        &self,
        user_id: &UserId,
        delta: &BalanceDelta,
    ) -> Result<Option<Account>> {
        let _guard = self.lock()?;
        let Some(mut account) = self.read_account(user_id)? else {
            return Ok(None);
        };
        account.apply(delta, Utc::now());

        let mut batch = WriteBatch::default();
        self.stage_account(&mut batch, &account)?;
        self.write(batch)?;
        Ok(Some(account))
    }

    fn settle_sync(&self, settlement: &Settlement) -> Result<SettleOutcome> {
        let _guard = self.lock()?;
        let Some(mut tx) = self
            .read_transaction(&settlement.transaction_id)?
            .filter(CreditTransaction::is_pending)
        else {
            return Ok(SettleOutcome::NotPending);
        };
        let Some(mut account) = self.read_account(&settlement.user_id)? else {
            return Ok(SettleOutcome::AccountMissing);
        };

        let now = Utc::now();
        tx.apply(
            TransactionStatus::Pending,
            &Transition::Complete(settlement.completion.clone()),
            now,
        );
        account.apply(&settlement.delta, now);

        // Write atomically
        let mut batch = WriteBatch::default();
        self.stage_transaction(&mut batch, &tx)?;
        self.stage_account(&mut batch, &account)?;
        self.write(batch)?;

        Ok(SettleOutcome::Settled {
            transaction: tx,
            account,
        })
    }
}

#[async_trait]
impl LedgerStore for RocksStore {
    async fn insert_transaction(&self, transaction: &CreditTransaction) -> Result<()> {
        self.insert_transaction_sync(transaction)
    }

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        self.read_transaction(transaction_id)
    }

    async fn get_transaction_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<CreditTransaction>> {
        let cf = self.cf(cf::TRANSACTIONS_BY_MESSAGE)?;
        let Some(tx_key) = self
            .db
            .get_cf(&cf, keys::message_key(message_id))
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };
        let transaction_id = keys::decode_transaction_id(&tx_key).ok_or_else(|| {
            StoreError::Serialization(format!("malformed message index for {message_id}"))
        })?;
        self.read_transaction(&transaction_id)
    }

    async fn transition_transaction(
        &self,
        transaction_id: &TransactionId,
        expected: TransactionStatus,
        transition: &Transition,
    ) -> Result<Option<CreditTransaction>> {
        self.transition_sync(transaction_id, expected, transition)
    }

    async fn find_pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<CreditTransaction>> {
        self.find_pending_before_sync(cutoff)
    }

    async fn list_user_transactions(
        &self,
        user_id: &UserId,
        status: Option<TransactionStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<TransactionPage> {
        self.list_user_transactions_sync(user_id, status, offset, limit)
    }
}

#[async_trait]
impl BalanceStore for RocksStore {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        self.insert_account_sync(account)
    }

    async fn get_account(&self, user_id: &UserId) -> Result<Option<Account>> {
        self.read_account(user_id)
    }

    async fn increment_balance(
        &self,
        user_id: &UserId,
        delta: &BalanceDelta,
    ) -> Result<Option<Account>> {
        self.increment_balance_sync(user_id, delta)
    }
}

#[async_trait]
impl MessageStore for RocksStore {
    async fn get_by_transaction_id(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<ChatMessage>> {
        self.get(cf::MESSAGES, &keys::transaction_key(transaction_id))
    }
}

#[async_trait]
impl Store for RocksStore {
    async fn settle_atomically(&self, settlement: &Settlement) -> Result<SettleOutcome> {
        self.settle_sync(settlement)
    }
}
