//! Shared fixtures for service integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use tokenmeter_core::{
    Account, BalanceDelta, ChatId, ChatMessage, CreditTransaction, MessageId, ModelRegistry,
    TransactionId, TransactionStatus, Transition, UserId,
};
use tokenmeter_service::{CreditService, NewTransaction, ReconcileWorker};
use tokenmeter_store::{
    BalanceStore, LedgerStore, MemoryStore, SettleOutcome, Settlement, Store, StoreError,
    TransactionPage,
};

/// A credit service over an in-memory store, with one test user.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub credits: CreditService<MemoryStore>,
    pub user_id: UserId,
}

impl TestHarness {
    /// Harness whose store supports atomic settlement.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Harness whose store rejects multi-statement transactions.
    pub fn standalone() -> Self {
        Self::with_store(MemoryStore::standalone())
    }

    fn with_store(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        let credits = CreditService::new(Arc::clone(&store), Arc::new(ModelRegistry::builtin()));
        Self {
            store,
            credits,
            user_id: UserId::generate(),
        }
    }

    /// Open the test user's account.
    pub async fn fund(&self, credits: f64) {
        self.credits
            .create_account(self.user_id, credits)
            .await
            .expect("account should be created");
    }

    /// Current balance of the test user.
    pub async fn balance(&self) -> f64 {
        self.credits
            .get_balance(&self.user_id)
            .await
            .unwrap()
            .expect("test user should have an account")
            .credits
    }

    /// A fresh pending transaction for the test user.
    pub async fn pending(&self, model: &str, thinking_enabled: bool) -> CreditTransaction {
        self.credits
            .create_pending_transaction(NewTransaction {
                user_id: self.user_id,
                chat_id: ChatId::generate(),
                estimated_cost: 1.0,
                model: model.into(),
                request_type: "chat".into(),
                thinking_enabled,
            })
            .await
            .expect("pending transaction should be created")
    }

    /// A pending transaction created `minutes_old` minutes ago.
    pub async fn stuck(&self, model: &str, thinking_enabled: bool, minutes_old: i64) -> CreditTransaction {
        let mut transaction = CreditTransaction::pending(
            self.user_id,
            ChatId::generate(),
            1.0,
            model,
            "chat",
            thinking_enabled,
        );
        transaction.created_at = Utc::now() - Duration::minutes(minutes_old);
        self.store
            .insert_transaction(&transaction)
            .await
            .expect("stuck transaction should be inserted");
        transaction
    }

    /// Attach a chat message with `metadata` to a transaction.
    pub fn attach_message(&self, transaction_id: TransactionId, metadata: Value) -> MessageId {
        let message = ChatMessage {
            message_id: MessageId::generate(),
            transaction_id: Some(transaction_id),
            chat_id: ChatId::generate(),
            metadata,
            created_at: Utc::now(),
        };
        let message_id = message.message_id;
        self.store
            .put_message(message)
            .expect("message should be stored");
        message_id
    }

    /// Attach a message recording complete token usage.
    pub fn attach_usage(&self, transaction_id: TransactionId, input: i64, output: i64) -> MessageId {
        self.attach_message(
            transaction_id,
            json!({ "input_tokens": input, "output_tokens": output }),
        )
    }

    /// A worker over this harness with the default stuck age.
    pub fn worker(&self) -> ReconcileWorker<MemoryStore, MemoryStore> {
        ReconcileWorker::new(
            self.credits.clone(),
            Arc::clone(&self.store),
            tokenmeter_service::DEFAULT_STUCK_AGE_MINUTES,
        )
    }
}

/// Compare credit amounts.
pub fn assert_credits(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected} credits, got {actual}"
    );
}

/// A store without transactions whose balance writes always fail.
pub struct FailingBalanceStore {
    pub inner: MemoryStore,
}

impl FailingBalanceStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::standalone(),
        }
    }
}

#[async_trait]
impl LedgerStore for FailingBalanceStore {
    async fn insert_transaction(&self, transaction: &CreditTransaction) -> tokenmeter_store::Result<()> {
        self.inner.insert_transaction(transaction).await
    }

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> tokenmeter_store::Result<Option<CreditTransaction>> {
        self.inner.get_transaction(transaction_id).await
    }

    async fn get_transaction_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> tokenmeter_store::Result<Option<CreditTransaction>> {
        self.inner.get_transaction_by_message_id(message_id).await
    }

    async fn transition_transaction(
        &self,
        transaction_id: &TransactionId,
        expected: TransactionStatus,
        transition: &Transition,
    ) -> tokenmeter_store::Result<Option<CreditTransaction>> {
        self.inner
            .transition_transaction(transaction_id, expected, transition)
            .await
    }

    async fn find_pending_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> tokenmeter_store::Result<Vec<CreditTransaction>> {
        self.inner.find_pending_before(cutoff).await
    }

    async fn list_user_transactions(
        &self,
        user_id: &UserId,
        status: Option<TransactionStatus>,
        offset: usize,
        limit: usize,
    ) -> tokenmeter_store::Result<TransactionPage> {
        self.inner
            .list_user_transactions(user_id, status, offset, limit)
            .await
    }
}

#[async_trait]
impl BalanceStore for FailingBalanceStore {
    async fn insert_account(&self, account: &Account) -> tokenmeter_store::Result<()> {
        self.inner.insert_account(account).await
    }

    async fn get_account(&self, user_id: &UserId) -> tokenmeter_store::Result<Option<Account>> {
        self.inner.get_account(user_id).await
    }

    async fn increment_balance(
        &self,
        _user_id: &UserId,
        _delta: &BalanceDelta,
    ) -> tokenmeter_store::Result<Option<Account>> {
        Err(StoreError::Database("write timeout".into()))
    }
}

#[async_trait]
impl Store for FailingBalanceStore {
    async fn settle_atomically(
        &self,
        settlement: &Settlement,
    ) -> tokenmeter_store::Result<SettleOutcome> {
        self.inner.settle_atomically(settlement).await
    }
}
