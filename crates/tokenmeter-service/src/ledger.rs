//! Transaction ledger.
//!
//! Every resolution of a transaction goes through the store's conditional
//! update with `Pending` as the expected status. Whoever flips a record first
//! wins; every later attempt gets `None` and changes nothing.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use tokenmeter_core::{
    BillingError, ChatId, Completion, CreditTransaction, MessageId, TransactionId,
    TransactionStatus, Transition, UserId,
};
use tokenmeter_store::{LedgerStore, TransactionPage};

use crate::error::Result;

/// Largest page a listing may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Parameters of a new pending transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    /// The user to charge.
    pub user_id: UserId,
    /// The chat the request belongs to.
    pub chat_id: ChatId,
    /// Pre-flight cost estimate in credits.
    pub estimated_cost: f64,
    /// Model the request is dispatched to.
    pub model: String,
    /// Kind of request (e.g. "chat").
    pub request_type: String,
    /// Whether thinking mode was requested.
    pub thinking_enabled: bool,
}

/// The transaction ledger.
pub struct TransactionLedger<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for TransactionLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore + ?Sized> TransactionLedger<S> {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Record a new pending transaction.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative estimate, or a store error.
    pub async fn create_pending(&self, new: NewTransaction) -> Result<CreditTransaction> {
        ensure_non_negative("estimated_cost", new.estimated_cost)?;

        let transaction = CreditTransaction::pending(
            new.user_id,
            new.chat_id,
            new.estimated_cost,
            new.model,
            new.request_type,
            new.thinking_enabled,
        );
        self.store.insert_transaction(&transaction).await?;

        info!(
            transaction_id = %transaction.transaction_id,
            user_id = %transaction.user_id,
            model = %transaction.model,
            estimated_cost = transaction.estimated_cost,
            "Pending transaction created"
        );
        Ok(transaction)
    }

    /// Get a transaction by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_by_id(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        Ok(self.store.get_transaction(transaction_id).await?)
    }

    /// Get the transaction that completed with `message_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<CreditTransaction>> {
        Ok(self.store.get_transaction_by_message_id(message_id).await?)
    }

    /// Complete a pending transaction.
    ///
    /// Returns `None` without changing anything if the record is missing or
    /// already resolved.
    ///
    /// # Errors
    ///
    /// Returns a validation error for negative usage or cost, or a store error.
    pub async fn complete_transaction(
        &self,
        transaction_id: &TransactionId,
        completion: Completion,
    ) -> Result<Option<CreditTransaction>> {
        validate_completion(&completion)?;

        let updated = self
            .store
            .transition_transaction(
                transaction_id,
                TransactionStatus::Pending,
                &Transition::Complete(completion),
            )
            .await?;

        match &updated {
            Some(transaction) => info!(
                transaction_id = %transaction_id,
                user_id = %transaction.user_id,
                cost = transaction.actual_cost,
                "Transaction completed"
            ),
            None => debug!(transaction_id = %transaction_id, "Completion skipped, not pending"),
        }
        Ok(updated)
    }

    /// Fail a pending transaction.
    ///
    /// Returns `None` without changing anything if the record is missing or
    /// already resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn fail_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        let updated = self
            .store
            .transition_transaction(transaction_id, TransactionStatus::Pending, &Transition::Fail)
            .await?;

        match &updated {
            Some(transaction) => info!(
                transaction_id = %transaction_id,
                user_id = %transaction.user_id,
                "Transaction failed"
            ),
            None => debug!(transaction_id = %transaction_id, "Fail skipped, not pending"),
        }
        Ok(updated)
    }

    /// Pending transactions created more than `age_minutes` ago, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn find_stuck_transactions(&self, age_minutes: u32) -> Result<Vec<CreditTransaction>> {
        let cutoff = Utc::now() - Duration::minutes(i64::from(age_minutes));
        Ok(self.store.find_pending_before(cutoff).await?)
    }

    /// One page of a user's transactions, newest first.
    ///
    /// `page` is 1-based.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an out-of-range page or page size, or a
    /// store error.
    pub async fn get_user_transactions(
        &self,
        user_id: &UserId,
        page: u32,
        page_size: u32,
        status: Option<TransactionStatus>,
    ) -> Result<TransactionPage> {
        if page < 1 {
            return Err(BillingError::InvalidPage(page).into());
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(BillingError::InvalidPageSize {
                page_size,
                max: MAX_PAGE_SIZE,
            }
            .into());
        }

        let limit = page_size as usize;
        let offset = (page as usize - 1).saturating_mul(limit);
        Ok(self
            .store
            .list_user_transactions(user_id, status, offset, limit)
            .await?)
    }
}

pub(crate) fn ensure_non_negative(field: &'static str, value: f64) -> Result<()> {
    if value < 0.0 || value.is_nan() {
        return Err(BillingError::NegativeAmount { field, value }.into());
    }
    Ok(())
}

fn validate_completion(completion: &Completion) -> Result<()> {
    if completion.input_tokens < 0 || completion.output_tokens < 0 {
        return Err(BillingError::NegativeTokens {
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        }
        .into());
    }
    ensure_non_negative("actual_cost", completion.actual_cost)
}
