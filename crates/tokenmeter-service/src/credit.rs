//! Credit service.
//!
//! Orchestrates the request path: pre-flight estimate and balance check,
//! pending transaction, and settlement once usage is known.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use tokenmeter_core::{
    calculate_cost_in_credits, Account, BillingError, Completion, CreditTransaction, MessageId,
    ModelRegistry, TransactionId, TransactionStatus, UserId,
};
use tokenmeter_store::{SettleOutcome, Settlement, Store, StoreError, TransactionPage};

use crate::balance::BalanceChecker;
use crate::error::Result;
use crate::ledger::{NewTransaction, TransactionLedger};
use crate::unit_of_work::{AtomicUnitOfWork, CompensatingUnitOfWork, UnitOfWork};

// ============================================================================
// Outcomes
// ============================================================================

/// Why a completion attempt ended with the transaction failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The user has no account to charge.
    AccountMissing,
    /// The transaction's model is no longer in the registry.
    UnknownModel(String),
    /// The balance write failed after completion and was rolled back.
    ChargeFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountMissing => f.write_str("account missing"),
            Self::UnknownModel(model) => write!(f, "unknown model {model}"),
            Self::ChargeFailed => f.write_str("charge failed"),
        }
    }
}

/// Result of [`CreditService::complete_transaction_with_deduction`].
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// Transaction completed and the user charged.
    Completed {
        /// The completed transaction.
        transaction: CreditTransaction,
        /// The charged account.
        account: Account,
    },
    /// Someone else resolved the transaction first.
    AlreadyResolved {
        /// The status it was resolved to.
        status: TransactionStatus,
    },
    /// No such transaction.
    NotFound,
    /// The charge was impossible; the transaction is now failed.
    Failed {
        /// What prevented the charge.
        reason: FailureReason,
    },
}

impl CompletionOutcome {
    /// Whether this call completed the transaction and charged the user.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// The completed transaction and charged account, if any.
    #[must_use]
    pub fn into_completed(self) -> Option<(CreditTransaction, Account)> {
        match self {
            Self::Completed {
                transaction,
                account,
            } => Some((transaction, account)),
            _ => None,
        }
    }

    const fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::AlreadyResolved { .. } => "already_resolved",
            Self::NotFound => "not_found",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Result of [`CreditService::fail_transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// This call moved the transaction to `Failed`.
    Failed(CreditTransaction),
    /// Someone else resolved the transaction first.
    AlreadyResolved {
        /// The status it was resolved to.
        status: TransactionStatus,
    },
    /// No such transaction.
    NotFound,
}

impl FailOutcome {
    /// Whether this call failed the transaction.
    #[must_use]
    pub const fn applied(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

// ============================================================================
// Service
// ============================================================================

/// The credit service.
pub struct CreditService<S: ?Sized> {
    store: Arc<S>,
    registry: Arc<ModelRegistry>,
    ledger: TransactionLedger<S>,
    balances: BalanceChecker<S>,
}

impl<S: ?Sized> Clone for CreditService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            ledger: self.ledger.clone(),
            balances: self.balances.clone(),
        }
    }
}

impl<S: Store + ?Sized> CreditService<S> {
    /// Create a service over `store`, pricing with `registry`.
    #[must_use]
    pub fn new(store: Arc<S>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            ledger: TransactionLedger::new(Arc::clone(&store)),
            balances: BalanceChecker::new(Arc::clone(&store)),
            store,
            registry,
        }
    }

    /// The underlying ledger.
    #[must_use]
    pub const fn ledger(&self) -> &TransactionLedger<S> {
        &self.ledger
    }

    /// The model registry used for pricing.
    #[must_use]
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Estimate a request's cost before dispatch.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown model or negative counts.
    pub fn estimate_cost(
        &self,
        model_id: &str,
        estimated_input_tokens: i64,
        estimated_output_tokens: i64,
        thinking_enabled: bool,
    ) -> Result<f64> {
        Ok(self.registry.estimate_cost(
            model_id,
            estimated_input_tokens,
            estimated_output_tokens,
            thinking_enabled,
        )?)
    }

    /// Whether the user may start a request; see [`BalanceChecker::check_balance`].
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative estimate, or a store error.
    pub async fn check_balance(&self, user_id: &UserId, estimated_cost: f64) -> Result<bool> {
        self.balances.check_balance(user_id, estimated_cost).await
    }

    /// The user's account, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<Option<Account>> {
        self.balances.get_balance(user_id).await
    }

    /// Open an account with `initial_credits`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative grant, or a store error.
    pub async fn create_account(&self, user_id: UserId, initial_credits: f64) -> Result<Account> {
        self.balances.create_account(user_id, initial_credits).await
    }

    /// Record a pending transaction before dispatching a request.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative estimate, or a store error.
    pub async fn create_pending_transaction(
        &self,
        new: NewTransaction,
    ) -> Result<CreditTransaction> {
        self.ledger.create_pending(new).await
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
        self.ledger.get_by_message_id(message_id).await
    }

    /// Complete a pending transaction and charge its user for the usage.
    ///
    /// The cost is priced from the transaction's recorded model and thinking
    /// flag. Completion and charge land together or not at all; if the user
    /// cannot be charged the transaction is failed.
    ///
    /// # Errors
    ///
    /// Returns a validation error for negative counts, or a store error.
    pub async fn complete_transaction_with_deduction(
        &self,
        transaction_id: &TransactionId,
        message_id: MessageId,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<CompletionOutcome> {
        if input_tokens < 0 || output_tokens < 0 {
            return Err(BillingError::NegativeTokens {
                input_tokens,
                output_tokens,
            }
            .into());
        }

        let outcome = self
            .settle(transaction_id, message_id, input_tokens, output_tokens)
            .await?;

        match &outcome {
            CompletionOutcome::Completed {
                transaction,
                account,
            } => info!(
                transaction_id = %transaction_id,
                user_id = %account.user_id,
                cost = transaction.actual_cost,
                balance = account.credits,
                outcome = outcome.label(),
                "Transaction settled"
            ),
            CompletionOutcome::Failed { reason } => warn!(
                transaction_id = %transaction_id,
                reason = %reason,
                outcome = outcome.label(),
                "Transaction could not be charged"
            ),
            CompletionOutcome::AlreadyResolved { .. } | CompletionOutcome::NotFound => info!(
                transaction_id = %transaction_id,
                outcome = outcome.label(),
                "Settlement skipped"
            ),
        }
        Ok(outcome)
    }

    async fn settle(
        &self,
        transaction_id: &TransactionId,
        message_id: MessageId,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<CompletionOutcome> {
        let Some(transaction) = self.ledger.get_by_id(transaction_id).await? else {
            return Ok(CompletionOutcome::NotFound);
        };
        if !transaction.is_pending() {
            return Ok(CompletionOutcome::AlreadyResolved {
                status: transaction.status,
            });
        }

        let model_config = match self.registry.get_model_config(&transaction.model) {
            Ok(config) => config,
            Err(BillingError::UnknownModel { model_id, .. }) => {
                return self
                    .fail_unchargeable(transaction_id, FailureReason::UnknownModel(model_id))
                    .await;
            }
            Err(err) => return Err(err.into()),
        };
        let actual_cost = calculate_cost_in_credits(
            input_tokens,
            output_tokens,
            model_config,
            transaction.thinking_enabled,
        )?;

        let settlement = Settlement::new(
            *transaction_id,
            transaction.user_id,
            Completion {
                message_id,
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
                actual_cost,
            },
        );

        match self.run_unit_of_work(&settlement).await? {
            SettleOutcome::Settled {
                transaction,
                account,
            } => Ok(CompletionOutcome::Completed {
                transaction,
                account,
            }),
            SettleOutcome::NotPending => self.resolved_elsewhere(transaction_id).await,
            SettleOutcome::AccountMissing => {
                self.fail_unchargeable(transaction_id, FailureReason::AccountMissing)
                    .await
            }
            SettleOutcome::ChargeFailed => Ok(CompletionOutcome::Failed {
                reason: FailureReason::ChargeFailed,
            }),
        }
    }

    /// Settle atomically, falling back to compensation on stores without
    /// multi-statement transactions.
    async fn run_unit_of_work(&self, settlement: &Settlement) -> Result<SettleOutcome> {
        match AtomicUnitOfWork::new(Arc::clone(&self.store))
            .settle(settlement)
            .await
        {
            Err(StoreError::TransactionsUnsupported) => {
                info!(
                    transaction_id = %settlement.transaction_id,
                    "Store lacks transactions, settling with compensation"
                );
                Ok(CompensatingUnitOfWork::new(Arc::clone(&self.store))
                    .settle(settlement)
                    .await?)
            }
            other => Ok(other?),
        }
    }

    /// Fail a still-pending transaction that cannot be charged.
    ///
    /// After a compensating rollback the record is already failed and the
    /// guarded update is a no-op.
    async fn fail_unchargeable(
        &self,
        transaction_id: &TransactionId,
        reason: FailureReason,
    ) -> Result<CompletionOutcome> {
        self.ledger.fail_transaction(transaction_id).await?;
        Ok(CompletionOutcome::Failed { reason })
    }

    async fn resolved_elsewhere(&self, transaction_id: &TransactionId) -> Result<CompletionOutcome> {
        Ok(match self.ledger.get_by_id(transaction_id).await? {
            Some(transaction) => CompletionOutcome::AlreadyResolved {
                status: transaction.status,
            },
            None => CompletionOutcome::NotFound,
        })
    }

    /// Fail a pending transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn fail_transaction(&self, transaction_id: &TransactionId) -> Result<FailOutcome> {
        if let Some(transaction) = self.ledger.fail_transaction(transaction_id).await? {
            return Ok(FailOutcome::Failed(transaction));
        }
        Ok(match self.ledger.get_by_id(transaction_id).await? {
            Some(transaction) => FailOutcome::AlreadyResolved {
                status: transaction.status,
            },
            None => FailOutcome::NotFound,
        })
    }

    /// One page of a user's transactions, newest first.
    ///
    /// `status`, if given, must name a transaction status (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns a validation error for an out-of-range page or page size or an
    /// unknown status, or a store error.
    pub async fn get_user_transactions(
        &self,
        user_id: &UserId,
        page: u32,
        page_size: u32,
        status: Option<&str>,
    ) -> Result<TransactionPage> {
        let status = status
            .map(str::parse::<TransactionStatus>)
            .transpose()?;
        self.ledger
            .get_user_transactions(user_id, page, page_size, status)
            .await
    }

    /// Add `amount` (possibly negative) to a user's credits outside the ledger.
    ///
    /// Returns `None` if the user has no account.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn adjust_credits_admin(
        &self,
        user_id: &UserId,
        amount: f64,
        reason: &str,
        admin_user_id: &UserId,
    ) -> Result<Option<Account>> {
        let account = self.balances.adjust(user_id, amount).await?;

        match &account {
            Some(account) => warn!(
                user_id = %user_id,
                admin_user_id = %admin_user_id,
                amount,
                reason,
                balance = account.credits,
                "Admin credit adjustment"
            ),
            None => warn!(
                user_id = %user_id,
                admin_user_id = %admin_user_id,
                amount,
                reason,
                "Admin credit adjustment for unknown user"
            ),
        }
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_completed_outcomes_report_nothing_applied() {
        assert!(!CompletionOutcome::NotFound.is_completed());
        assert!(CompletionOutcome::NotFound.into_completed().is_none());
        assert!(!CompletionOutcome::AlreadyResolved {
            status: TransactionStatus::Completed
        }
        .is_completed());
        assert!(!FailOutcome::NotFound.applied());
        assert!(!FailOutcome::AlreadyResolved {
            status: TransactionStatus::Failed
        }
        .applied());
    }

    #[test]
    fn failure_reason_reads_well_in_logs() {
        assert_eq!(FailureReason::AccountMissing.to_string(), "account missing");
        assert_eq!(
            FailureReason::UnknownModel("gpt-x".into()).to_string(),
            "unknown model gpt-x"
        );
        assert_eq!(FailureReason::ChargeFailed.to_string(), "charge failed");
    }
}
