//! Settlement units of work.
//!
//! Completing a transaction and charging its user are two writes. A store that
//! can run multi-statement transactions applies both atomically
//! ([`AtomicUnitOfWork`]). One that cannot gets them in sequence, with the
//! completion rolled back if the charge does not land
//! ([`CompensatingUnitOfWork`]).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use tokenmeter_core::{TransactionStatus, Transition};
use tokenmeter_store::{SettleOutcome, Settlement, Store, StoreError};

/// Applies a [`Settlement`].
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Complete the transaction and charge the account.
    ///
    /// Never leaves a completed transaction without its charge behind.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::TransactionsUnsupported` from an atomic unit on a
    /// store without transactions, or any store failure that leaves the
    /// settlement unresolved.
    async fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome, StoreError>;
}

/// Settles inside one store transaction.
pub struct AtomicUnitOfWork<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> AtomicUnitOfWork<S> {
    /// Create a unit over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store + ?Sized> UnitOfWork for AtomicUnitOfWork<S> {
    async fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome, StoreError> {
        self.store.settle_atomically(settlement).await
    }
}

/// Settles with two sequential writes, undoing the first if the second fails.
pub struct CompensatingUnitOfWork<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> CompensatingUnitOfWork<S> {
    /// Create a unit over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: Store + ?Sized> CompensatingUnitOfWork<S> {
    /// Move a transaction this unit completed on to `Failed`.
    async fn compensate(&self, settlement: &Settlement) -> Result<(), StoreError> {
        let rolled_back = self
            .store
            .transition_transaction(
                &settlement.transaction_id,
                TransactionStatus::Completed,
                &Transition::Fail,
            )
            .await?;

        if rolled_back.is_none() {
            error!(
                transaction_id = %settlement.transaction_id,
                "Compensation found transaction no longer completed"
            );
        } else {
            warn!(
                transaction_id = %settlement.transaction_id,
                user_id = %settlement.user_id,
                "Completion rolled back, transaction failed"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Store + ?Sized> UnitOfWork for CompensatingUnitOfWork<S> {
    async fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome, StoreError> {
        let Some(transaction) = self
            .store
            .transition_transaction(
                &settlement.transaction_id,
                TransactionStatus::Pending,
                &Transition::Complete(settlement.completion.clone()),
            )
            .await?
        else {
            return Ok(SettleOutcome::NotPending);
        };

        match self
            .store
            .increment_balance(&settlement.user_id, &settlement.delta)
            .await
        {
            Ok(Some(account)) => Ok(SettleOutcome::Settled {
                transaction,
                account,
            }),
            Ok(None) => {
                self.compensate(settlement).await?;
                Ok(SettleOutcome::AccountMissing)
            }
            Err(err) => {
                error!(
                    transaction_id = %settlement.transaction_id,
                    error = %err,
                    "Balance update failed, compensating"
                );
                self.compensate(settlement).await?;
                Ok(SettleOutcome::ChargeFailed)
            }
        }
    }
}
