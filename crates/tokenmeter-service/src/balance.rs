//! Account balances.

use std::sync::Arc;

use tracing::{debug, info};

use tokenmeter_core::{Account, BalanceDelta, UserId, MIN_CREDIT_THRESHOLD};
use tokenmeter_store::BalanceStore;

use crate::error::Result;
use crate::ledger::ensure_non_negative;

/// Reads and adjusts per-user balances.
pub struct BalanceChecker<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for BalanceChecker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: BalanceStore + ?Sized> BalanceChecker<S> {
    /// Create a checker over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Whether the user may start a request.
    ///
    /// True iff the user exists and holds at least [`MIN_CREDIT_THRESHOLD`]
    /// credits. The estimate is validated but not compared to the balance.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative estimate, or a store error.
    pub async fn check_balance(&self, user_id: &UserId, estimated_cost: f64) -> Result<bool> {
        ensure_non_negative("estimated_cost", estimated_cost)?;

        let Some(account) = self.store.get_account(user_id).await? else {
            debug!(user_id = %user_id, "Balance check for unknown user");
            return Ok(false);
        };

        let sufficient = account.meets_threshold();
        debug!(
            user_id = %user_id,
            credits = account.credits,
            threshold = MIN_CREDIT_THRESHOLD,
            estimated_cost,
            sufficient,
            "Balance checked"
        );
        Ok(sufficient)
    }

    /// The user's account, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<Option<Account>> {
        Ok(self.store.get_account(user_id).await?)
    }

    /// Open an account with `initial_credits`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative grant, or a store error
    /// (`Conflict` if the account exists).
    pub async fn create_account(&self, user_id: UserId, initial_credits: f64) -> Result<Account> {
        ensure_non_negative("initial_credits", initial_credits)?;

        let account = Account::new(user_id, initial_credits);
        self.store.insert_account(&account).await?;
        info!(user_id = %user_id, credits = initial_credits, "Account created");
        Ok(account)
    }

    /// Add `amount` (possibly negative) to the user's credits.
    ///
    /// Returns `None` if the user has no account.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn adjust(&self, user_id: &UserId, amount: f64) -> Result<Option<Account>> {
        Ok(self
            .store
            .increment_balance(user_id, &BalanceDelta::adjustment(amount))
            .await?)
    }
}
