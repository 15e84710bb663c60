//! Account types for tokenmeter.
//!
//! An account holds a user's credit balance and lifetime usage counters. It is
//! only ever changed by applying a [`BalanceDelta`] atomically in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Minimum balance a user needs before starting any billable request.
pub const MIN_CREDIT_THRESHOLD: f64 = 10.0;

/// A user's credit balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// The user ID.
    pub user_id: UserId,

    /// Current credit balance. May go negative when a request costs more
    /// than the remaining balance.
    pub credits: f64,

    /// Lifetime tokens billed.
    pub total_tokens_used: i64,

    /// Lifetime credits charged for usage. Never decreases.
    pub total_credits_spent: f64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with an opening balance.
    #[must_use]
    pub fn new(user_id: UserId, credits: f64) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            credits,
            total_tokens_used: 0,
            total_credits_spent: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the balance clears [`MIN_CREDIT_THRESHOLD`].
    #[must_use]
    pub fn meets_threshold(&self) -> bool {
        self.credits >= MIN_CREDIT_THRESHOLD
    }

    /// Apply a delta in place. Store backends call this inside their critical
    /// section; nothing else should.
    pub fn apply(&mut self, delta: &BalanceDelta, now: DateTime<Utc>) {
        self.credits += delta.credits;
        self.total_tokens_used += delta.tokens_used;
        self.total_credits_spent += delta.credits_spent;
        self.updated_at = now;
    }
}

/// An increment applied atomically to an account.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BalanceDelta {
    /// Change to `credits` (negative for a charge).
    pub credits: f64,
    /// Added to `total_tokens_used`.
    pub tokens_used: i64,
    /// Added to `total_credits_spent`. Never negative.
    pub credits_spent: f64,
}

impl BalanceDelta {
    /// Charge for usage: debits `cost` and records it as spent.
    #[must_use]
    pub fn charge(cost: f64, tokens: i64) -> Self {
        Self {
            credits: -cost,
            tokens_used: tokens,
            credits_spent: cost,
        }
    }

    /// Manual balance correction that does not count as spending.
    #[must_use]
    pub const fn adjustment(amount: f64) -> Self {
        Self {
            credits: amount,
            tokens_used: 0,
            credits_spent: 0.0,
        }
    }
}
