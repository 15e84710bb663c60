//! Credit transaction types for tokenmeter.
//!
//! A credit transaction is the billing record of one LLM request. It is created
//! `Pending` before the request is dispatched and resolved exactly once, to
//! `Completed` (with token counts and the actual cost) or to `Failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BillingError;
use crate::{ChatId, MessageId, TransactionId, UserId};

/// Lifecycle state of a credit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Request dispatched, not yet billed.
    Pending,
    /// Billed; the user's balance has been charged.
    Completed,
    /// Abandoned without a charge.
    Failed,
}

impl TransactionStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 3] = [Self::Pending, Self::Completed, Self::Failed];

    /// Lowercase name as persisted.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(BillingError::UnknownStatus(s.to_string())),
        }
    }
}

/// Token counts and cost recorded when a transaction completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// The assistant message produced by the request.
    pub message_id: MessageId,
    /// Prompt tokens.
    pub input_tokens: i64,
    /// Generated tokens.
    pub output_tokens: i64,
    /// `input_tokens + output_tokens`.
    pub total_tokens: i64,
    /// Credits charged.
    pub actual_cost: f64,
}

/// A state change applied through the ledger's conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Move to `Completed`, recording usage and cost.
    Complete(Completion),
    /// Move to `Failed`.
    Fail,
}

impl Transition {
    /// The status the record ends up in.
    #[must_use]
    pub const fn target(&self) -> TransactionStatus {
        match self {
            Self::Complete(_) => TransactionStatus::Completed,
            Self::Fail => TransactionStatus::Failed,
        }
    }
}

/// The billing record of one LLM request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub transaction_id: TransactionId,

    /// The user being charged.
    pub user_id: UserId,

    /// The chat the request belongs to.
    pub chat_id: ChatId,

    /// Assistant message, set on completion.
    pub message_id: Option<MessageId>,

    /// Lifecycle state.
    pub status: TransactionStatus,

    /// Advisory cost estimate made before dispatch.
    pub estimated_cost: f64,

    /// Prompt tokens, set on completion.
    pub input_tokens: Option<i64>,

    /// Generated tokens, set on completion.
    pub output_tokens: Option<i64>,

    /// Total tokens, set on completion.
    pub total_tokens: Option<i64>,

    /// Credits charged, set on completion.
    pub actual_cost: Option<f64>,

    /// Model id the request was dispatched to.
    pub model: String,

    /// Whether thinking mode was requested; drives the output multiplier.
    #[serde(default)]
    pub thinking_enabled: bool,

    /// Kind of request (e.g. "chat").
    pub request_type: String,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl CreditTransaction {
    /// Create a new pending transaction with a fresh id.
    #[must_use]
    pub fn pending(
        user_id: UserId,
        chat_id: ChatId,
        estimated_cost: f64,
        model: impl Into<String>,
        request_type: impl Into<String>,
        thinking_enabled: bool,
    ) -> Self {
        Self {
            transaction_id: TransactionId::generate(),
            user_id,
            chat_id,
            message_id: None,
            status: TransactionStatus::Pending,
            estimated_cost,
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
            actual_cost: None,
            model: model.into(),
            thinking_enabled,
            request_type: request_type.into(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether the record is still awaiting resolution.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, TransactionStatus::Pending)
    }

    /// Apply `transition` if the record is currently in `expected`.
    ///
    /// Returns `false` and leaves the record untouched otherwise. Store
    /// backends call this inside their critical section.
    ///
    /// Failing a record clears any usage it carried, so a rolled-back
    /// completion shows no charge.
    pub fn apply(
        &mut self,
        expected: TransactionStatus,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != expected {
            return false;
        }

        let completion = match transition {
            Transition::Complete(completion) => Some(completion),
            Transition::Fail => None,
        };
        self.message_id = completion.map(|c| c.message_id);
        self.input_tokens = completion.map(|c| c.input_tokens);
        self.output_tokens = completion.map(|c| c.output_tokens);
        self.total_tokens = completion.map(|c| c.total_tokens);
        self.actual_cost = completion.map(|c| c.actual_cost);
        self.status = transition.target();
        self.completed_at = Some(now);
        true
    }
}
