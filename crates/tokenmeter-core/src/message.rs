//! Chat message records consumed by the reconciliation worker.
//!
//! Messages are owned by the chat service. Tokenmeter only reads the token
//! counts the agent writes into a message's metadata once generation finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChatId, MessageId, TransactionId};

/// An assistant message as stored by the chat service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The message ID.
    pub message_id: MessageId,

    /// The credit transaction opened for the request that produced it.
    pub transaction_id: Option<TransactionId>,

    /// The chat the message belongs to.
    pub chat_id: ChatId,

    /// Free-form metadata; carries `input_tokens` and `output_tokens`.
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// When the message was stored.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Token usage recorded in the metadata, if complete.
    ///
    /// Both counts must be present as non-negative integers.
    #[must_use]
    pub fn token_usage(&self) -> Option<TokenUsage> {
        let count = |key: &str| {
            self.metadata
                .get(key)
                .and_then(serde_json::Value::as_i64)
                .filter(|n| *n >= 0)
        };

        Some(TokenUsage {
            input_tokens: count("input_tokens")?,
            output_tokens: count("output_tokens")?,
        })
    }
}

/// Token counts reported for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: i64,
    /// Generated tokens.
    pub output_tokens: i64,
}

impl TokenUsage {
    /// Sum of input and output tokens.
    #[must_use]
    pub const fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}
