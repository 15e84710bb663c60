//! Core types and pricing for tokenmeter.
//!
//! This crate provides the foundational types used throughout the tokenmeter
//! credit ledger:
//!
//! - **Identifiers**: `UserId`, `ChatId`, `MessageId`, `TransactionId`
//! - **Ledger**: `CreditTransaction`, `TransactionStatus`, `Transition`
//! - **Balances**: `Account`, `BalanceDelta`
//! - **Models**: `ModelRegistry`, `ModelConfig`, `ModelPricing`
//! - **Pricing**: `calculate_cost_in_credits`
//! - **Messages**: `ChatMessage`, `TokenUsage`
//!
//! # Credit Unit
//!
//! **1 credit = ¥0.001**
//!
//! - Model prices are quoted in CNY per 1,000 tokens
//! - Costs are converted to credits and rounded to two decimals
//! - Balances are fractional (`f64`) and may go negative after a large request

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod credits;
pub mod error;
pub mod ids;
pub mod message;
pub mod models;
pub mod pricing;

pub use account::{Account, BalanceDelta, MIN_CREDIT_THRESHOLD};
pub use credits::{Completion, CreditTransaction, TransactionStatus, Transition};
pub use error::{BillingError, Result};
pub use ids::{ChatId, IdError, MessageId, TransactionId, UserId};
pub use message::{ChatMessage, TokenUsage};
pub use models::{ModelConfig, ModelPricing, ModelRegistry};
pub use pricing::{calculate_cost_in_credits, round_credits, CREDIT_TO_CNY_RATE};
