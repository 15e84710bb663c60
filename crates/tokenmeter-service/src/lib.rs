//! Tokenmeter credit services.
//!
//! This crate provides the credit ledger logic on top of `tokenmeter-store`:
//!
//! - [`TransactionLedger`]: pending transactions and their guarded resolution
//! - [`BalanceChecker`]: balance checks, accounts and adjustments
//! - [`CreditService`]: the request path, including settlement of usage
//! - [`ReconcileWorker`]: the sweep over transactions left pending
//!
//! # Settlement
//!
//! Completing a transaction and charging its user happen together. Stores
//! with multi-statement transactions apply both atomically; on other stores
//! the completion is rolled back if the charge fails. Either way a completed
//! transaction always has its charge.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod config;
pub mod credit;
pub mod error;
pub mod ledger;
pub mod reconcile;
pub mod unit_of_work;

pub use balance::BalanceChecker;
pub use config::{StoreBackend, WorkerConfig};
pub use credit::{CompletionOutcome, CreditService, FailOutcome, FailureReason};
pub use error::{CreditError, Result};
pub use ledger::{NewTransaction, TransactionLedger, MAX_PAGE_SIZE};
pub use reconcile::{ReconcileReport, ReconcileWorker, DEFAULT_STUCK_AGE_MINUTES};
pub use unit_of_work::{AtomicUnitOfWork, CompensatingUnitOfWork, UnitOfWork};
