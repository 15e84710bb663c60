//! Reconciliation worker.
//!
//! Sweeps transactions left pending by requests that never settled. Each
//! candidate is completed from the usage its chat message recorded, or failed
//! when no usage is available. The sweep relies on the ledger's conditional
//! update, so it may run alongside the request path and alongside itself.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use tokenmeter_core::{CreditTransaction, TransactionId};
use tokenmeter_store::{MessageStore, Store};

use crate::credit::CreditService;
use crate::error::Result;

/// Default age after which a pending transaction counts as stuck.
pub const DEFAULT_STUCK_AGE_MINUTES: u32 = 10;

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stuck transactions found.
    pub scanned: usize,
    /// Completed and charged.
    pub completed: usize,
    /// Failed, or could not be processed.
    pub failed: usize,
    /// Resolved by someone else before this pass reached them.
    pub skipped: usize,
}

impl ReconcileReport {
    /// Candidates that reached a verdict.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Completed,
    Failed,
    Skipped,
}

/// The reconciliation worker.
pub struct ReconcileWorker<S: ?Sized, M: ?Sized> {
    credits: CreditService<S>,
    messages: Arc<M>,
    age_minutes: u32,
}

impl<S, M> ReconcileWorker<S, M>
where
    S: Store + ?Sized,
    M: MessageStore + ?Sized,
{
    /// Create a worker treating transactions older than `age_minutes` as stuck.
    #[must_use]
    pub fn new(credits: CreditService<S>, messages: Arc<M>, age_minutes: u32) -> Self {
        Self {
            credits,
            messages,
            age_minutes,
        }
    }

    /// Run one pass over every stuck transaction.
    ///
    /// Failures on individual transactions are logged and counted as failed;
    /// the pass continues with the next one.
    ///
    /// # Errors
    ///
    /// Returns an error only if the stuck transactions cannot be listed.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let candidates = self
            .credits
            .ledger()
            .find_stuck_transactions(self.age_minutes)
            .await?;

        let mut report = ReconcileReport {
            scanned: candidates.len(),
            ..ReconcileReport::default()
        };
        debug!(
            candidates = report.scanned,
            age_minutes = self.age_minutes,
            "Reconciliation pass started"
        );

        for candidate in &candidates {
            match self.reconcile(candidate).await {
                Ok(Verdict::Completed) => report.completed += 1,
                Ok(Verdict::Failed) => report.failed += 1,
                Ok(Verdict::Skipped) => report.skipped += 1,
                Err(err) => {
                    error!(
                        transaction_id = %candidate.transaction_id,
                        error = %err,
                        "Failed to reconcile transaction"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    /// Run a pass every `period` until `shutdown` resolves.
    ///
    /// The first pass runs immediately. A pass that errors is logged and the
    /// loop carries on.
    pub async fn run_periodically<F>(&self, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Reconciliation loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(error = %err, "Reconciliation pass failed");
                    }
                }
            }
        }
    }

    async fn reconcile(&self, candidate: &CreditTransaction) -> Result<Verdict> {
        let transaction_id = &candidate.transaction_id;

        let Some(message) = self.messages.get_by_transaction_id(transaction_id).await? else {
            warn!(transaction_id = %transaction_id, "No message for stuck transaction");
            return self.fail(transaction_id).await;
        };
        let Some(usage) = message.token_usage() else {
            warn!(
                transaction_id = %transaction_id,
                message_id = %message.message_id,
                "Message carries no usable token counts"
            );
            return self.fail(transaction_id).await;
        };

        // The request path may have settled it since the scan.
        match self.credits.ledger().get_by_id(transaction_id).await? {
            Some(current) if current.is_pending() => {}
            _ => {
                debug!(transaction_id = %transaction_id, "Already resolved, skipping");
                return Ok(Verdict::Skipped);
            }
        }

        let outcome = self
            .credits
            .complete_transaction_with_deduction(
                transaction_id,
                message.message_id,
                usage.input_tokens,
                usage.output_tokens,
            )
            .await?;

        Ok(if outcome.is_completed() {
            Verdict::Completed
        } else {
            Verdict::Failed
        })
    }

    async fn fail(&self, transaction_id: &TransactionId) -> Result<Verdict> {
        self.credits.fail_transaction(transaction_id).await?;
        Ok(Verdict::Failed)
    }
}
