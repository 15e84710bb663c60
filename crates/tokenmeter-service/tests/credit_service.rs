//! Credit service integration tests.

mod common;

use std::sync::Arc;

use common::{assert_credits, FailingBalanceStore, TestHarness};

use tokenmeter_core::{ChatId, MessageId, ModelRegistry, TransactionId, TransactionStatus, UserId};
use tokenmeter_service::{
    CompletionOutcome, CreditService, FailOutcome, FailureReason, NewTransaction,
};

// ============================================================================
// Settlement
// ============================================================================

#[tokio::test]
async fn completion_charges_priced_cost() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;
    let pending = harness.pending("qwen-plus", false).await;
    let message_id = MessageId::generate();

    let outcome = harness
        .credits
        .complete_transaction_with_deduction(&pending.transaction_id, message_id, 500, 1000)
        .await
        .unwrap();

    let (transaction, account) = outcome.into_completed().expect("should complete");
    assert_eq!(transaction.status, TransactionStatus::Completed);
    assert_eq!(transaction.message_id, Some(message_id));
    assert_eq!(transaction.total_tokens, Some(1500));
    assert_eq!(transaction.actual_cost, Some(2.4));
    assert!(transaction.completed_at.is_some());

    assert_credits(account.credits, 97.6);
    assert_eq!(account.total_tokens_used, 1500);
    assert_credits(account.total_credits_spent, 2.4);
}

#[tokio::test]
async fn thinking_flag_is_taken_from_the_transaction() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;
    let pending = harness.pending("qwen-plus", true).await;

    let (transaction, _) = harness
        .credits
        .complete_transaction_with_deduction(
            &pending.transaction_id,
            MessageId::generate(),
            500,
            1000,
        )
        .await
        .unwrap()
        .into_completed()
        .unwrap();

    assert_eq!(transaction.actual_cost, Some(8.4));
    assert_credits(harness.balance().await, 91.6);
}

#[tokio::test]
async fn second_completion_is_a_no_op() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;
    let pending = harness.pending("qwen-plus", false).await;
    let id = pending.transaction_id;

    let first = harness
        .credits
        .complete_transaction_with_deduction(&id, MessageId::generate(), 500, 1000)
        .await
        .unwrap();
    assert!(first.is_completed());

    let second = harness
        .credits
        .complete_transaction_with_deduction(&id, MessageId::generate(), 500, 1000)
        .await
        .unwrap();
    assert_eq!(
        second,
        CompletionOutcome::AlreadyResolved {
            status: TransactionStatus::Completed
        }
    );
    assert_credits(harness.balance().await, 97.6);
}

#[tokio::test]
async fn unknown_transaction_is_not_found() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;

    let outcome = harness
        .credits
        .complete_transaction_with_deduction(
            &TransactionId::generate(),
            MessageId::generate(),
            1,
            1,
        )
        .await
        .unwrap();
    assert_eq!(outcome, CompletionOutcome::NotFound);
}

#[tokio::test]
async fn negative_tokens_are_rejected_without_writes() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;
    let pending = harness.pending("qwen-plus", false).await;

    let err = harness
        .credits
        .complete_transaction_with_deduction(
            &pending.transaction_id,
            MessageId::generate(),
            -5,
            10,
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let stored = harness
        .credits
        .ledger()
        .get_by_id(&pending.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_pending());
    assert_credits(harness.balance().await, 100.0);
}

#[tokio::test]
async fn missing_account_fails_transaction_in_atomic_mode() {
    let harness = TestHarness::new();
    let pending = harness.pending("qwen-plus", false).await;

    let outcome = harness
        .credits
        .complete_transaction_with_deduction(
            &pending.transaction_id,
            MessageId::generate(),
            500,
            1000,
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Failed {
            reason: FailureReason::AccountMissing
        }
    );

    let stored = harness
        .credits
        .ledger()
        .get_by_id(&pending.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransactionStatus::Failed);
}

#[tokio::test]
async fn retired_model_fails_transaction() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;
    let pending = harness.pending("retired-model", false).await;

    let outcome = harness
        .credits
        .complete_transaction_with_deduction(
            &pending.transaction_id,
            MessageId::generate(),
            10,
            10,
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Failed {
            reason: FailureReason::UnknownModel("retired-model".into())
        }
    );
    assert_credits(harness.balance().await, 100.0);
}

// ============================================================================
// Settlement without store transactions
// ============================================================================

#[tokio::test]
async fn standalone_store_settles_sequentially() {
    let harness = TestHarness::standalone();
    harness.fund(100.0).await;
    let pending = harness.pending("qwen-plus", false).await;

    let outcome = harness
        .credits
        .complete_transaction_with_deduction(
            &pending.transaction_id,
            MessageId::generate(),
            500,
            1000,
        )
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert_credits(harness.balance().await, 97.6);
}

#[tokio::test]
async fn standalone_store_compensates_missing_account() {
    let harness = TestHarness::standalone();
    let pending = harness.pending("qwen-plus", false).await;

    let outcome = harness
        .credits
        .complete_transaction_with_deduction(
            &pending.transaction_id,
            MessageId::generate(),
            500,
            1000,
        )
        .await
        .unwrap();
    assert!(!outcome.is_completed());

    let stored = harness
        .credits
        .ledger()
        .get_by_id(&pending.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransactionStatus::Failed);
}

#[tokio::test]
async fn standalone_store_compensates_failed_charge() {
    let store = Arc::new(FailingBalanceStore::new());
    let credits = CreditService::new(Arc::clone(&store), Arc::new(ModelRegistry::builtin()));
    let user_id = UserId::generate();
    credits.create_account(user_id, 100.0).await.unwrap();
    let pending = credits
        .create_pending_transaction(NewTransaction {
            user_id,
            chat_id: ChatId::generate(),
            estimated_cost: 1.0,
            model: "qwen-plus".into(),
            request_type: "chat".into(),
            thinking_enabled: false,
        })
        .await
        .unwrap();
    let message_id = MessageId::generate();

    let outcome = credits
        .complete_transaction_with_deduction(&pending.transaction_id, message_id, 500, 1000)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Failed {
            reason: FailureReason::ChargeFailed
        }
    );

    let stored = credits
        .ledger()
        .get_by_id(&pending.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransactionStatus::Failed);
    assert!(stored.message_id.is_none());
    assert!(stored.total_tokens.is_none());
    assert!(stored.actual_cost.is_none());
    assert!(credits.get_by_message_id(&message_id).await.unwrap().is_none());

    let account = credits.get_balance(&user_id).await.unwrap().unwrap();
    assert_credits(account.credits, 100.0);
}

// ============================================================================
// Failing
// ============================================================================

#[tokio::test]
async fn fail_is_applied_once() {
    let harness = TestHarness::new();
    let pending = harness.pending("qwen-plus", false).await;
    let id = pending.transaction_id;

    let first = harness.credits.fail_transaction(&id).await.unwrap();
    assert!(first.applied());
    let FailOutcome::Failed(transaction) = first else {
        unreachable!();
    };
    assert_eq!(transaction.status, TransactionStatus::Failed);
    assert!(transaction.completed_at.is_some());

    let second = harness.credits.fail_transaction(&id).await.unwrap();
    assert_eq!(
        second,
        FailOutcome::AlreadyResolved {
            status: TransactionStatus::Failed
        }
    );

    let missing = harness
        .credits
        .fail_transaction(&TransactionId::generate())
        .await
        .unwrap();
    assert_eq!(missing, FailOutcome::NotFound);
}

#[tokio::test]
async fn completed_transaction_cannot_be_failed() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;
    let pending = harness.pending("qwen-plus", false).await;
    harness
        .credits
        .complete_transaction_with_deduction(
            &pending.transaction_id,
            MessageId::generate(),
            1,
            1,
        )
        .await
        .unwrap();

    let outcome = harness
        .credits
        .fail_transaction(&pending.transaction_id)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FailOutcome::AlreadyResolved {
            status: TransactionStatus::Completed
        }
    );
}

// ============================================================================
// Balance and listing
// ============================================================================

#[tokio::test]
async fn check_balance_uses_threshold() {
    let funded = TestHarness::new();
    funded.fund(10.0).await;
    assert!(funded
        .credits
        .check_balance(&funded.user_id, 5.0)
        .await
        .unwrap());

    let short = TestHarness::new();
    short.fund(5.0).await;
    assert!(!short.credits.check_balance(&short.user_id, 5.0).await.unwrap());

    let nobody = TestHarness::new();
    assert!(!nobody
        .credits
        .check_balance(&nobody.user_id, 5.0)
        .await
        .unwrap());
}

#[tokio::test]
async fn estimate_matches_settled_cost() {
    let harness = TestHarness::new();
    let estimate = harness
        .credits
        .estimate_cost("qwen-plus", 500, 1000, true)
        .unwrap();
    assert!((estimate - 8.4).abs() < 1e-9);

    let err = harness
        .credits
        .estimate_cost("no-such-model", 1, 1, false)
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn listing_accepts_status_names() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;
    for _ in 0..3 {
        harness.pending("qwen-plus", false).await;
    }
    let done = harness.pending("qwen-plus", false).await;
    harness
        .credits
        .complete_transaction_with_deduction(&done.transaction_id, MessageId::generate(), 1, 1)
        .await
        .unwrap();

    let completed = harness
        .credits
        .get_user_transactions(&harness.user_id, 1, 10, Some("COMPLETED"))
        .await
        .unwrap();
    assert_eq!(completed.total, 1);

    let page = harness
        .credits
        .get_user_transactions(&harness.user_id, 1, 2, None)
        .await
        .unwrap();
    assert_eq!(page.transactions.len(), 2);
    assert_eq!(page.total, 4);

    let err = harness
        .credits
        .get_user_transactions(&harness.user_id, 1, 10, Some("refunded"))
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn message_lookup_after_settlement() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;
    let pending = harness.pending("qwen-turbo", false).await;
    let message_id = MessageId::generate();
    harness
        .credits
        .complete_transaction_with_deduction(&pending.transaction_id, message_id, 100, 100)
        .await
        .unwrap();

    let found = harness
        .credits
        .get_by_message_id(&message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.transaction_id, pending.transaction_id);
}

#[tokio::test]
async fn admin_adjustment_bypasses_ledger() {
    let harness = TestHarness::new();
    harness.fund(20.0).await;
    let admin = tokenmeter_core::UserId::generate();

    let account = harness
        .credits
        .adjust_credits_admin(&harness.user_id, -7.5, "refund reversal", &admin)
        .await
        .unwrap()
        .unwrap();
    assert_credits(account.credits, 12.5);

    let page = harness
        .credits
        .get_user_transactions(&harness.user_id, 1, 10, None)
        .await
        .unwrap();
    assert_eq!(page.total, 0);

    let missing = harness
        .credits
        .adjust_credits_admin(&tokenmeter_core::UserId::generate(), 5.0, "grant", &admin)
        .await
        .unwrap();
    assert!(missing.is_none());
}

// ============================================================================
// Races
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_charge_once() {
    let harness = TestHarness::new();
    harness.fund(100.0).await;
    let pending = harness.pending("qwen-plus", false).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let credits = harness.credits.clone();
            let id = pending.transaction_id;
            tokio::spawn(async move {
                credits
                    .complete_transaction_with_deduction(&id, MessageId::generate(), 500, 1000)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut completed = 0;
    for handle in handles {
        if handle.await.unwrap().is_completed() {
            completed += 1;
        }
    }

    assert_eq!(completed, 1);
    assert_credits(harness.balance().await, 97.6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completion_racing_failure_has_one_winner() {
    for _ in 0..20 {
        let harness = TestHarness::standalone();
        harness.fund(100.0).await;
        let pending = harness.pending("qwen-plus", false).await;
        let id = pending.transaction_id;

        let completer = {
            let credits = harness.credits.clone();
            tokio::spawn(async move {
                credits
                    .complete_transaction_with_deduction(&id, MessageId::generate(), 500, 1000)
                    .await
                    .unwrap()
            })
        };
        let failer = {
            let credits = harness.credits.clone();
            tokio::spawn(async move { credits.fail_transaction(&id).await.unwrap() })
        };

        let completion = completer.await.unwrap();
        let failure = failer.await.unwrap();
        assert_ne!(completion.is_completed(), failure.applied());

        let stored = harness.credits.ledger().get_by_id(&id).await.unwrap().unwrap();
        if completion.is_completed() {
            assert_eq!(stored.status, TransactionStatus::Completed);
            assert_credits(harness.balance().await, 97.6);
        } else {
            assert_eq!(stored.status, TransactionStatus::Failed);
            assert_credits(harness.balance().await, 100.0);
        }
    }
}
