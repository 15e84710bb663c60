//! Reconciliation against the `RocksDB` backend.

#![cfg(feature = "rocksdb-backend")]

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::TempDir;

use tokenmeter_core::{
    ChatId, ChatMessage, CreditTransaction, MessageId, ModelRegistry, TransactionStatus, UserId,
};
use tokenmeter_service::{CreditService, ReconcileReport, ReconcileWorker};
use tokenmeter_store::{BalanceStore, LedgerStore, RocksStore};

fn stuck(user_id: UserId) -> CreditTransaction {
    let mut transaction =
        CreditTransaction::pending(user_id, ChatId::generate(), 1.0, "qwen-plus", "chat", false);
    transaction.created_at = Utc::now() - Duration::minutes(30);
    transaction
}

#[tokio::test]
async fn worker_settles_and_persists() {
    let dir = TempDir::new().unwrap();
    let user_id = UserId::generate();
    let recoverable = stuck(user_id);
    let orphan = stuck(user_id);

    {
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let credits =
            CreditService::new(Arc::clone(&store), Arc::new(ModelRegistry::builtin()));
        credits.create_account(user_id, 50.0).await.unwrap();
        store.insert_transaction(&recoverable).await.unwrap();
        store.insert_transaction(&orphan).await.unwrap();
        store
            .put_message(&ChatMessage {
                message_id: MessageId::generate(),
                transaction_id: Some(recoverable.transaction_id),
                chat_id: recoverable.chat_id,
                metadata: json!({ "input_tokens": 500, "output_tokens": 1000 }),
                created_at: Utc::now(),
            })
            .unwrap();

        let worker = ReconcileWorker::new(credits, Arc::clone(&store), 10);
        let report = worker.run_once().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                scanned: 2,
                completed: 1,
                failed: 1,
                skipped: 0,
            }
        );
    }

    let store = RocksStore::open(dir.path()).unwrap();
    let settled = store
        .get_transaction(&recoverable.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.status, TransactionStatus::Completed);
    assert_eq!(settled.actual_cost, Some(2.4));

    let failed = store
        .get_transaction(&orphan.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, TransactionStatus::Failed);

    let account = store.get_account(&user_id).await.unwrap().unwrap();
    assert!((account.credits - 47.6).abs() < 1e-9);
    assert!(store
        .find_pending_before(Utc::now())
        .await
        .unwrap()
        .is_empty());
}
