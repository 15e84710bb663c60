//! PostgreSQL storage implementation.
//!
//! Conditional updates are single `UPDATE ... WHERE status = $expected
//! RETURNING *` statements and balance changes are in-place increments, so no
//! row is ever read and written back. Settlement runs both statements inside
//! one database transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, Row};
use uuid::Uuid;

use tokenmeter_core::{
    Account, BalanceDelta, ChatId, ChatMessage, CreditTransaction, MessageId, TransactionId,
    TransactionStatus, Transition, UserId,
};

use crate::error::{Result, StoreError};
use crate::{
    BalanceStore, LedgerStore, MessageStore, SettleOutcome, Settlement, Store, TransactionPage,
};

const TRANSITION_SQL: &str = r"
UPDATE credit_transactions
SET status        = $3,
    message_id    = $4,
    input_tokens  = $5,
    output_tokens = $6,
    total_tokens  = $7,
    actual_cost   = $8,
    completed_at  = $9
WHERE transaction_id = $1 AND status = $2
RETURNING *";

const INCREMENT_SQL: &str = r"
UPDATE users
SET credits             = credits + $2,
    total_tokens_used   = total_tokens_used + $3,
    total_credits_spent = total_credits_spent + $4,
    updated_at          = $5
WHERE user_id = $1
RETURNING *";

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be established.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// The underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(|e| {
            if rejects_transaction_blocks(&e) {
                StoreError::TransactionsUnsupported
            } else {
                e.into()
            }
        })
    }
}

/// Whether the server (typically a statement-mode pooler) refused `BEGIN`.
fn rejects_transaction_blocks(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.message().contains("transaction blocks not allowed"))
}

async fn transition_with<'e, E>(
    executor: E,
    transaction_id: &TransactionId,
    expected: TransactionStatus,
    transition: &Transition,
) -> Result<Option<CreditTransaction>>
where
    E: Executor<'e, Database = Postgres>,
{
    let completion = match transition {
        Transition::Complete(completion) => Some(completion),
        Transition::Fail => None,
    };

    let row = sqlx::query(TRANSITION_SQL)
        .bind(transaction_id.to_string())
        .bind(expected.as_str())
        .bind(transition.target().as_str())
        .bind(completion.map(|c| *c.message_id.as_uuid()))
        .bind(completion.map(|c| c.input_tokens))
        .bind(completion.map(|c| c.output_tokens))
        .bind(completion.map(|c| c.total_tokens))
        .bind(completion.map(|c| c.actual_cost))
        .bind(Utc::now())
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(transaction_from_row).transpose()
}

async fn increment_with<'e, E>(
    executor: E,
    user_id: &UserId,
    delta: &BalanceDelta,
) -> Result<Option<Account>>
where
    E: Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(INCREMENT_SQL)
        .bind(user_id.as_uuid())
        .bind(delta.credits)
        .bind(delta.tokens_used)
        .bind(delta.credits_spent)
        .bind(Utc::now())
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(account_from_row).transpose()
}

fn transaction_from_row(row: &PgRow) -> Result<CreditTransaction> {
    let transaction_id: String = row.try_get("transaction_id")?;
    let status: String = row.try_get("status")?;

    Ok(CreditTransaction {
        transaction_id: transaction_id
            .parse()
            .map_err(|e| StoreError::Serialization(format!("transaction_id {transaction_id}: {e}")))?,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        chat_id: ChatId::from_uuid(row.try_get("chat_id")?),
        message_id: row
            .try_get::<Option<Uuid>, _>("message_id")?
            .map(MessageId::from_uuid),
        status: status
            .parse()
            .map_err(|e| StoreError::Serialization(format!("status: {e}")))?,
        estimated_cost: row.try_get("estimated_cost")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
        actual_cost: row.try_get("actual_cost")?,
        model: row.try_get("model")?,
        thinking_enabled: row.try_get("thinking_enabled")?,
        request_type: row.try_get("request_type")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        credits: row.try_get("credits")?,
        total_tokens_used: row.try_get("total_tokens_used")?,
        total_credits_spent: row.try_get("total_credits_spent")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<ChatMessage> {
    let transaction_id = row
        .try_get::<Option<String>, _>("transaction_id")?
        .map(|id| {
            id.parse::<TransactionId>()
                .map_err(|e| StoreError::Serialization(format!("transaction_id {id}: {e}")))
        })
        .transpose()?;

    Ok(ChatMessage {
        message_id: MessageId::from_uuid(row.try_get("message_id")?),
        transaction_id,
        chat_id: ChatId::from_uuid(row.try_get("chat_id")?),
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn insert_transaction(&self, transaction: &CreditTransaction) -> Result<()> {
        let result = sqlx::query(
            r"
            INSERT INTO credit_transactions (
                transaction_id, user_id, chat_id, message_id, status, estimated_cost,
                input_tokens, output_tokens, total_tokens, actual_cost, model,
                thinking_enabled, request_type, created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (transaction_id) DO NOTHING",
        )
        .bind(transaction.transaction_id.to_string())
        .bind(transaction.user_id.as_uuid())
        .bind(transaction.chat_id.as_uuid())
        .bind(transaction.message_id.map(|id| *id.as_uuid()))
        .bind(transaction.status.as_str())
        .bind(transaction.estimated_cost)
        .bind(transaction.input_tokens)
        .bind(transaction.output_tokens)
        .bind(transaction.total_tokens)
        .bind(transaction.actual_cost)
        .bind(&transaction.model)
        .bind(transaction.thinking_enabled)
        .bind(&transaction.request_type)
        .bind(transaction.created_at)
        .bind(transaction.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "transaction {} already exists",
                transaction.transaction_id
            )));
        }
        Ok(())
    }

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        let row = sqlx::query("SELECT * FROM credit_transactions WHERE transaction_id = $1")
            .bind(transaction_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn get_transaction_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<CreditTransaction>> {
        let row = sqlx::query(
            "SELECT * FROM credit_transactions WHERE message_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(message_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn transition_transaction(
        &self,
        transaction_id: &TransactionId,
        expected: TransactionStatus,
        transition: &Transition,
    ) -> Result<Option<CreditTransaction>> {
        transition_with(&self.pool, transaction_id, expected, transition).await
    }

    async fn find_pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM credit_transactions
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn list_user_transactions(
        &self,
        user_id: &UserId,
        status: Option<TransactionStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<TransactionPage> {
        let status = status.map(|s| s.as_str());
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let total: i64 = sqlx::query(
            r"
            SELECT COUNT(*) AS total FROM credit_transactions
            WHERE user_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(user_id.as_uuid())
        .bind(status)
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let rows = sqlx::query(
            r"
            SELECT * FROM credit_transactions
            WHERE user_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, transaction_id DESC
            LIMIT $3 OFFSET $4",
        )
        .bind(user_id.as_uuid())
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(TransactionPage {
            transactions: rows
                .iter()
                .map(transaction_from_row)
                .collect::<Result<_>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl BalanceStore for PgStore {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        let result = sqlx::query(
            r"
            INSERT INTO users (
                user_id, credits, total_tokens_used, total_credits_spent, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(account.user_id.as_uuid())
        .bind(account.credits)
        .bind(account.total_tokens_used)
        .bind(account.total_credits_spent)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "account {} already exists",
                account.user_id
            )));
        }
        Ok(())
    }

    async fn get_account(&self, user_id: &UserId) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn increment_balance(
        &self,
        user_id: &UserId,
        delta: &BalanceDelta,
    ) -> Result<Option<Account>> {
        increment_with(&self.pool, user_id, delta).await
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn get_by_transaction_id(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(
            r"
            SELECT message_id, transaction_id, chat_id, metadata, created_at
            FROM chat_messages
            WHERE transaction_id = $1
            ORDER BY created_at DESC
            LIMIT 1",
        )
        .bind(transaction_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn settle_atomically(&self, settlement: &Settlement) -> Result<SettleOutcome> {
        let mut tx = self.begin().await?;

        let Some(transaction) = transition_with(
            &mut *tx,
            &settlement.transaction_id,
            TransactionStatus::Pending,
            &Transition::Complete(settlement.completion.clone()),
        )
        .await?
        else {
            tx.rollback().await?;
            return Ok(SettleOutcome::NotPending);
        };

        let Some(account) = increment_with(&mut *tx, &settlement.user_id, &settlement.delta).await?
        else {
            tx.rollback().await?;
            return Ok(SettleOutcome::AccountMissing);
        };

        tx.commit().await?;
        Ok(SettleOutcome::Settled {
            transaction,
            account,
        })
    }
}
