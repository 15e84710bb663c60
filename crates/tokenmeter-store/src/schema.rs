//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Account balances, keyed by `user_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Credit transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Index: completed transactions by message, keyed by `message_id`.
    /// Value is the transaction ID bytes.
    pub const TRANSACTIONS_BY_MESSAGE: &str = "transactions_by_message";

    /// Index: transactions still pending, keyed by `transaction_id`.
    /// Value is empty. Entries are removed on resolution.
    pub const PENDING_TRANSACTIONS: &str = "pending_transactions";

    /// Chat messages, keyed by the `transaction_id` they were billed under.
    pub const MESSAGES: &str = "messages";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::TRANSACTIONS_BY_MESSAGE,
        cf::PENDING_TRANSACTIONS,
        cf::MESSAGES,
    ]
}
