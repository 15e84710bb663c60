//! `RocksDB` key layout.
//!
//! All identifiers are 16 raw bytes. Composite keys concatenate them.

use tokenmeter_core::{MessageId, TransactionId, UserId};

/// Key of a user's account.
#[must_use]
pub fn account_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Key of a transaction record, its pending-index entry and its message.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Key of the message-to-transaction index.
#[must_use]
pub fn message_key(message_id: &MessageId) -> Vec<u8> {
    message_id.as_bytes().to_vec()
}

/// Key of the user index: `user_id || transaction_id`.
///
/// A prefix scan over one user yields their transactions oldest first.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    [user_id.as_bytes().as_slice(), transaction_id.to_bytes().as_slice()].concat()
}

/// Prefix shared by every user-index key of `user_id`.
#[must_use]
pub fn user_transactions_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Decode a transaction ID from its 16 key bytes.
///
/// Returns `None` if `bytes` is not exactly 16 bytes long.
#[must_use]
pub fn decode_transaction_id(bytes: &[u8]) -> Option<TransactionId> {
    let bytes: [u8; 16] = bytes.try_into().ok()?;
    Some(TransactionId::from_bytes(bytes))
}

/// Extract the transaction ID from a user-transaction index key.
///
/// Returns `None` if the key is not 32 bytes long.
#[must_use]
pub fn extract_transaction_id_from_user_key(key: &[u8]) -> Option<TransactionId> {
    if key.len() != 32 {
        return None;
    }
    decode_transaction_id(&key[16..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_transaction_key_format() {
        let user_id = UserId::generate();
        let tx_id = TransactionId::generate();
        let key = user_transaction_key(&user_id, &tx_id);

        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], user_id.as_bytes());
        assert_eq!(&key[16..], tx_id.to_bytes());
        assert!(key.starts_with(&user_transactions_prefix(&user_id)));
    }

    #[test]
    fn extract_transaction_id_from_index_key() {
        let user_id = UserId::generate();
        let tx_id = TransactionId::generate();
        let key = user_transaction_key(&user_id, &tx_id);

        assert_eq!(extract_transaction_id_from_user_key(&key), Some(tx_id));
    }

    #[test]
    fn malformed_keys_decode_to_none() {
        assert!(extract_transaction_id_from_user_key(&[0u8; 16]).is_none());
        assert!(decode_transaction_id(&[1, 2, 3]).is_none());
    }
}
