/// Shared row types — these map directly to catalog and shard SQLite rows.
/// Kept in their own crate so the store, chat, and server crates agree on
/// one set of shapes without depending on each other.

use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ShardId = i64;
pub type RoomId = i64;
pub type MessageId = i64;
pub type Amount = i64;

/// A registered user on the catalog. `shard_id` pins the user to a wallet
/// and message shard for life; rows are immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub shard_id: ShardId,
    pub email: Option<String>,
    pub password_hash: String,
    pub created_at: String,
}

/// One entry in the catalog's shard registry. `conninfo` is opaque to the
/// catalog — the router hands it to the shard store to open a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    pub name: String,
    pub conninfo: String,
    pub created_at: String,
}

/// Wallet balances on a shard. A row exists once the user has participated
/// in at least one transfer on that shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub money: Amount,
    pub held_money: Amount,
}

/// A chat message on a shard. Append-only, ordered within a room by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: String,
}

/// Status of a global transfer in the catalog ledger. Transitions are
/// monotone: PENDING moves to exactly one of CONFIRMED or CANCELED and
/// terminal states are never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Canceled,
}

impl TxStatus {
    pub fn as_int(self) -> i64 {
        match self {
            TxStatus::Pending => 0,
            TxStatus::Confirmed => 1,
            TxStatus::Canceled => 2,
        }
    }

    pub fn from_int(v: i64) -> Option<Self> {
        match v {
            0 => Some(TxStatus::Pending),
            1 => Some(TxStatus::Confirmed),
            2 => Some(TxStatus::Canceled),
            _ => None,
        }
    }
}

/// One row of the global-transaction ledger — the single source of truth
/// for whether a cross-shard transfer eventually succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub status: TxStatus,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_status_int_round_trip() {
        for status in [TxStatus::Pending, TxStatus::Confirmed, TxStatus::Canceled] {
            assert_eq!(TxStatus::from_int(status.as_int()), Some(status));
        }
        assert_eq!(TxStatus::from_int(7), None);
    }
}
