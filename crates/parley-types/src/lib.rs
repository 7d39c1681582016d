pub mod models;

pub use models::{
    Amount, LedgerEntry, Message, RoomId, ShardId, ShardInfo, TxStatus, User, UserId, Wallet,
};
