//! Shard store: one per-partition database holding wallet and message rows
//! for the users assigned to it.
//!
//! A `ShardDb` is a single session scoped to one routed request; it is never
//! shared between tasks, so the connection needs no lock. The wallet
//! primitives are the Try/Confirm/Cancel legs the orchestrator drives; each
//! is a single SQLite statement, so intra-shard atomicity comes from the
//! database itself rather than an explicit transaction block.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use parley_types::{Amount, Message, RoomId, UserId, Wallet};

use crate::schema;
use crate::DbTunables;

/// Which half of a transfer a wallet primitive operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSide {
    /// The sender half: value is reserved out of `money` into `held_money`.
    Deduct,
    /// The receiver half: nothing is reserved; commit credits `money`.
    Credit,
}

pub struct ShardDb {
    conn: Connection,
}

impl ShardDb {
    pub fn open(conninfo: &str, tunables: &DbTunables) -> Result<Self> {
        let conn = Connection::open(conninfo)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(tunables.busy_timeout)?;
        schema::provision_shard(&conn)?;
        Ok(Self { conn })
    }

    // -- Messaging --

    pub fn insert_message(&self, room_id: RoomId, user_id: UserId, content: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO messages(room_id, user_id, content) VALUES (?1, ?2, ?3)",
            params![room_id, user_id, content],
        )?;
        Ok(())
    }

    /// All messages in a room on this shard, ordered by id ascending.
    pub fn get_messages(&self, room_id: RoomId) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, room_id, user_id, content, created_at
             FROM messages WHERE room_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([room_id], |row| {
                Ok(Message {
                    id: row.get(0)?,
                    room_id: row.get(1)?,
                    user_id: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- Wallet TCC primitives --

    pub fn get_wallet(&self, user_id: UserId) -> Result<Option<Wallet>> {
        let wallet = self
            .conn
            .query_row(
                "SELECT user_id, money, held_money FROM wallets WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(Wallet {
                        user_id: row.get(0)?,
                        money: row.get(1)?,
                        held_money: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(wallet)
    }

    /// Try leg. Deduct: atomically move `amount` from `money` to
    /// `held_money`, guarded by the balance check inside the UPDATE itself —
    /// zero affected rows (missing wallet or insufficient funds) is the
    /// failure signal. Credit: ensure a wallet row exists; balances are
    /// never touched.
    ///
    /// Not idempotent on the Deduct side: a second prepare of the same
    /// transfer would double-reserve. The orchestrator never retries a
    /// prepare without an intervening rollback.
    pub fn prepare_transfer(
        &self,
        user_id: UserId,
        amount: Amount,
        side: TransferSide,
        tx_id: &str,
    ) -> Result<bool> {
        match side {
            TransferSide::Deduct => {
                let n = self.conn.execute(
                    "UPDATE wallets SET money = money - ?1, held_money = held_money + ?1
                     WHERE user_id = ?2 AND money >= ?1",
                    params![amount, user_id],
                )?;
                if n == 0 {
                    warn!(
                        "prepare: insufficient funds or no wallet, user_id={}, amount={}, tx={}",
                        user_id, amount, tx_id
                    );
                    return Ok(false);
                }
            }
            TransferSide::Credit => {
                self.conn.execute(
                    "INSERT OR IGNORE INTO wallets(user_id, money, held_money) VALUES (?1, 0, 0)",
                    [user_id],
                )?;
            }
        }
        debug!(
            "prepare ok: user_id={}, amount={}, side={:?}, tx={}",
            user_id, amount, side, tx_id
        );
        Ok(true)
    }

    /// Confirm leg. Deduct: discharge the hold (the value already left the
    /// liquid balance at prepare). Credit: the money arrives.
    pub fn commit_transfer(
        &self,
        user_id: UserId,
        amount: Amount,
        side: TransferSide,
        tx_id: &str,
    ) -> Result<()> {
        let n = match side {
            TransferSide::Deduct => self.conn.execute(
                "UPDATE wallets SET held_money = held_money - ?1 WHERE user_id = ?2",
                params![amount, user_id],
            )?,
            TransferSide::Credit => self.conn.execute(
                "UPDATE wallets SET money = money + ?1 WHERE user_id = ?2",
                params![amount, user_id],
            )?,
        };
        if n == 0 {
            // Commit against a missing wallet row: nothing was applied.
            warn!(
                "commit touched no wallet row: user_id={}, side={:?}, tx={}",
                user_id, side, tx_id
            );
        }
        debug!(
            "commit ok: user_id={}, amount={}, side={:?}, tx={}",
            user_id, amount, side, tx_id
        );
        Ok(())
    }

    /// Cancel leg. Deduct: restore the reservation so the wallet reads as if
    /// the transfer never happened. Credit: no-op, nothing was reserved.
    pub fn rollback_transfer(
        &self,
        user_id: UserId,
        amount: Amount,
        side: TransferSide,
        tx_id: &str,
    ) -> Result<()> {
        match side {
            TransferSide::Deduct => {
                self.conn.execute(
                    "UPDATE wallets SET money = money + ?1, held_money = held_money - ?1
                     WHERE user_id = ?2",
                    params![amount, user_id],
                )?;
            }
            TransferSide::Credit => {}
        }
        debug!(
            "rollback ok: user_id={}, amount={}, side={:?}, tx={}",
            user_id, amount, side, tx_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_shard() -> ShardDb {
        ShardDb::open(":memory:", &DbTunables::default()).unwrap()
    }

    /// Seed a wallet through the public primitives: ensure the row, then
    /// credit it as a committed inbound transfer would.
    fn fund(shard: &ShardDb, user_id: UserId, amount: Amount) {
        assert!(shard
            .prepare_transfer(user_id, amount, TransferSide::Credit, "seed")
            .unwrap());
        shard
            .commit_transfer(user_id, amount, TransferSide::Credit, "seed")
            .unwrap();
    }

    #[test]
    fn messages_are_ordered_by_id() {
        let shard = open_shard();
        shard.insert_message(42, 7, "first").unwrap();
        shard.insert_message(42, 8, "second").unwrap();
        shard.insert_message(43, 7, "other room").unwrap();

        let msgs = shard.get_messages(42).unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].id < msgs[1].id);
        assert_eq!(msgs[0].content, "first");
        assert_eq!(msgs[1].content, "second");
        assert_eq!(msgs[1].user_id, 8);
        assert!(!msgs[0].created_at.is_empty());

        assert!(shard.get_messages(99).unwrap().is_empty());
    }

    #[test]
    fn deduct_prepare_reserves_and_commit_discharges() {
        let shard = open_shard();
        fund(&shard, 1, 100);

        assert!(shard.prepare_transfer(1, 30, TransferSide::Deduct, "t1").unwrap());
        assert_eq!(
            shard.get_wallet(1).unwrap().unwrap(),
            Wallet { user_id: 1, money: 70, held_money: 30 }
        );

        shard.commit_transfer(1, 30, TransferSide::Deduct, "t1").unwrap();
        assert_eq!(
            shard.get_wallet(1).unwrap().unwrap(),
            Wallet { user_id: 1, money: 70, held_money: 0 }
        );
    }

    #[test]
    fn deduct_rollback_restores_the_exact_tuple() {
        let shard = open_shard();
        fund(&shard, 1, 100);

        assert!(shard.prepare_transfer(1, 40, TransferSide::Deduct, "t1").unwrap());
        shard.rollback_transfer(1, 40, TransferSide::Deduct, "t1").unwrap();
        assert_eq!(
            shard.get_wallet(1).unwrap().unwrap(),
            Wallet { user_id: 1, money: 100, held_money: 0 }
        );
    }

    #[test]
    fn deduct_prepare_fails_without_funds_or_row() {
        let shard = open_shard();

        // No wallet row at all.
        assert!(!shard.prepare_transfer(1, 10, TransferSide::Deduct, "t1").unwrap());

        // Row present but balance short: nothing moves.
        fund(&shard, 1, 10);
        assert!(!shard.prepare_transfer(1, 30, TransferSide::Deduct, "t2").unwrap());
        assert_eq!(
            shard.get_wallet(1).unwrap().unwrap(),
            Wallet { user_id: 1, money: 10, held_money: 0 }
        );
    }

    #[test]
    fn credit_prepare_creates_row_without_touching_balances() {
        let shard = open_shard();

        assert!(shard.get_wallet(2).unwrap().is_none());
        assert!(shard.prepare_transfer(2, 30, TransferSide::Credit, "t1").unwrap());
        assert_eq!(
            shard.get_wallet(2).unwrap().unwrap(),
            Wallet { user_id: 2, money: 0, held_money: 0 }
        );

        // Re-preparing an existing wallet is harmless.
        fund(&shard, 2, 50);
        assert!(shard.prepare_transfer(2, 30, TransferSide::Credit, "t2").unwrap());
        assert_eq!(shard.get_wallet(2).unwrap().unwrap().money, 50);

        shard.commit_transfer(2, 30, TransferSide::Credit, "t2").unwrap();
        assert_eq!(shard.get_wallet(2).unwrap().unwrap().money, 80);

        // Credit rollback is a no-op.
        shard.rollback_transfer(2, 30, TransferSide::Credit, "t2").unwrap();
        assert_eq!(shard.get_wallet(2).unwrap().unwrap().money, 80);
    }
}
