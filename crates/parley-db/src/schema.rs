//! Schema provisioning for catalog and shard databases.
//!
//! This is deliberately not a migration framework: the DDL is idempotent
//! (`IF NOT EXISTS` everywhere) and runs at session open. Beyond that the
//! schema is assumed pre-provisioned.

use anyhow::Result;
use rusqlite::Connection;

/// Tables owned by the central catalog: users, the shard registry, and the
/// global-transaction ledger.
pub fn provision_catalog(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            username      TEXT NOT NULL UNIQUE,
            shard_id      INTEGER NOT NULL,
            email         TEXT,
            password_hash TEXT NOT NULL,
            created_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS shards (
            id          INTEGER PRIMARY KEY,
            name        TEXT NOT NULL,
            conninfo    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id          TEXT PRIMARY KEY,
            status      INTEGER NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

/// Tables owned by each shard: wallets and messages. The CHECK constraints
/// back the wallet invariants at the storage layer.
pub fn provision_shard(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS wallets (
            user_id     INTEGER PRIMARY KEY,
            money       INTEGER NOT NULL DEFAULT 0 CHECK (money >= 0),
            held_money  INTEGER NOT NULL DEFAULT 0 CHECK (held_money >= 0)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id     INTEGER NOT NULL,
            user_id     INTEGER NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, id);
        ",
    )?;
    Ok(())
}
