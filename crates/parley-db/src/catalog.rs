//! Catalog store: the central database owning users, the shard registry,
//! and the global-transaction ledger.
//!
//! Every operation distinguishes a domain miss (`Ok(None)` / `Ok(false)`)
//! from a retryable database failure (`Err`); the transfer orchestrator
//! relies on that split to decide between abort and retry.

use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::{LedgerEntry, ShardId, ShardInfo, TxStatus, User, UserId};

use crate::schema;
use crate::DbTunables;

/// Single-connection catalog wrapper.
///
/// Uses `Mutex` because `rusqlite::Connection` is `Send` but not `Sync`,
/// and the catalog session is shared across concurrent transfers. WAL mode
/// is set so independent sessions (tests, tooling) can read concurrently.
pub struct CatalogDb {
    conn: Mutex<Connection>,
}

impl CatalogDb {
    pub fn open(conninfo: &str, tunables: &DbTunables) -> Result<Self> {
        let conn = Connection::open(conninfo)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(tunables.busy_timeout)?;
        schema::provision_catalog(&conn)?;
        info!("catalog opened at {}", conninfo);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("catalog lock poisoned: {}", e))?;
        f(&conn)
    }

    // -- Users --

    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        debug!("get_user: {}", username);
        self.with_conn(|conn| {
            let user = conn
                .query_row(
                    "SELECT id, username, shard_id, email, password_hash, created_at
                     FROM users WHERE username = ?1",
                    [username],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
    }

    /// Create a user pinned to `shard_id`. Returns the full row including
    /// the server-assigned id and created_at, or `None` if the username is
    /// already taken.
    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        email: Option<&str>,
        shard_id: ShardId,
    ) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let res = conn.query_row(
                "INSERT INTO users(username, shard_id, email, password_hash)
                 VALUES (?1, ?2, ?3, ?4)
                 RETURNING id, username, shard_id, email, password_hash, created_at",
                params![username, shard_id, email, password_hash],
                user_from_row,
            );
            match res {
                Ok(user) => {
                    info!("user created: id={}, username={}", user.id, user.username);
                    Ok(Some(user))
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    warn!("create_user: username taken: {}", username);
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    // -- Shard registry --

    pub fn get_shard_id(&self, user_id: UserId) -> Result<Option<ShardId>> {
        self.with_conn(|conn| {
            let shard_id = conn
                .query_row(
                    "SELECT shard_id FROM users WHERE id = ?1",
                    [user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(shard_id)
        })
    }

    pub fn get_shard_info(&self, shard_id: ShardId) -> Result<Option<ShardInfo>> {
        self.with_conn(|conn| {
            let shard = conn
                .query_row(
                    "SELECT id, name, conninfo, created_at FROM shards WHERE id = ?1",
                    [shard_id],
                    shard_from_row,
                )
                .optional()?;
            Ok(shard)
        })
    }

    /// Single-join convenience for the read path: username straight to its
    /// shard without a second round trip.
    pub fn get_shard_for_user(&self, username: &str) -> Result<Option<ShardInfo>> {
        self.with_conn(|conn| {
            let shard = conn
                .query_row(
                    "SELECT s.id, s.name, s.conninfo, s.created_at
                     FROM users u JOIN shards s ON s.id = u.shard_id
                     WHERE u.username = ?1",
                    [username],
                    shard_from_row,
                )
                .optional()?;
            Ok(shard)
        })
    }

    /// Upsert a shard registry row. Bootstrap-only; the routing layer never
    /// writes the registry.
    pub fn register_shard(&self, id: ShardId, name: &str, conninfo: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO shards(id, name, conninfo) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, conninfo = excluded.conninfo",
                params![id, name, conninfo],
            )?;
            Ok(())
        })?;
        info!("shard registered: id={}, name={}", id, name);
        Ok(())
    }

    pub fn shard_ids(&self) -> Result<Vec<ShardId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM shards ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    // -- Global-transaction ledger --

    /// Open a new ledger row in PENDING. The token is a random 128-bit UUID,
    /// collision-resistant under concurrent callers.
    pub fn start_transaction(&self) -> Result<String> {
        let tx_id = Uuid::new_v4().to_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO transactions(id, status) VALUES (?1, ?2)",
                params![tx_id, TxStatus::Pending.as_int()],
            )?;
            Ok(())
        })?;
        info!("transaction started: {}", tx_id);
        Ok(tx_id)
    }

    /// Mark a transaction CONFIRMED. Idempotent on an already-CONFIRMED row;
    /// returns `false` (surfaced, never swallowed) if the row is missing or
    /// already CANCELED — that signals an orchestrator bug or a racing
    /// recovery, not a retryable condition.
    pub fn commit_transaction(&self, tx_id: &str) -> Result<bool> {
        self.set_status(tx_id, TxStatus::Confirmed, TxStatus::Pending)
    }

    /// Mark a transaction CANCELED. Same conditional semantics as
    /// [`commit_transaction`](Self::commit_transaction), mirrored.
    pub fn cancel_transaction(&self, tx_id: &str) -> Result<bool> {
        self.set_status(tx_id, TxStatus::Canceled, TxStatus::Pending)
    }

    fn set_status(&self, tx_id: &str, target: TxStatus, from: TxStatus) -> Result<bool> {
        let updated = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE transactions SET status = ?1 WHERE id = ?2 AND status IN (?3, ?1)",
                params![target.as_int(), tx_id, from.as_int()],
            )?;
            Ok(n)
        })?;
        if updated == 0 {
            warn!("transaction {} not movable to {:?}", tx_id, target);
            Ok(false)
        } else {
            info!("transaction {}: {:?}", tx_id, target);
            Ok(true)
        }
    }

    pub fn get_transaction(&self, tx_id: &str) -> Result<Option<LedgerEntry>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, status, created_at FROM transactions WHERE id = ?1",
                    [tx_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row)
        })?;

        match row {
            Some((id, status, created_at)) => {
                let status = TxStatus::from_int(status)
                    .ok_or_else(|| anyhow::anyhow!("unknown transaction status {}", status))?;
                Ok(Some(LedgerEntry {
                    id,
                    status,
                    created_at,
                }))
            }
            None => Ok(None),
        }
    }
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        shard_id: row.get(2)?,
        email: row.get(3)?,
        password_hash: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn shard_from_row(row: &Row) -> rusqlite::Result<ShardInfo> {
    Ok(ShardInfo {
        id: row.get(0)?,
        name: row.get(1)?,
        conninfo: row.get(2)?,
        created_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_catalog() -> CatalogDb {
        CatalogDb::open(":memory:", &DbTunables::default()).unwrap()
    }

    #[test]
    fn create_then_get_user_round_trip() {
        let catalog = open_catalog();

        let created = catalog
            .create_user("alice", "hash", Some("a@example.com"), 1)
            .unwrap()
            .unwrap();
        assert!(created.id > 0);
        assert!(!created.created_at.is_empty());

        let fetched = catalog.get_user("alice").unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.username, "alice");
        assert_eq!(fetched.shard_id, 1);
        assert_eq!(fetched.email.as_deref(), Some("a@example.com"));
        assert_eq!(fetched.password_hash, "hash");

        assert!(catalog.get_user("nobody").unwrap().is_none());
    }

    #[test]
    fn duplicate_username_is_a_miss_not_an_error() {
        let catalog = open_catalog();
        assert!(catalog.create_user("alice", "h1", None, 1).unwrap().is_some());
        assert!(catalog.create_user("alice", "h2", None, 2).unwrap().is_none());
    }

    #[test]
    fn shard_registry_lookup_paths() {
        let catalog = open_catalog();
        catalog.register_shard(2, "shard2", "/tmp/shard2.db").unwrap();
        catalog.register_shard(1, "shard1", "/tmp/shard1.db").unwrap();

        let user = catalog.create_user("bob", "h", None, 2).unwrap().unwrap();

        assert_eq!(catalog.get_shard_id(user.id).unwrap(), Some(2));
        assert_eq!(catalog.get_shard_id(9999).unwrap(), None);

        let info = catalog.get_shard_info(2).unwrap().unwrap();
        assert_eq!(info.name, "shard2");
        assert_eq!(info.conninfo, "/tmp/shard2.db");
        assert!(catalog.get_shard_info(42).unwrap().is_none());

        let joined = catalog.get_shard_for_user("bob").unwrap().unwrap();
        assert_eq!(joined.id, 2);
        assert!(catalog.get_shard_for_user("nobody").unwrap().is_none());

        assert_eq!(catalog.shard_ids().unwrap(), vec![1, 2]);

        // Re-registering replaces the conninfo in place.
        catalog.register_shard(2, "shard2", "/tmp/other.db").unwrap();
        let info = catalog.get_shard_info(2).unwrap().unwrap();
        assert_eq!(info.conninfo, "/tmp/other.db");
    }

    #[test]
    fn ledger_status_is_monotone() {
        let catalog = open_catalog();

        let tx = catalog.start_transaction().unwrap();
        assert_eq!(
            catalog.get_transaction(&tx).unwrap().unwrap().status,
            TxStatus::Pending
        );

        assert!(catalog.commit_transaction(&tx).unwrap());
        // Re-applying the same terminal state succeeds.
        assert!(catalog.commit_transaction(&tx).unwrap());
        // Crossing terminal states fails and is surfaced.
        assert!(!catalog.cancel_transaction(&tx).unwrap());
        assert_eq!(
            catalog.get_transaction(&tx).unwrap().unwrap().status,
            TxStatus::Confirmed
        );

        let tx2 = catalog.start_transaction().unwrap();
        assert_ne!(tx, tx2);
        assert!(catalog.cancel_transaction(&tx2).unwrap());
        assert!(catalog.cancel_transaction(&tx2).unwrap());
        assert!(!catalog.commit_transaction(&tx2).unwrap());

        // Unknown token: surfaced as failure, not as success or panic.
        assert!(!catalog.commit_transaction("no-such-tx").unwrap());
        assert!(catalog.get_transaction("no-such-tx").unwrap().is_none());
    }
}
