//! Routing layer: user → home shard → open session.
//!
//! The router owns the catalog handle exclusively; orchestrators borrow it
//! via [`account_db`](DbRouter::account_db) for the duration of a call and
//! must not retain it. Shard sessions are opened fresh per routed request —
//! there is deliberately no user→shard cache, so a routing decision always
//! reflects the registry.

use anyhow::Result;
use tracing::warn;

use parley_types::{User, UserId};

use crate::catalog::CatalogDb;
use crate::shard::ShardDb;
use crate::DbTunables;

pub struct DbRouter {
    account: CatalogDb,
    tunables: DbTunables,
}

impl DbRouter {
    pub fn open(account_conninfo: &str, tunables: DbTunables) -> Result<Self> {
        let account = CatalogDb::open(account_conninfo, &tunables)?;
        Ok(Self { account, tunables })
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        self.account.get_user(username)
    }

    /// Resolve a user's home shard and open a session against it. A lookup
    /// miss (unknown user, unregistered shard) is `Ok(None)` and logged; the
    /// caller must treat it as a fatal precondition. A session that cannot
    /// be opened is an `Err`.
    pub fn shard_for_user(&self, user_id: UserId) -> Result<Option<ShardDb>> {
        let Some(shard_id) = self.account.get_shard_id(user_id)? else {
            warn!("no shard pinned for user {}", user_id);
            return Ok(None);
        };
        let Some(info) = self.account.get_shard_info(shard_id)? else {
            warn!("shard {} not registered (user {})", shard_id, user_id);
            return Ok(None);
        };
        let shard = ShardDb::open(&info.conninfo, &self.tunables)?;
        Ok(Some(shard))
    }

    /// Borrow the owning catalog handle so orchestrators can drive the
    /// ledger through the same routing layer.
    pub fn account_db(&self) -> &CatalogDb {
        &self.account
    }

    pub fn tunables(&self) -> &DbTunables {
        &self.tunables
    }
}
