//! Front door for everything the chat layer needs from persistence: user
//! lookup/creation, the message write/read path, and the cross-shard
//! transfer entry point. Thin by design — each call resolves the right
//! store through the router and delegates.

use anyhow::Result;
use tracing::warn;

use parley_types::{Amount, Message, RoomId, ShardId, User, UserId};

use crate::router::DbRouter;
use crate::transfer::{self, TransferOutcome};
use crate::DbTunables;

pub struct DbFacade {
    router: DbRouter,
}

impl DbFacade {
    pub fn open(account_conninfo: &str, tunables: DbTunables) -> Result<Self> {
        Ok(Self {
            router: DbRouter::open(account_conninfo, tunables)?,
        })
    }

    pub fn find_user(&self, username: &str) -> Result<Option<User>> {
        self.router.get_user(username)
    }

    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        email: Option<&str>,
        shard_id: ShardId,
    ) -> Result<Option<User>> {
        self.router
            .account_db()
            .create_user(username, password_hash, email, shard_id)
    }

    /// Bootstrap passthrough: upsert a shard registry row.
    pub fn register_shard(&self, id: ShardId, name: &str, conninfo: &str) -> Result<()> {
        self.router.account_db().register_shard(id, name, conninfo)
    }

    /// Registered shard ids, ascending. The chat layer picks a home shard
    /// from this list when registering users.
    pub fn shard_ids(&self) -> Result<Vec<ShardId>> {
        self.router.account_db().shard_ids()
    }

    /// Persist a message on the author's shard. `false` covers both a
    /// routing miss and a shard write failure.
    pub fn save_message(&self, user_id: UserId, room_id: RoomId, content: &str) -> bool {
        let shard = match self.router.shard_for_user(user_id) {
            Ok(Some(shard)) => shard,
            Ok(None) => return false,
            Err(e) => {
                warn!("save_message: shard session failed for user {}: {:#}", user_id, e);
                return false;
            }
        };
        match shard.insert_message(room_id, user_id, content) {
            Ok(()) => true,
            Err(e) => {
                warn!("save_message: insert failed for user {}: {:#}", user_id, e);
                false
            }
        }
    }

    /// Read a room's messages from the author's shard, ascending by id.
    /// Empty if the shard is unreachable.
    pub fn load_messages(&self, user_id: UserId, room_id: RoomId) -> Vec<Message> {
        let shard = match self.router.shard_for_user(user_id) {
            Ok(Some(shard)) => shard,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("load_messages: shard session failed for user {}: {:#}", user_id, e);
                return Vec::new();
            }
        };
        match shard.get_messages(room_id) {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!("load_messages: read failed for user {}: {:#}", user_id, e);
                Vec::new()
            }
        }
    }

    /// Move `amount` between two users whose wallets may live on different
    /// shards. See [`transfer::transfer_money`] for the protocol.
    pub fn transfer_money(
        &self,
        from_username: &str,
        to_username: &str,
        amount: Amount,
    ) -> TransferOutcome {
        transfer::transfer_money(&self.router, from_username, to_username, amount)
    }
}
