use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use parley_types::UserId;

/// Capacity of the shared broadcast channel. A session that falls further
/// behind than this drops old lines (and logs it) rather than stalling the
/// whole room.
const ROOM_CHANNEL_CAPACITY: usize = 1024;

/// The single broadcast hub all sessions share: every delivered line reaches
/// every connected session, and the hub tracks who is online.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    tx: broadcast::Sender<String>,
    online: RwLock<HashMap<UserId, String>>,
}

impl Room {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RoomInner {
                tx,
                online: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.tx.subscribe()
    }

    /// Deliver a line to every connected session. Send errors (no
    /// subscribers) are ignored.
    pub fn deliver(&self, line: String) {
        let _ = self.inner.tx.send(line);
    }

    pub async fn join(&self, user_id: UserId, username: String) {
        self.inner
            .online
            .write()
            .await
            .insert(user_id, username.clone());
        self.deliver(format!("* {} joined the chat", username));
    }

    pub async fn leave(&self, user_id: UserId) {
        let username = self.inner.online.write().await.remove(&user_id);
        if let Some(username) = username {
            self.deliver(format!("* {} left the chat", username));
        }
    }

    pub async fn online_users(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.online.read().await.values().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let room = Room::new();
        let mut rx1 = room.subscribe();
        let mut rx2 = room.subscribe();

        room.deliver("hello".into());
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn join_and_leave_track_presence() {
        let room = Room::new();
        let mut rx = room.subscribe();

        room.join(1, "alice".into()).await;
        room.join(2, "bob".into()).await;
        assert_eq!(room.online_users().await, vec!["alice", "bob"]);
        assert_eq!(rx.recv().await.unwrap(), "* alice joined the chat");

        room.leave(1).await;
        assert_eq!(room.online_users().await, vec!["bob"]);

        // Leaving twice announces nothing the second time.
        room.leave(1).await;
        assert_eq!(rx.recv().await.unwrap(), "* bob joined the chat");
        assert_eq!(rx.recv().await.unwrap(), "* alice left the chat");
        assert!(rx.try_recv().is_err());
    }
}
