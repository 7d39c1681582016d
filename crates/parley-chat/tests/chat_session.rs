//! End-to-end chat test over a real loopback socket: register, chat,
//! history, transfer, presence. Uses temp-file catalog and shard databases.

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use parley_chat::{serve, Room};
use parley_db::{DbFacade, DbTunables, ShardDb, TransferSide};
use parley_types::UserId;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct Server {
    addr: SocketAddr,
    facade: Arc<DbFacade>,
    shard1: String,
    shard2: String,
}

async fn start_server(name: &str) -> Server {
    let dir = std::env::temp_dir().join(format!("parley_chat_{}", name));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    let path = |f: &str| -> String { dir.join(f).to_str().unwrap().to_string() };

    let shard1 = path("shard1.db");
    let shard2 = path("shard2.db");
    let facade = Arc::new(DbFacade::open(&path("catalog.db"), DbTunables::default()).unwrap());
    facade.register_shard(1, "shard1", &shard1).unwrap();
    facade.register_shard(2, "shard2", &shard2).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, facade.clone(), Room::new()));

    Server {
        addr,
        facade,
        shard1,
        shard2,
    }
}

impl Server {
    fn shard_path(&self, shard_id: i64) -> &str {
        match shard_id {
            1 => &self.shard1,
            2 => &self.shard2,
            other => panic!("unexpected shard id {}", other),
        }
    }

    fn shard_for(&self, username: &str) -> (ShardDb, UserId) {
        let user = self.facade.find_user(username).unwrap().unwrap();
        let shard = ShardDb::open(self.shard_path(user.shard_id), &DbTunables::default()).unwrap();
        (shard, user.id)
    }

    /// Seed a wallet through the TCC primitives.
    fn fund(&self, username: &str, amount: i64) {
        let (shard, user_id) = self.shard_for(username);
        assert!(shard
            .prepare_transfer(user_id, amount, TransferSide::Credit, "seed")
            .unwrap());
        shard
            .commit_transfer(user_id, amount, TransferSide::Credit, "seed")
            .unwrap();
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Read lines (skipping unrelated broadcasts) until one contains
    /// `needle`; panics if the server goes quiet first.
    async fn expect(&mut self, needle: &str) -> String {
        loop {
            let line = tokio::time::timeout(READ_TIMEOUT, self.lines.next_line())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?}", needle))
                .unwrap()
                .unwrap_or_else(|| panic!("connection closed waiting for {:?}", needle));
            if line.contains(needle) {
                return line;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn register_chat_history_and_transfer() {
    let server = start_server("full_session").await;

    let mut alice = Client::connect(server.addr).await;
    alice.expect("Welcome to the chat!").await;
    alice.send("REGISTER alice password123").await;
    alice.expect("OK logged in as alice").await;

    let mut bob = Client::connect(server.addr).await;
    bob.expect("Welcome to the chat!").await;
    bob.send("REGISTER bob password123").await;
    bob.expect("OK logged in as bob").await;

    // A chat line is persisted, then broadcast to every session.
    alice.send("hello everyone").await;
    alice.expect("alice: hello everyone").await;
    bob.expect("alice: hello everyone").await;

    // History replays the room from the author's shard, oldest first.
    alice.send("and another thing").await;
    alice.expect("alice: and another thing").await;
    alice.send("/history").await;
    alice.expect("2 message(s) in room 1").await;
    alice.expect("hello everyone").await;
    alice.expect("and another thing").await;

    // Presence.
    alice.send("/who").await;
    let who = alice.expect("online:").await;
    assert!(who.contains("alice") && who.contains("bob"));

    // Transfer: fund alice out-of-band, then move money over the wire.
    server.fund("alice", 100);
    alice.send("/transfer bob 30").await;
    alice.expect("OK transfer complete").await;

    let (shard, alice_id) = server.shard_for("alice");
    let wallet = shard.get_wallet(alice_id).unwrap().unwrap();
    assert_eq!((wallet.money, wallet.held_money), (70, 0));
    let (shard, bob_id) = server.shard_for("bob");
    let wallet = shard.get_wallet(bob_id).unwrap().unwrap();
    assert_eq!((wallet.money, wallet.held_money), (30, 0));

    // Overdraw is refused and nothing moves.
    alice.send("/transfer bob 500").await;
    alice.expect("ERR insufficient funds").await;
    let (shard, alice_id) = server.shard_for("alice");
    assert_eq!(shard.get_wallet(alice_id).unwrap().unwrap().money, 70);

    // Unknown receiver.
    alice.send("/transfer ghost 5").await;
    alice.expect("ERR no such user").await;

    // Clean exit is announced to the others.
    bob.send("/quit").await;
    bob.expect("OK bye").await;
    alice.expect("* bob left the chat").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_rules_are_enforced() {
    let server = start_server("auth_rules").await;

    let mut c = Client::connect(server.addr).await;
    c.expect("Welcome to the chat!").await;

    // Must authenticate before chatting.
    c.send("hello?").await;
    c.expect("ERR authenticate first").await;

    // Username and password validation.
    c.send("REGISTER ab password123").await;
    c.expect("ERR usernames are").await;
    c.send("REGISTER carol short").await;
    c.expect("ERR passwords are").await;

    c.send("REGISTER carol password123").await;
    c.expect("OK logged in as carol").await;

    // Duplicate registration is refused; login with the right password works.
    let mut c2 = Client::connect(server.addr).await;
    c2.expect("Welcome to the chat!").await;
    c2.send("REGISTER carol password123").await;
    c2.expect("ERR username taken").await;
    c2.send("LOGIN carol wrong-password").await;
    c2.expect("ERR invalid credentials").await;
    c2.send("LOGIN carol password123").await;
    c2.expect("OK logged in as carol").await;
}
