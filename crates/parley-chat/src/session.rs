//! Per-connection session: greeting, auth handshake, then the chat loop.
//!
//! The wire protocol is plain text, one message per line:
//!
//!   REGISTER <username> <password>   create an account and join
//!   LOGIN <username> <password>      join an existing account
//!   /join <room_id>                  switch the room messages persist to
//!   /history                         replay the current room from the
//!                                    author's shard
//!   /transfer <username> <amount>    move money to another user
//!   /who                             list online users
//!   /quit                            disconnect
//!   anything else                    a chat line: persisted, then broadcast
//!
//! Clients must authenticate within [`LOGIN_TIMEOUT`] of connecting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use parley_db::{DbFacade, TransferOutcome};
use parley_types::{Amount, RoomId, ShardId, User};

use crate::room::Room;

/// How long a client gets to authenticate after connecting.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Room new sessions persist to until they `/join` another.
const DEFAULT_ROOM: RoomId = 1;

const MAX_USERNAME_LEN: usize = 32;
const MIN_PASSWORD_LEN: usize = 8;
/// Caps Argon2 work on hostile inputs.
const MAX_PASSWORD_LEN: usize = 128;

/// Accept connections forever, one spawned task per client.
pub async fn serve(listener: TcpListener, facade: Arc<DbFacade>, room: Room) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("chat: new connection from {}", addr);
                let facade = facade.clone();
                let room = room.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, facade, room).await {
                        warn!("chat session error: {:#}", e);
                    }
                });
            }
            Err(e) => {
                error!("chat accept error: {}", e);
            }
        }
    }
}

pub async fn handle_connection(
    stream: TcpStream,
    facade: Arc<DbFacade>,
    room: Room,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    send(&mut writer, "Welcome to the chat!").await?;
    send(&mut writer, "* REGISTER <username> <password> | LOGIN <username> <password>").await?;

    let user = match tokio::time::timeout(
        LOGIN_TIMEOUT,
        authenticate(&mut lines, &mut writer, &facade),
    )
    .await
    {
        Ok(Ok(Some(user))) => user,
        Ok(Ok(None)) => return Ok(()), // client went away before authenticating
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            warn!("chat: {} failed to authenticate in time", peer);
            let _ = send(&mut writer, "ERR login timeout").await;
            return Ok(());
        }
    };

    info!("chat: {} ({}) joined from {}", user.username, user.id, peer);

    // Subscribe before going online so we see our own join notice.
    let mut events = room.subscribe();
    room.join(user.id, user.username.clone()).await;

    let result = chat_loop(&mut lines, &mut writer, &mut events, &user, &facade, &room).await;

    room.leave(user.id).await;
    info!("chat: {} ({}) disconnected", user.username, user.id);
    result
}

async fn chat_loop(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    events: &mut broadcast::Receiver<String>,
    user: &User,
    facade: &Arc<DbFacade>,
    room: &Room,
) -> Result<()> {
    let mut current_room = DEFAULT_ROOM;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return Ok(()),   // EOF
                    Err(e) => return Err(e.into()),
                };

                match parse_command(&line) {
                    Command::Chat(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        let db = facade.clone();
                        let (user_id, room_id, body) = (user.id, current_room, text.clone());
                        let saved = tokio::task::spawn_blocking(move || {
                            db.save_message(user_id, room_id, &body)
                        })
                        .await?;
                        if saved {
                            room.deliver(format!(
                                "[{}] {}: {}",
                                Utc::now().format("%H:%M:%S"),
                                user.username,
                                text
                            ));
                        } else {
                            send(writer, "ERR message not saved").await?;
                        }
                    }
                    Command::Join(room_id) => {
                        current_room = room_id;
                        send(writer, &format!("OK room {}", room_id)).await?;
                    }
                    Command::History => {
                        let db = facade.clone();
                        let (user_id, room_id) = (user.id, current_room);
                        let msgs = tokio::task::spawn_blocking(move || {
                            db.load_messages(user_id, room_id)
                        })
                        .await?;
                        send(writer, &format!("* {} message(s) in room {}", msgs.len(), room_id)).await?;
                        for m in msgs {
                            send(writer, &format!("* [{}] user {}: {}", m.created_at, m.user_id, m.content)).await?;
                        }
                    }
                    Command::Transfer { to, amount } => {
                        let db = facade.clone();
                        let from = user.username.clone();
                        let outcome = tokio::task::spawn_blocking(move || {
                            db.transfer_money(&from, &to, amount)
                        })
                        .await?;
                        send(writer, &transfer_reply(&outcome)).await?;
                    }
                    Command::Who => {
                        let names = room.online_users().await;
                        send(writer, &format!("* online: {}", names.join(", "))).await?;
                    }
                    Command::Quit => {
                        send(writer, "OK bye").await?;
                        return Ok(());
                    }
                    Command::Unknown(cmd) => {
                        send(writer, &format!("ERR unknown command {}", cmd)).await?;
                    }
                    Command::Malformed(usage) => {
                        send(writer, &format!("ERR {}", usage)).await?;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(text) => send(writer, &text).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("chat: {} lagged by {} lines", user.username, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

// -- Auth handshake --

enum AuthReply {
    Accepted(User),
    Denied(&'static str),
}

/// Read lines until the client registers or logs in. `Ok(None)` means the
/// client disconnected first. Hashing and DB work run off the reactor.
async fn authenticate(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    facade: &Arc<DbFacade>,
) -> Result<Option<User>> {
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let reply = match (parts.next(), parts.next(), parts.next()) {
            (Some("REGISTER"), Some(username), Some(password)) => {
                register(facade, username.to_string(), password.to_string()).await?
            }
            (Some("LOGIN"), Some(username), Some(password)) => {
                login(facade, username.to_string(), password.to_string()).await?
            }
            _ => {
                send(writer, "ERR authenticate first: REGISTER <username> <password> | LOGIN <username> <password>").await?;
                continue;
            }
        };
        match reply {
            AuthReply::Accepted(user) => {
                send(writer, &format!("OK logged in as {}", user.username)).await?;
                return Ok(Some(user));
            }
            AuthReply::Denied(reason) => {
                send(writer, &format!("ERR {}", reason)).await?;
            }
        }
    }
    Ok(None)
}

async fn register(facade: &Arc<DbFacade>, username: String, password: String) -> Result<AuthReply> {
    if !is_valid_username(&username) {
        return Ok(AuthReply::Denied(
            "usernames are 3-32 chars: letters, digits, _ or -",
        ));
    }
    if password.len() < MIN_PASSWORD_LEN || password.len() > MAX_PASSWORD_LEN {
        return Ok(AuthReply::Denied("passwords are 8-128 chars"));
    }

    let db = facade.clone();
    tokio::task::spawn_blocking(move || -> Result<AuthReply> {
        let shards = db.shard_ids()?;
        if shards.is_empty() {
            return Ok(AuthReply::Denied("no shards registered"));
        }
        let shard_id = pick_shard(&shards, &username);

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hash failed: {}", e))?
            .to_string();

        match db.create_user(&username, &password_hash, None, shard_id)? {
            Some(user) => Ok(AuthReply::Accepted(user)),
            None => Ok(AuthReply::Denied("username taken")),
        }
    })
    .await?
}

async fn login(facade: &Arc<DbFacade>, username: String, password: String) -> Result<AuthReply> {
    if password.len() > MAX_PASSWORD_LEN {
        return Ok(AuthReply::Denied("invalid credentials"));
    }

    let db = facade.clone();
    tokio::task::spawn_blocking(move || -> Result<AuthReply> {
        let Some(user) = db.find_user(&username)? else {
            return Ok(AuthReply::Denied("invalid credentials"));
        };
        let verified = PasswordHash::new(&user.password_hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false);
        if verified {
            Ok(AuthReply::Accepted(user))
        } else {
            Ok(AuthReply::Denied("invalid credentials"))
        }
    })
    .await?
}

/// Letters, digits, underscores and hyphens only.
fn is_valid_username(s: &str) -> bool {
    (3..=MAX_USERNAME_LEN).contains(&s.len())
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Deterministic home-shard pick: hash the username over the registered
/// shard list. Stable for a given registry, no coordination needed.
fn pick_shard(shards: &[ShardId], username: &str) -> ShardId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    username.hash(&mut hasher);
    shards[(hasher.finish() % shards.len() as u64) as usize]
}

// -- Command parsing --

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Chat(String),
    Join(RoomId),
    History,
    Transfer { to: String, amount: Amount },
    Who,
    Quit,
    Unknown(String),
    Malformed(&'static str),
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if !line.starts_with('/') {
        return Command::Chat(line.to_string());
    }

    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("/join") => match parts.next().and_then(|s| s.parse().ok()) {
            Some(room_id) => Command::Join(room_id),
            None => Command::Malformed("usage: /join <room_id>"),
        },
        Some("/history") => Command::History,
        Some("/transfer") => {
            let to = parts.next();
            let amount = parts.next().and_then(|s| s.parse::<Amount>().ok());
            match (to, amount) {
                (Some(to), Some(amount)) => Command::Transfer {
                    to: to.to_string(),
                    amount,
                },
                _ => Command::Malformed("usage: /transfer <username> <amount>"),
            }
        }
        Some("/who") => Command::Who,
        Some("/quit") => Command::Quit,
        Some(other) => Command::Unknown(other.to_string()),
        None => Command::Chat(String::new()),
    }
}

fn transfer_reply(outcome: &TransferOutcome) -> String {
    match outcome {
        TransferOutcome::Ok { tx_id } => format!("OK transfer complete (tx {})", tx_id),
        TransferOutcome::Rejected => "ERR invalid amount".to_string(),
        TransferOutcome::NotFound => "ERR no such user".to_string(),
        TransferOutcome::InsufficientFunds => "ERR insufficient funds".to_string(),
        TransferOutcome::CoordinatorError => {
            "ERR transfer failed, nothing was moved".to_string()
        }
        TransferOutcome::PartialCommit { tx_id } => format!(
            "WARN transfer {} is recorded but not fully applied yet",
            tx_id
        ),
    }
}

async fn send(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}
