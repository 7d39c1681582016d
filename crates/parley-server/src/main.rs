mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use parley_chat::Room;
use parley_db::{DbFacade, ShardDb};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .init();

    let cfg = ServerConfig::from_env()?;

    // Open the catalog and seed the shard registry from config. Opening each
    // shard once up front provisions its schema and surfaces a bad conninfo
    // at startup instead of on the first routed request.
    let facade = DbFacade::open(&cfg.catalog_db, cfg.tunables)?;
    for shard in &cfg.shards {
        facade.register_shard(shard.id, &shard.name, &shard.conninfo)?;
        ShardDb::open(&shard.conninfo, &cfg.tunables)?;
        info!("shard {} ({}) at {}", shard.id, shard.name, shard.conninfo);
    }

    let facade = Arc::new(facade);
    let room = Room::new();

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;

    // Build the listener via socket2 so accepted connections inherit
    // TCP_NODELAY — chat lines are tiny and Nagle only adds latency.
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(socket.into())?;

    info!("chat server listening on {}", addr);

    tokio::select! {
        _ = parley_chat::serve(listener, facade, room) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
