//! Environment-driven configuration. A `.env` file is honored if present;
//! every knob has a default so a bare `parley-server` starts a single-node
//! dev setup out of the box.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use parley_db::DbTunables;
use parley_types::ShardId;

#[derive(Debug, Clone)]
pub struct ShardEntry {
    pub id: ShardId,
    pub name: String,
    pub conninfo: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub catalog_db: String,
    pub shards: Vec<ShardEntry>,
    pub tunables: DbTunables,
}

impl ServerConfig {
    /// Read the full configuration surface:
    ///
    ///   PARLEY_HOST                listen address        (default 0.0.0.0)
    ///   PARLEY_PORT                listen port           (default 12345)
    ///   PARLEY_CATALOG_DB          catalog conninfo      (default catalog.db)
    ///   PARLEY_SHARDS              id:name:conninfo,...  (default two local
    ///                              shard files)
    ///   PARLEY_DB_BUSY_TIMEOUT_MS  per-op DB deadline    (default 5000)
    ///   PARLEY_COMMIT_RETRIES      post-confirm apply    (default 3)
    pub fn from_env() -> Result<Self> {
        let host = env_or("PARLEY_HOST", "0.0.0.0");
        let port = env_or("PARLEY_PORT", "12345")
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let catalog_db = env_or("PARLEY_CATALOG_DB", "catalog.db");
        let shards = parse_shards(&env_or(
            "PARLEY_SHARDS",
            "1:shard1:shard1.db,2:shard2:shard2.db",
        ))?;

        let busy_timeout_ms: u64 = env_or("PARLEY_DB_BUSY_TIMEOUT_MS", "5000")
            .parse()
            .context("PARLEY_DB_BUSY_TIMEOUT_MS must be milliseconds")?;
        let commit_retries = env_or("PARLEY_COMMIT_RETRIES", "3")
            .parse()
            .context("PARLEY_COMMIT_RETRIES must be a count")?;

        Ok(Self {
            host,
            port,
            catalog_db,
            shards,
            tunables: DbTunables {
                busy_timeout: Duration::from_millis(busy_timeout_ms),
                commit_retries,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse the shard registry: comma-separated `id:name:conninfo` entries.
/// Conninfo may itself contain colons, so only the first two are split on.
fn parse_shards(raw: &str) -> Result<Vec<ShardEntry>> {
    let mut shards = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let (Some(id), Some(name), Some(conninfo)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("bad shard entry {:?} (want id:name:conninfo)", entry);
        };
        let id: ShardId = id
            .parse()
            .with_context(|| format!("bad shard id in {:?}", entry))?;
        shards.push(ShardEntry {
            id,
            name: name.to_string(),
            conninfo: conninfo.to_string(),
        });
    }
    if shards.is_empty() {
        bail!("no shards configured");
    }
    Ok(shards)
}
