pub mod catalog;
pub mod facade;
pub mod router;
pub mod schema;
pub mod shard;
pub mod transfer;

use std::time::Duration;

pub use catalog::CatalogDb;
pub use facade::DbFacade;
pub use router::DbRouter;
pub use shard::{ShardDb, TransferSide};
pub use transfer::TransferOutcome;

/// Knobs shared by every database session the router opens.
///
/// `busy_timeout` is the per-operation deadline: SQLite retries a locked
/// statement for at most this long before the call fails, at which point the
/// orchestrator treats the operation as failed and compensates.
/// `commit_retries` bounds re-attempts of the per-shard apply step after the
/// ledger has been confirmed.
#[derive(Debug, Clone, Copy)]
pub struct DbTunables {
    pub busy_timeout: Duration,
    pub commit_retries: u32,
}

impl Default for DbTunables {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            commit_retries: 3,
        }
    }
}
