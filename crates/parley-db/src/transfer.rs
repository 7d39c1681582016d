//! Cross-shard transfer orchestrator.
//!
//! Drives the catalog ledger and the two wallet shards through the
//! Try/Confirm/Cancel lifecycle. The ledger UPDATE to CONFIRMED is the
//! linearization point: before it, any failure compensates and cancels;
//! after it, the transfer is globally durable and per-shard application is
//! only ever retried, never reverted.

use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use parley_types::{Amount, UserId};

use crate::router::DbRouter;
use crate::shard::{ShardDb, TransferSide};

/// Pause between re-attempts of the post-confirm apply step.
const APPLY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Outcome of a transfer, one variant per terminal state of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The transfer is confirmed on the ledger and applied on both shards.
    Ok { tx_id: String },
    /// Ill-formed input (amount <= 0); rejected before any I/O.
    Rejected,
    /// Sender or receiver does not exist; rejected before any shard I/O.
    NotFound,
    /// The sender could not hold the funds; ledger CANCELED, wallets
    /// untouched.
    InsufficientFunds,
    /// The coordinator or a shard failed before confirmation; any
    /// reservation was compensated.
    CoordinatorError,
    /// The ledger says CONFIRMED but a shard did not apply within the retry
    /// budget. The money moved in the global sense; the lagging wallet needs
    /// an out-of-band sweep keyed on this token.
    PartialCommit { tx_id: String },
}

pub fn transfer_money(
    router: &DbRouter,
    from_username: &str,
    to_username: &str,
    amount: Amount,
) -> TransferOutcome {
    info!(
        "transfer: {} -> {}, amount={}",
        from_username, to_username, amount
    );

    // Preconditions: no I/O until both resolve.
    if amount <= 0 {
        warn!("transfer rejected: non-positive amount {}", amount);
        return TransferOutcome::Rejected;
    }
    let from_user = match router.get_user(from_username) {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!("transfer: sender not found: {}", from_username);
            return TransferOutcome::NotFound;
        }
        Err(e) => {
            error!("transfer: sender lookup failed: {:#}", e);
            return TransferOutcome::CoordinatorError;
        }
    };
    let to_user = match router.get_user(to_username) {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!("transfer: receiver not found: {}", to_username);
            return TransferOutcome::NotFound;
        }
        Err(e) => {
            error!("transfer: receiver lookup failed: {:#}", e);
            return TransferOutcome::CoordinatorError;
        }
    };

    // 1. Open the ledger row. Nothing has touched a shard yet.
    let catalog = router.account_db();
    let tx_id = match catalog.start_transaction() {
        Ok(id) => id,
        Err(e) => {
            error!("transfer: coordinator unavailable: {:#}", e);
            return TransferOutcome::CoordinatorError;
        }
    };

    // 2. Resolve both shard sessions.
    let shard_a = match router.shard_for_user(from_user.id) {
        Ok(Some(s)) => s,
        other => {
            log_resolve_failure("sender", from_user.id, other.err());
            cancel_ledger(catalog, &tx_id);
            return TransferOutcome::CoordinatorError;
        }
    };
    let shard_b = match router.shard_for_user(to_user.id) {
        Ok(Some(s)) => s,
        other => {
            log_resolve_failure("receiver", to_user.id, other.err());
            cancel_ledger(catalog, &tx_id);
            return TransferOutcome::CoordinatorError;
        }
    };

    // 3. Try phase. Sender always first: if the funds cannot be held, the
    // receiver side is never touched.
    match shard_a.prepare_transfer(from_user.id, amount, TransferSide::Deduct, &tx_id) {
        Ok(true) => {}
        Ok(false) => {
            warn!("transfer {}: insufficient funds for {}", tx_id, from_username);
            cancel_ledger(catalog, &tx_id);
            return TransferOutcome::InsufficientFunds;
        }
        Err(e) => {
            error!("transfer {}: sender prepare failed: {:#}", tx_id, e);
            cancel_ledger(catalog, &tx_id);
            return TransferOutcome::CoordinatorError;
        }
    }
    match shard_b.prepare_transfer(to_user.id, amount, TransferSide::Credit, &tx_id) {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            warn!("transfer {}: receiver prepare failed, rolling back sender", tx_id);
            if let Err(e) =
                shard_a.rollback_transfer(from_user.id, amount, TransferSide::Deduct, &tx_id)
            {
                error!("transfer {}: sender rollback failed: {:#}", tx_id, e);
            }
            cancel_ledger(catalog, &tx_id);
            return TransferOutcome::CoordinatorError;
        }
    }

    // 4. Confirm phase. The ledger update is the linearization point.
    match catalog.commit_transaction(&tx_id) {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            error!("transfer {}: ledger confirm failed, compensating", tx_id);
            // Reverse order of the successful prepares. The receiver leg is
            // a no-op; issuing it is still correct.
            if let Err(e) =
                shard_b.rollback_transfer(to_user.id, amount, TransferSide::Credit, &tx_id)
            {
                error!("transfer {}: receiver rollback failed: {:#}", tx_id, e);
            }
            if let Err(e) =
                shard_a.rollback_transfer(from_user.id, amount, TransferSide::Deduct, &tx_id)
            {
                error!("transfer {}: sender rollback failed: {:#}", tx_id, e);
            }
            // Best-effort: if the coordinator is reachable this closes the
            // row; if it is down the row stays PENDING for recovery.
            cancel_ledger(catalog, &tx_id);
            return TransferOutcome::CoordinatorError;
        }
    }

    // 5. Apply phase. The global outcome is fixed; shard failures here are
    // retried, then surfaced, never reverted.
    let retries = router.tunables().commit_retries;
    let a_ok = commit_with_retry(
        &shard_a,
        from_user.id,
        amount,
        TransferSide::Deduct,
        &tx_id,
        retries,
    );
    let b_ok = commit_with_retry(
        &shard_b,
        to_user.id,
        amount,
        TransferSide::Credit,
        &tx_id,
        retries,
    );

    if a_ok && b_ok {
        info!("transfer {}: done", tx_id);
        TransferOutcome::Ok { tx_id }
    } else {
        error!(
            "transfer {}: confirmed on the ledger but not fully applied",
            tx_id
        );
        TransferOutcome::PartialCommit { tx_id }
    }
}

fn log_resolve_failure(role: &str, user_id: UserId, err: Option<anyhow::Error>) {
    match err {
        Some(e) => error!("transfer: {} shard session failed (user {}): {:#}", role, user_id, e),
        None => warn!("transfer: {} shard not resolvable (user {})", role, user_id),
    }
}

fn cancel_ledger(catalog: &crate::catalog::CatalogDb, tx_id: &str) {
    match catalog.cancel_transaction(tx_id) {
        Ok(true) => {}
        Ok(false) => warn!("transfer {}: ledger row not cancelable", tx_id),
        Err(e) => error!("transfer {}: ledger cancel failed: {:#}", tx_id, e),
    }
}

fn commit_with_retry(
    shard: &ShardDb,
    user_id: UserId,
    amount: Amount,
    side: TransferSide,
    tx_id: &str,
    retries: u32,
) -> bool {
    for attempt in 0..=retries {
        match shard.commit_transfer(user_id, amount, side, tx_id) {
            Ok(()) => return true,
            Err(e) => {
                warn!(
                    "transfer {}: {:?} commit attempt {}/{} failed: {:#}",
                    tx_id,
                    side,
                    attempt + 1,
                    retries + 1,
                    e
                );
                if attempt < retries {
                    thread::sleep(APPLY_RETRY_DELAY);
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbTunables;

    #[test]
    fn non_positive_amounts_are_rejected_before_io() {
        let router = DbRouter::open(":memory:", DbTunables::default()).unwrap();
        assert_eq!(transfer_money(&router, "a", "b", 0), TransferOutcome::Rejected);
        assert_eq!(transfer_money(&router, "a", "b", -5), TransferOutcome::Rejected);
    }

    #[test]
    fn unknown_users_are_rejected_before_shard_io() {
        let router = DbRouter::open(":memory:", DbTunables::default()).unwrap();
        assert_eq!(
            transfer_money(&router, "ghost", "also-ghost", 10),
            TransferOutcome::NotFound
        );

        router.account_db().register_shard(1, "s1", ":memory:").unwrap();
        router
            .account_db()
            .create_user("alice", "h", None, 1)
            .unwrap()
            .unwrap();
        assert_eq!(
            transfer_money(&router, "alice", "ghost", 10),
            TransferOutcome::NotFound
        );
    }
}
