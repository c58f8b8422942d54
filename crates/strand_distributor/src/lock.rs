//! The move-keys lock: the single cluster-wide lease naming the active
//! distributor.
//!
//! Taking the lock writes a fresh owner id and advances the epoch under a
//! system-priority transaction. While the supervisor runs, the lock is
//! re-verified read-only on a timer; any mismatch is a `MoveKeysConflict`,
//! which the supervisor treats as fatal unless distribution has been
//! disabled in the meantime.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use strand_core::ids::MODE_LOCK_OWNER;
use strand_core::keys::{MOVE_KEYS_LOCK_OWNER_KEY, MOVE_KEYS_LOCK_WRITE_KEY};
use strand_core::{run_transaction, Error, Result, SystemStore, Transaction, TxOption, Uid};

use crate::enabled::DdEnabledState;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveKeysLock {
    pub owner: Uid,
    pub epoch: u64,
}

fn decode_owner(value: &[u8]) -> Result<Uid> {
    Ok(serde_json::from_slice(value)?)
}

fn decode_epoch(value: &[u8]) -> Result<u64> {
    Ok(serde_json::from_slice(value)?)
}

/// Claim the lock for this distributor, superseding any previous owner.
pub async fn take_move_keys_lock(store: &dyn SystemStore, dd_id: Uid) -> Result<MoveKeysLock> {
    tracing::info!(dd_id = %dd_id.short_string(), "taking move keys lock");
    let lock = run_transaction(
        store,
        &[TxOption::AccessSystemKeys, TxOption::PrioritySystemImmediate],
        move |tr| {
            async move {
                let prev_epoch = match tr.get(MOVE_KEYS_LOCK_WRITE_KEY).await? {
                    Some(value) => decode_epoch(&value)?,
                    None => 0,
                };
                let lock = MoveKeysLock {
                    owner: Uid::random(),
                    epoch: prev_epoch + 1,
                };
                tr.set(MOVE_KEYS_LOCK_OWNER_KEY, &serde_json::to_vec(&lock.owner)?);
                tr.set(MOVE_KEYS_LOCK_WRITE_KEY, &serde_json::to_vec(&lock.epoch)?);
                Ok(lock)
            }
            .boxed()
        },
    )
    .await?;
    tracing::info!(dd_id = %dd_id.short_string(), epoch = lock.epoch, "took move keys lock");
    Ok(lock)
}

/// Verify, without writing, that `lock` still names this distributor.
pub async fn check_move_keys_lock_read_only(
    tr: &mut dyn Transaction,
    lock: &MoveKeysLock,
    enabled: &DdEnabledState,
) -> Result<()> {
    if !enabled.is_enabled() {
        tracing::debug!("move keys lock check while distribution disabled");
        return Err(Error::MoveKeysConflict);
    }
    let owner = match tr.get(MOVE_KEYS_LOCK_OWNER_KEY).await? {
        Some(value) => decode_owner(&value)?,
        None => Uid::default(),
    };
    if owner != lock.owner {
        tracing::info!(
            current_owner = %owner,
            our_owner = %lock.owner,
            "move keys lock owner changed"
        );
        return Err(Error::MoveKeysConflict);
    }
    let epoch = match tr.get(MOVE_KEYS_LOCK_WRITE_KEY).await? {
        Some(value) => decode_epoch(&value)?,
        None => 0,
    };
    if epoch != lock.epoch {
        tracing::info!(current_epoch = epoch, our_epoch = lock.epoch, "move keys lock epoch advanced");
        return Err(Error::MoveKeysConflict);
    }
    Ok(())
}

/// Re-verify the lock forever; returns only with an error.
pub async fn poll_move_keys_lock(
    store: Arc<dyn SystemStore>,
    lock: MoveKeysLock,
    enabled: Arc<DdEnabledState>,
    delay: Duration,
) -> Result<()> {
    loop {
        tokio::time::sleep(delay).await;
        let mut tr = store.transaction();
        loop {
            tr.set_option(TxOption::ReadSystemKeys);
            tr.set_option(TxOption::PrioritySystemImmediate);
            match check_move_keys_lock_read_only(tr.as_mut(), &lock, &enabled).await {
                Ok(()) => break,
                Err(err) => tr.on_error(err).await?,
            }
        }
    }
}

/// True when the lock owner is the operator's mode-lock sentinel, meaning
/// distribution was disabled through the lock key.
pub fn owner_is_mode_lock(owner: Uid) -> bool {
    owner == MODE_LOCK_OWNER
}
