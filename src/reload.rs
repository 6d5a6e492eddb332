//! Rolling zero-downtime reload: start-new, wait-ready-or-delay, kill-old,
//! proceed — sequentially across a target set.
use std::{thread, time::Duration};

use tracing::{info, warn};

use crate::{constants, error::ProcessManagerError};

/// Result of a reload run: which entries were fully reloaded (in order) and,
/// if the sequence aborted, which entry's respawn failed.
#[derive(Debug, Default)]
pub struct ReloadOutcome {
    pub reloaded: Vec<u64>,
    pub failed_at: Option<u64>,
}

/// Executes the rolling reload described in §4.8 against `ids`, driven
/// entirely through caller-supplied callbacks so the sequencing itself is
/// independent of how the Supervisor actually spawns/kills entries.
///
/// Cancellation mid-sequence (a `spawn_new` failure) leaves already-reloaded
/// entries on the new version and the remaining entries untouched.
pub fn execute<SpawnNew, IsOnline, KillOld>(
    ids: &[u64],
    wait_ready: bool,
    listen_timeout: Duration,
    delay: Duration,
    mut spawn_new: SpawnNew,
    mut is_online: IsOnline,
    mut kill_old: KillOld,
) -> ReloadOutcome
where
    SpawnNew: FnMut(u64) -> Result<(), ProcessManagerError>,
    IsOnline: FnMut(u64) -> bool,
    KillOld: FnMut(u64) -> Result<(), ProcessManagerError>,
{
    let mut reloaded = Vec::new();

    for (index, &id) in ids.iter().enumerate() {
        if let Err(err) = spawn_new(id) {
            warn!("reload aborted: failed to spawn replacement for entry {id}: {err}");
            return ReloadOutcome {
                reloaded,
                failed_at: Some(id),
            };
        }

        if wait_ready {
            wait_for_ready(id, listen_timeout, &mut is_online);
        } else {
            thread::sleep(delay);
        }

        if let Err(err) = kill_old(id) {
            warn!("failed to terminate previous instance of entry {id} during reload: {err}");
        }

        reloaded.push(id);
        info!("reloaded entry {id} ({}/{})", index + 1, ids.len());

        if index + 1 < ids.len() {
            thread::sleep(delay);
        }
    }

    ReloadOutcome {
        reloaded,
        failed_at: None,
    }
}

/// Polls `is_online` every 100 ms up to `listen_timeout`. On timeout,
/// proceeds as if ready — the adopted resolution of the source's ambiguous
/// "reload on listen_timeout" behaviour.
fn wait_for_ready<IsOnline>(id: u64, listen_timeout: Duration, is_online: &mut IsOnline)
where
    IsOnline: FnMut(u64) -> bool,
{
    let deadline = std::time::Instant::now() + listen_timeout;
    while std::time::Instant::now() < deadline {
        if is_online(id) {
            return;
        }
        thread::sleep(constants::RELOAD_READY_POLL_INTERVAL);
    }
    warn!("entry {id} did not report ready within listen_timeout; proceeding with reload");
}
