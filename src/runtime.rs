//! Resolution of the `$HOME/.bm2/` runtime directory tree.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

#[cfg(test)]
use std::path::Path;

use crate::constants::{DUMP_FILE_NAME, LOGS_DIR_NAME, PID_FILE_NAME, PIDS_DIR_NAME, SOCKET_FILE_NAME};

#[derive(Debug, Clone)]
struct RuntimeContext {
    root_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_home(home_dir())))
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

impl RuntimeContext {
    fn from_home(home: PathBuf) -> Self {
        Self {
            root_dir: home.join(".bm2"),
        }
    }
}

/// Re-reads `$HOME` and resets the runtime directory accordingly. Called once at
/// startup; background components should read paths via the accessors below
/// rather than caching them, so a re-init before `run()` is always observed.
pub fn init() {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_home(home_dir());
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_home(home.to_path_buf());
}

/// Returns `$HOME/.bm2`.
pub fn root_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .root_dir
        .clone()
}

/// Returns `$HOME/.bm2/daemon.sock`.
pub fn socket_path() -> PathBuf {
    root_dir().join(SOCKET_FILE_NAME)
}

/// Returns `$HOME/.bm2/daemon.pid`.
pub fn pid_file_path() -> PathBuf {
    root_dir().join(PID_FILE_NAME)
}

/// Returns `$HOME/.bm2/dump.json`.
pub fn dump_file_path() -> PathBuf {
    root_dir().join(DUMP_FILE_NAME)
}

/// Returns `$HOME/.bm2/logs`.
pub fn log_dir() -> PathBuf {
    root_dir().join(LOGS_DIR_NAME)
}

/// Returns `$HOME/.bm2/pids`.
pub fn pids_dir() -> PathBuf {
    root_dir().join(PIDS_DIR_NAME)
}

/// Creates the runtime directory tree (`logs/`, `pids/`) if absent.
pub fn ensure_directories() -> std::io::Result<()> {
    std::fs::create_dir_all(log_dir())?;
    std::fs::create_dir_all(pids_dir())?;
    Ok(())
}
