//! Centralized timing constants, file names, and format strings for the daemon.

use std::time::Duration;

// ============================================================================
// Filesystem layout ($HOME/.bm2/)
// ============================================================================

/// Socket file name under the runtime directory.
pub const SOCKET_FILE_NAME: &str = "daemon.sock";

/// PID file name under the runtime directory.
pub const PID_FILE_NAME: &str = "daemon.pid";

/// Declarative snapshot file name under the runtime directory.
pub const DUMP_FILE_NAME: &str = "dump.json";

/// Subdirectory holding per-service log files.
pub const LOGS_DIR_NAME: &str = "logs";

/// Subdirectory holding per-service PID files.
pub const PIDS_DIR_NAME: &str = "pids";

/// ISO-8601-with-millis timestamp format used to decorate log lines.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

// ============================================================================
// Restart policy defaults
// ============================================================================

/// Default delay before a `waiting-restart` entry re-enters `launching`.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(1000);

/// Default grace period granted to a child before escalating to SIGKILL.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default minimum uptime before a restart is no longer considered "unstable".
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(1);

/// Default restart cap when a service omits `max_restarts`.
pub const DEFAULT_MAX_RESTARTS: u32 = 10;

// ============================================================================
// Monitor / HealthProber / CronScheduler / FileWatcher cadence
// ============================================================================

/// Resource-sampling cadence (RSS/CPU%/fd count) for online entries.
pub const MONITOR_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum number of samples retained per entry (one hour at 1 Hz).
pub const MONITOR_RING_CAPACITY: usize = 3600;

/// Default HTTP health-check interval when unspecified.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Default HTTP health-check request timeout when unspecified.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default consecutive-failure threshold before a service is marked unhealthy.
pub const DEFAULT_HEALTH_MAX_FAILS: u32 = 3;

/// Trailing-edge debounce window for coalescing filesystem-change bursts.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Directory name fragments always ignored by the file watcher.
pub const DEFAULT_WATCH_IGNORES: &[&str] = &["node_modules", ".git", ".bm2"];

// ============================================================================
// LogSink cadence
// ============================================================================

/// Debounce window for flushing buffered log lines to disk.
pub const LOG_FLUSH_DEBOUNCE: Duration = Duration::from_millis(100);

/// Cadence at which each LogSink checks its active file size against `max_bytes`.
pub const LOG_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// ReloadCoordinator
// ============================================================================

/// Default inter-step delay for a rolling reload when `wait_ready` is unset.
pub const DEFAULT_RELOAD_DELAY: Duration = Duration::from_millis(1000);

/// Polling interval used while waiting for a reloaded entry to reach `online`.
pub const RELOAD_READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// IPC
// ============================================================================

/// Soft wall-clock deadline a client should apply to an IPC round trip.
pub const IPC_CLIENT_DEADLINE: Duration = Duration::from_secs(10);
