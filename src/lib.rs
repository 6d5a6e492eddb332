//! Lightweight process manager for Unix services.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
// OpenSSL is only needed for static linking on Linux
#[cfg(target_os = "linux")]
use openssl_sys as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// Child process spawning and tree-kill.
pub mod child;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Constants.
pub mod constants;

/// Cron scheduler.
pub mod cron;

/// Health check probing.
pub mod health;

/// IPC with supervisor.
pub mod ipc;

/// Errors.
pub mod error;

/// Log streaming and rotation.
pub mod logs;

/// Resource sampling.
pub mod monitor;

/// State dump/restore across daemon restarts.
pub mod persistence;

/// Prometheus text exposition.
pub mod prometheus;

/// Registry of supervised service entries.
pub mod registry;

/// Rolling reload orchestration.
pub mod reload;

/// Supervisor inbox and event loop.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;

/// Runtime paths and modes.
pub mod runtime;

/// Filesystem watching.
pub mod watch;
