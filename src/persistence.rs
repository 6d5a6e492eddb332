//! Declarative snapshot of the registry to `dump.json`: `Save()`/`Resurrect()`.
//! Crashes between mutations may lose a few seconds of `restart_count`, never
//! corrupt the registry — this is a point-in-time snapshot, not an event log.
use std::fs;

use serde::{Deserialize, Serialize};

use crate::{config::ServiceSpec, error::ProcessManagerError, runtime};

/// One persisted entry: enough to recreate the service via `Start`, plus the
/// restart counter so a resurrected entry doesn't silently reset history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpEntry {
    pub name: String,
    pub spec: ServiceSpec,
    pub restart_count: u32,
}

/// Writes every supplied entry to `$HOME/.bm2/dump.json` as a JSON list.
/// There is no schema version field — cross-version resurrection is not
/// guaranteed, which is documented rather than enforced.
pub fn save(entries: &[DumpEntry]) -> Result<(), ProcessManagerError> {
    let json = serde_json::to_string_pretty(entries)?;
    fs::write(runtime::dump_file_path(), json).map_err(ProcessManagerError::IoError)
}

/// Reads `dump.json`; a missing or empty file is a no-op, not an error.
pub fn load() -> Result<Vec<DumpEntry>, ProcessManagerError> {
    let path = runtime::dump_file_path();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = fs::read_to_string(&path).map_err(ProcessManagerError::IoError)?;
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(&contents).map_err(ProcessManagerError::JsonError)
}
