//! Debounced recursive directory watcher: restarts a service when its source
//! tree changes.
use std::{
    collections::HashSet,
    path::PathBuf,
    sync::mpsc::{Receiver, RecvTimeoutError, channel},
    thread,
    time::Instant,
};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use crate::{config::WatchConfig, constants, supervisor::SupervisorEvent};

/// One running watcher for a service; dropping stops the underlying
/// filesystem watch and its debounce thread.
pub struct FileWatcher {
    // Kept alive so the OS watch isn't torn down; notify stops watching once
    // the watcher value is dropped.
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    pub fn spawn(
        id: u64,
        cwd: Option<&str>,
        config: &WatchConfig,
        events: std::sync::mpsc::Sender<SupervisorEvent>,
    ) -> Option<Self> {
        let roots: Vec<PathBuf> = if config.paths.is_empty() {
            vec![PathBuf::from(cwd.unwrap_or("."))]
        } else {
            config.paths.iter().map(PathBuf::from).collect()
        };

        let mut ignores: HashSet<String> = constants::DEFAULT_WATCH_IGNORES
            .iter()
            .map(|s| s.to_string())
            .collect();
        ignores.extend(config.ignore.iter().cloned());

        let (tx, rx) = channel::<notify::Result<Event>>();
        let mut watcher = match RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        ) {
            Ok(watcher) => watcher,
            Err(err) => {
                warn!("failed to create file watcher for entry {id}: {err}");
                return None;
            }
        };

        let mut watched_any = false;
        for root in &roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => watched_any = true,
                Err(err) => warn!(
                    "recursive watch unavailable for entry {id} at {root:?}, degrading gracefully: {err}"
                ),
            }
        }
        if !watched_any {
            return None;
        }

        spawn_debounce_loop(id, rx, ignores, events);
        Some(Self { _watcher: watcher })
    }
}

fn spawn_debounce_loop(
    id: u64,
    rx: Receiver<notify::Result<Event>>,
    ignores: HashSet<String>,
    events: std::sync::mpsc::Sender<SupervisorEvent>,
) {
    thread::spawn(move || {
        let mut pending = false;
        let mut last_event = Instant::now();

        loop {
            let timeout = if pending {
                constants::WATCH_DEBOUNCE
            } else {
                std::time::Duration::from_secs(3600)
            };

            match rx.recv_timeout(timeout) {
                Ok(Ok(event)) => {
                    if event_is_ignored(&event, &ignores) {
                        continue;
                    }
                    pending = true;
                    last_event = Instant::now();
                }
                Ok(Err(err)) => warn!("file watch error for entry {id}: {err}"),
                Err(RecvTimeoutError::Timeout) => {
                    if pending && last_event.elapsed() >= constants::WATCH_DEBOUNCE {
                        pending = false;
                        let _ = events.send(SupervisorEvent::SourceChanged { id });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    });
}

fn event_is_ignored(event: &Event, ignores: &HashSet<String>) -> bool {
    event.paths.iter().any(|path| {
        path.components().any(|component| {
            let s = component.as_os_str().to_string_lossy();
            ignores.iter().any(|ignored| s == ignored.as_str())
        })
    })
}
