//! Periodic resource sampler: RSS, CPU%, and open-fd count per live PID, with
//! a bounded per-entry ring buffer and memory-cap enforcement.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

use crate::{constants, supervisor::SupervisorEvent};

/// One resource sample, timestamped at collection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: SystemTime,
    pub rss_bytes: u64,
    pub cpu_percent: f32,
    pub open_fds: Option<u32>,
}

/// What the Monitor needs to know about one live entry to sample it.
#[derive(Debug, Clone)]
pub struct MonitorTarget {
    pub id: u64,
    pub pid: u32,
    pub memory_cap: Option<u64>,
}

struct Ring {
    samples: VecDeque<MetricSample>,
}

impl Ring {
    fn push(&mut self, sample: MetricSample) {
        if self.samples.len() >= constants::MONITOR_RING_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

/// Background 1 Hz sampler over every `online` entry, with a bounded
/// in-memory ring per entry (≤ 3600 samples — one hour at 1 Hz).
pub struct Monitor {
    rings: Arc<Mutex<HashMap<u64, Ring>>>,
    stop: Arc<AtomicBool>,
}

impl Monitor {
    pub fn spawn(
        targets: Arc<Mutex<Vec<MonitorTarget>>>,
        events: std::sync::mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        let rings: Arc<Mutex<HashMap<u64, Ring>>> = Arc::new(Mutex::new(HashMap::new()));
        let rings_clone = Arc::clone(&rings);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);

        thread::spawn(move || {
            let mut system = System::new();
            let mut cpu_state: HashMap<u32, (u64, SystemTime)> = HashMap::new();

            while !stop_clone.load(Ordering::SeqCst) {
                thread::sleep(constants::MONITOR_SAMPLE_INTERVAL);
                let snapshot = targets.lock().expect("monitor targets poisoned").clone();
                system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

                let mut ring_guard = rings_clone.lock().expect("monitor ring poisoned");
                for target in &snapshot {
                    let Some(process) = system.process(Pid::from_u32(target.pid)) else {
                        continue;
                    };
                    let rss_bytes = process.memory();
                    let cpu_percent = process.cpu_usage();
                    let open_fds = open_fd_count(target.pid);
                    cpu_state.insert(target.pid, (rss_bytes, SystemTime::now()));

                    let sample = MetricSample {
                        timestamp: SystemTime::now(),
                        rss_bytes,
                        cpu_percent,
                        open_fds,
                    };

                    ring_guard
                        .entry(target.id)
                        .or_insert_with(|| Ring {
                            samples: VecDeque::with_capacity(constants::MONITOR_RING_CAPACITY),
                        })
                        .push(sample);

                    if let Some(cap) = target.memory_cap
                        && rss_bytes >= cap
                    {
                        let _ = events.send(SupervisorEvent::MemoryExceeded { id: target.id });
                    }
                }

                let alive: std::collections::HashSet<u64> =
                    snapshot.iter().map(|t| t.id).collect();
                ring_guard.retain(|id, _| alive.contains(id));
            }
        });

        Self { rings, stop }
    }

    /// Returns every sample within the trailing `seconds` window for `id`.
    pub fn history(&self, id: u64, seconds: u64) -> Vec<MetricSample> {
        let guard = self.rings.lock().expect("monitor ring poisoned");
        let Some(ring) = guard.get(&id) else {
            return Vec::new();
        };
        let cutoff = SystemTime::now() - std::time::Duration::from_secs(seconds);
        ring.samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .copied()
            .collect()
    }

    pub fn latest(&self, id: u64) -> Option<MetricSample> {
        let guard = self.rings.lock().expect("monitor ring poisoned");
        guard.get(&id)?.samples.back().copied()
    }

    pub fn remove(&self, id: u64) {
        self.rings.lock().expect("monitor ring poisoned").remove(&id);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(target_os = "linux")]
fn open_fd_count(pid: u32) -> Option<u32> {
    std::fs::read_dir(format!("/proc/{pid}/fd"))
        .ok()
        .map(|entries| entries.count() as u32)
}

#[cfg(not(target_os = "linux"))]
fn open_fd_count(_pid: u32) -> Option<u32> {
    None
}
