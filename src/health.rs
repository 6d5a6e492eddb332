//! Per-service HTTP health probing: polls a URL on an interval, tracks
//! consecutive failures, and signals the Supervisor once a threshold is hit.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::debug;

use crate::{config::HealthConfig, supervisor::SupervisorEvent};

/// One running prober for a single service; dropping or calling `stop`
/// cancels the timer (the in-flight request is bounded by its own timeout).
pub struct HealthProber {
    stop: Arc<AtomicBool>,
}

impl HealthProber {
    pub fn spawn(
        id: u64,
        config: HealthConfig,
        events: std::sync::mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);

        thread::spawn(move || {
            let client = match reqwest::blocking::Client::builder()
                .timeout(Duration::from_millis(config.timeout_ms))
                .build()
            {
                Ok(client) => client,
                Err(err) => {
                    debug!("failed to build health client for entry {id}: {err}");
                    return;
                }
            };

            let mut consecutive_failures: u32 = 0;

            while !stop_clone.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(config.interval_ms));
                if stop_clone.load(Ordering::SeqCst) {
                    break;
                }

                let healthy = match client.get(&config.url).send() {
                    Ok(response) => response.status().is_success(),
                    Err(err) => {
                        debug!("health check for entry {id} failed: {err}");
                        false
                    }
                };

                if healthy {
                    consecutive_failures = 0;
                    let _ = events.send(SupervisorEvent::HealthOk { id });
                } else {
                    consecutive_failures += 1;
                    if consecutive_failures >= config.max_fails {
                        consecutive_failures = 0;
                        let _ = events.send(SupervisorEvent::Unhealthy { id });
                    }
                }
            }
        });

        Self { stop }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
