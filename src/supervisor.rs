//! The command inbox: a single mutating worker thread that owns the
//! `Registry` and is the only component allowed to change it. Every other
//! subsystem (IPC, Monitor, HealthProber, CronTimer, FileWatcher, the exit
//! waiter threads spawned per child) only ever posts a `SupervisorEvent` back
//! here. This is what keeps restart-policy evaluation, reload sequencing, and
//! bulk target operations free of the races a directly-mutated shared
//! registry would invite.
use std::{
    collections::HashMap,
    path::PathBuf,
    process::Child,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    child::{self, ExitReport},
    config::{ExecMode, ServiceSpec},
    constants,
    error::{ProcessManagerError, Result},
    health::HealthProber,
    cron::CronTimer,
    logs::LogSink,
    monitor::{Monitor, MonitorTarget},
    persistence::{self, DumpEntry},
    prometheus::{self, ProcessMetric, SystemMetric},
    registry::{Health, Registry, ServiceEntry, ServiceState},
    reload,
    watch::FileWatcher,
};

/// Reply channel shared by every IPC-facing event variant.
pub type Reply = mpsc::Sender<Result<Value>>;

/// Everything that can land in the Supervisor's inbox: IPC-originated
/// requests (carrying a reply channel) and background notifications raised
/// by Monitor/HealthProber/CronTimer/FileWatcher/the per-child exit waiter.
pub enum SupervisorEvent {
    Start {
        name: String,
        spec: ServiceSpec,
        reply: Reply,
    },
    Ecosystem {
        specs: Vec<(String, ServiceSpec)>,
        reply: Reply,
    },
    Stop {
        target: String,
        reply: Reply,
    },
    Restart {
        target: String,
        reply: Reply,
    },
    Reload {
        target: String,
        reply: Reply,
    },
    Delete {
        target: String,
        reply: Reply,
    },
    Reset {
        target: String,
        reply: Reply,
    },
    Scale {
        target: String,
        count: u32,
        reply: Reply,
    },
    Signal {
        target: String,
        signal: i32,
        reply: Reply,
    },
    List {
        reply: Reply,
    },
    Describe {
        target: String,
        reply: Reply,
    },
    Logs {
        target: String,
        lines: usize,
        reply: Reply,
    },
    Flush {
        target: Option<String>,
        reply: Reply,
    },
    Metrics {
        reply: Reply,
    },
    MetricsHistory {
        seconds: u64,
        reply: Reply,
    },
    Prometheus {
        reply: Reply,
    },
    Save {
        reply: Reply,
    },
    Resurrect {
        reply: Reply,
    },
    Ping {
        reply: Reply,
    },
    Kill {
        reply: Reply,
    },

    /// A watched child exited. `pid` lets the handler detect and ignore a
    /// stale report from a child a reload has since replaced.
    ChildExited {
        id: u64,
        pid: u32,
        report: ExitReport,
    },
    MemoryExceeded {
        id: u64,
    },
    HealthOk {
        id: u64,
    },
    Unhealthy {
        id: u64,
    },
    CronFired {
        id: u64,
    },
    SourceChanged {
        id: u64,
    },
    /// A `waiting-restart` timer matured without being cancelled.
    RestartDue {
        id: u64,
    },

    /// Reload-internal sub-steps: the Reload handler spawns a dedicated
    /// thread that drives `reload::execute`, and that thread's callbacks
    /// round-trip through these events so the registry is still only ever
    /// touched by this worker.
    ReloadSpawnNew {
        id: u64,
        reply: mpsc::Sender<Result<()>>,
    },
    ReloadIsOnline {
        id: u64,
        reply: mpsc::Sender<bool>,
    },
    ReloadKillOld {
        id: u64,
        reply: mpsc::Sender<Result<()>>,
    },
    DescribeIds {
        ids: Vec<u64>,
        reply: mpsc::Sender<Value>,
    },
}

fn epoch_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// The inbox worker. Owns the `Registry` and every per-entry background
/// handle (log sink, health prober, cron timer, file watcher); nothing here
/// is shared with another thread except through `sender`.
pub struct Supervisor {
    registry: Registry,
    inbox: mpsc::Receiver<SupervisorEvent>,
    sender: mpsc::Sender<SupervisorEvent>,
    sinks: HashMap<u64, LogSink>,
    health: HashMap<u64, HealthProber>,
    cron: HashMap<u64, CronTimer>,
    watchers: HashMap<u64, FileWatcher>,
    restart_timers: HashMap<u64, Arc<AtomicBool>>,
    monitor: Monitor,
    monitor_targets: Arc<Mutex<Vec<MonitorTarget>>>,
    reload_pending: HashMap<u64, (Child, u32, Option<u32>)>,
    project_dir: PathBuf,
    started_at: SystemTime,
    shutdown: bool,
}

impl Supervisor {
    pub fn new(project_dir: PathBuf) -> (Self, mpsc::Sender<SupervisorEvent>) {
        let (tx, rx) = mpsc::channel();
        let monitor_targets = Arc::new(Mutex::new(Vec::new()));
        let monitor = Monitor::spawn(Arc::clone(&monitor_targets), tx.clone());

        let supervisor = Self {
            registry: Registry::new(),
            inbox: rx,
            sender: tx.clone(),
            sinks: HashMap::new(),
            health: HashMap::new(),
            cron: HashMap::new(),
            watchers: HashMap::new(),
            restart_timers: HashMap::new(),
            monitor,
            monitor_targets,
            reload_pending: HashMap::new(),
            project_dir,
            started_at: SystemTime::now(),
            shutdown: false,
        };
        (supervisor, tx)
    }

    /// Consumes inbox events until a `Kill` request sets the shutdown flag.
    pub fn run(mut self) {
        while !self.shutdown {
            let Ok(event) = self.inbox.recv() else {
                break;
            };
            self.handle(event);
        }
    }

    fn handle(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Start { name, spec, reply } => {
                let result = self.start_one(name, spec).map(|ids| self.describe_ids(&ids));
                let _ = reply.send(result);
            }
            SupervisorEvent::Ecosystem { specs, reply } => {
                let ids = self.ecosystem(specs);
                let _ = reply.send(Ok(self.describe_ids(&ids)));
            }
            SupervisorEvent::Stop { target, reply } => {
                let ids = self.registry.resolve(&target);
                for &id in &ids {
                    if let Err(err) = self.stop_one(id, false) {
                        warn!("stop failed for entry {id}: {err}");
                    }
                }
                let _ = reply.send(Ok(self.describe_ids(&ids)));
            }
            SupervisorEvent::Restart { target, reply } => {
                let ids = self.registry.resolve(&target);
                for &id in &ids {
                    if let Err(err) = self.restart_target(id) {
                        warn!("restart failed for entry {id}: {err}");
                    }
                }
                let _ = reply.send(Ok(self.describe_ids(&ids)));
            }
            SupervisorEvent::Reload { target, reply } => self.reload_target(&target, reply),
            SupervisorEvent::Delete { target, reply } => {
                let ids = self.registry.resolve(&target);
                let before = self.describe_ids(&ids);
                for &id in &ids {
                    if let Err(err) = self.stop_one(id, true) {
                        warn!("delete failed for entry {id}: {err}");
                    }
                }
                let _ = reply.send(Ok(before));
            }
            SupervisorEvent::Reset { target, reply } => {
                let ids = self.registry.resolve(&target);
                self.reset(&ids);
                let _ = reply.send(Ok(self.describe_ids(&ids)));
            }
            SupervisorEvent::Scale { target, count, reply } => {
                let result = self.scale(&target, count).map(|ids| self.describe_ids(&ids));
                let _ = reply.send(result);
            }
            SupervisorEvent::Signal { target, signal, reply } => {
                let ids = self.registry.resolve(&target);
                let result = self.signal(&ids, signal).map(|_| json!({"acked": true}));
                let _ = reply.send(result);
            }
            SupervisorEvent::List { reply } => {
                let _ = reply.send(Ok(self.list_all()));
            }
            SupervisorEvent::Describe { target, reply } => {
                let ids = self.registry.resolve(&target);
                let _ = reply.send(Ok(self.describe_ids(&ids)));
            }
            SupervisorEvent::Logs { target, lines, reply } => {
                let ids = self.registry.resolve(&target);
                let _ = reply.send(Ok(self.logs(&ids, lines)));
            }
            SupervisorEvent::Flush { target, reply } => {
                let ids = match target {
                    Some(target) => self.registry.resolve(&target),
                    None => self.registry.all().map(|e| e.id).collect(),
                };
                for id in &ids {
                    if let Some(sink) = self.sinks.get(id) {
                        if let Err(err) = sink.truncate() {
                            warn!("flush failed for entry {id}: {err}");
                        }
                    }
                }
                let _ = reply.send(Ok(json!({"acked": true})));
            }
            SupervisorEvent::Metrics { reply } => {
                let _ = reply.send(Ok(self.metrics_snapshot()));
            }
            SupervisorEvent::MetricsHistory { seconds, reply } => {
                let _ = reply.send(Ok(self.metrics_history(seconds)));
            }
            SupervisorEvent::Prometheus { reply } => {
                let _ = reply.send(Ok(Value::String(self.prometheus_text())));
            }
            SupervisorEvent::Save { reply } => {
                let result = self.save().map(|_| json!({"acked": true}));
                let _ = reply.send(result);
            }
            SupervisorEvent::Resurrect { reply } => {
                let result = self.resurrect().map(|ids| self.describe_ids(&ids));
                let _ = reply.send(result);
            }
            SupervisorEvent::Ping { reply } => {
                let uptime = SystemTime::now()
                    .duration_since(self.started_at)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let _ = reply.send(Ok(json!({
                    "pid": std::process::id(),
                    "uptime_seconds": uptime,
                })));
            }
            SupervisorEvent::Kill { reply } => {
                let _ = reply.send(Ok(json!({"acked": true})));
                self.shutdown = true;
            }
            SupervisorEvent::ChildExited { id, pid, report } => self.handle_child_exited(id, pid, report),
            SupervisorEvent::MemoryExceeded { id } => self.trigger_restart(id, "memory cap exceeded"),
            SupervisorEvent::HealthOk { id } => {
                if let Some(entry) = self.registry.get_mut(id) {
                    entry.health = Health::Healthy;
                    entry.consecutive_health_failures = 0;
                }
            }
            SupervisorEvent::Unhealthy { id } => {
                if let Some(entry) = self.registry.get_mut(id) {
                    entry.health = Health::Unhealthy;
                    entry.consecutive_health_failures += 1;
                }
                self.trigger_restart(id, "health check failure");
            }
            SupervisorEvent::CronFired { id } => self.trigger_restart(id, "cron schedule"),
            SupervisorEvent::SourceChanged { id } => self.trigger_restart(id, "file watch"),
            SupervisorEvent::RestartDue { id } => self.handle_restart_due(id),
            SupervisorEvent::ReloadSpawnNew { id, reply } => {
                let result = self.reload_spawn_new(id);
                let _ = reply.send(result);
            }
            SupervisorEvent::ReloadIsOnline { id, reply } => {
                let online = self
                    .reload_pending
                    .get(&id)
                    .map(|(_, pid, _)| child::process_alive(*pid))
                    .unwrap_or(false);
                let _ = reply.send(online);
            }
            SupervisorEvent::ReloadKillOld { id, reply } => {
                let result = self.reload_kill_old(id);
                let _ = reply.send(result);
            }
            SupervisorEvent::DescribeIds { ids, reply } => {
                let _ = reply.send(self.describe_ids(&ids));
            }
        }
    }

    // -- start / spawn -------------------------------------------------

    fn start_one(&mut self, name: String, spec: ServiceSpec) -> Result<Vec<u64>> {
        let instances = spec.instances.resolve();

        if spec.exec_mode == ExecMode::Cluster && instances > 1 {
            let mut created = Vec::new();
            for worker in 0..instances {
                let worker_name = format!("{name}-{worker}");
                if self.registry.name_exists(&worker_name) {
                    return Err(ProcessManagerError::AlreadyExists { name: worker_name });
                }
                created.push(self.create_and_launch(worker_name, spec.clone(), Some(worker), instances));
            }
            Ok(created)
        } else {
            if self.registry.name_exists(&name) {
                return Err(ProcessManagerError::AlreadyExists { name });
            }
            Ok(vec![self.create_and_launch(name, spec, None, instances)])
        }
    }

    fn create_and_launch(
        &mut self,
        name: String,
        spec: ServiceSpec,
        worker_index: Option<u32>,
        instances: u32,
    ) -> u64 {
        let id = self.registry.next_id();
        let entry = ServiceEntry::new(id, name.clone(), spec, worker_index);
        self.registry.insert(entry);
        if let Err(err) = self.launch(id, instances) {
            warn!("service '{name}' (id {id}) failed to start: {err}");
        }
        id
    }

    fn launch(&mut self, id: u64, instances: u32) -> Result<()> {
        let Some(entry) = self.registry.get(id) else {
            return Err(ProcessManagerError::NotFound { target: id.to_string() });
        };
        let name = entry.name.clone();
        let worker_index = entry.worker_index;
        let mut spec = entry.spec.clone();
        if spec.cwd.is_none() {
            spec.cwd = Some(self.project_dir.to_string_lossy().to_string());
        }

        if let Some(entry) = self.registry.get_mut(id) {
            entry.state = ServiceState::Launching;
        }

        if !self.sinks.contains_key(&id) {
            self.sinks.insert(id, LogSink::new(&name, id, spec.log.clone()));
        }
        let sink = self.sinks.get(&id).expect("log sink just inserted");

        match child::spawn(&spec, id, &name, worker_index, instances, sink) {
            Ok((child, pid)) => {
                self.on_spawned(id, child, pid, &spec);
                Ok(())
            }
            Err(err) => {
                if let Some(entry) = self.registry.get_mut(id) {
                    entry.state = ServiceState::Errored;
                }
                Err(err)
            }
        }
    }

    fn on_spawned(&mut self, id: u64, child: Child, pid: u32, spec: &ServiceSpec) {
        if let Some(entry) = self.registry.get_mut(id) {
            entry.pid = Some(pid);
            entry.started_at = Some(SystemTime::now());
            entry.state = ServiceState::Online;
            entry.health = Health::Unknown;
            entry.consecutive_health_failures = 0;
            entry.manual_restart = false;
        }

        self.upsert_monitor_target(MonitorTarget {
            id,
            pid,
            memory_cap: spec.memory_cap.map(|b| b.0),
        });

        let sender = self.sender.clone();
        thread::spawn(move || {
            let report = child::wait_for_exit(child);
            let _ = sender.send(SupervisorEvent::ChildExited { id, pid, report });
        });

        if !self.watchers.contains_key(&id) {
            if let Some(watch) = &spec.watch {
                if watch.enabled {
                    if let Some(watcher) = FileWatcher::spawn(id, spec.cwd.as_deref(), watch, self.sender.clone()) {
                        self.watchers.insert(id, watcher);
                    }
                }
            }
        }
        if !self.health.contains_key(&id) {
            if let Some(health) = &spec.health {
                self.health.insert(id, HealthProber::spawn(id, health.clone(), self.sender.clone()));
            }
        }
        if !self.cron.contains_key(&id) {
            if let Some(cron) = &spec.cron {
                match CronTimer::spawn(id, cron.clone(), self.sender.clone()) {
                    Ok(timer) => {
                        self.cron.insert(id, timer);
                    }
                    Err(err) => warn!("cron schedule for entry {id} invalid: {err}"),
                }
            }
        }
    }

    fn upsert_monitor_target(&self, target: MonitorTarget) {
        let mut guard = self.monitor_targets.lock().expect("monitor targets poisoned");
        guard.retain(|t| t.id != target.id);
        guard.push(target);
    }

    fn remove_monitor_target(&self, id: u64) {
        let mut guard = self.monitor_targets.lock().expect("monitor targets poisoned");
        guard.retain(|t| t.id != id);
        self.monitor.remove(id);
    }

    /// Tears down the timers tied to an entry's lifetime. Only called on
    /// delete: `stop` alone preserves cron/health/watch so a cron fire or an
    /// operator restart can still recycle a manually-stopped entry.
    fn teardown_entry(&mut self, id: u64) {
        self.health.remove(&id);
        self.cron.remove(&id);
        self.watchers.remove(&id);
        self.remove_monitor_target(id);
        self.sinks.remove(&id);
    }

    // -- stop / delete ---------------------------------------------------

    fn stop_one(&mut self, id: u64, is_delete: bool) -> Result<()> {
        let Some(entry) = self.registry.get_mut(id) else {
            return Err(ProcessManagerError::NotFound { target: id.to_string() });
        };

        match entry.state {
            ServiceState::Stopped | ServiceState::Errored => {
                if is_delete {
                    self.teardown_entry(id);
                    self.registry.remove(id);
                }
                Ok(())
            }
            ServiceState::WaitingRestart => {
                if let Some(cancel) = self.restart_timers.remove(&id) {
                    cancel.store(true, Ordering::SeqCst);
                }
                if let Some(entry) = self.registry.get_mut(id) {
                    entry.state = ServiceState::Stopped;
                }
                if is_delete {
                    self.teardown_entry(id);
                    self.registry.remove(id);
                }
                Ok(())
            }
            ServiceState::Stopping => {
                if is_delete {
                    if let Some(entry) = self.registry.get_mut(id) {
                        entry.pending_delete = true;
                    }
                }
                Ok(())
            }
            ServiceState::Launching | ServiceState::Online => {
                entry.manual_stop = true;
                entry.pending_delete = is_delete;
                entry.state = ServiceState::Stopping;
                let pid = entry.pid;
                let treekill = entry.spec.treekill;
                let kill_timeout = Duration::from_millis(entry.spec.kill_timeout_ms);
                if let Some(pid) = pid {
                    thread::spawn(move || {
                        if let Err(err) = child::tree_kill(pid, treekill, kill_timeout) {
                            warn!("tree-kill for pid {pid} failed: {err}");
                        }
                    });
                }
                Ok(())
            }
        }
    }

    fn handle_child_exited(&mut self, id: u64, pid: u32, report: ExitReport) {
        let Some(entry) = self.registry.get_mut(id) else { return };
        if entry.pid != Some(pid) {
            // Stale exit from a child a reload or a later restart already replaced.
            return;
        }

        let was_manual_stop = entry.manual_stop;
        let was_manual_restart = entry.manual_restart;
        let pending_delete = entry.pending_delete;
        let started_at = entry.started_at;
        let min_uptime = Duration::from_millis(entry.spec.min_uptime_ms);
        let autorestart = entry.spec.autorestart;
        let max_restarts = entry.spec.max_restarts;
        let restart_delay = Duration::from_millis(entry.spec.restart_delay_ms);
        let name = entry.name.clone();

        entry.pid = None;
        entry.started_at = None;
        entry.manual_stop = false;
        entry.pending_delete = false;
        self.remove_monitor_target(id);

        if pending_delete {
            self.teardown_entry(id);
            self.registry.remove(id);
            info!("entry {id} ('{name}') removed after its child exited");
            return;
        }

        let entry = self.registry.get_mut(id).expect("entry present");

        if was_manual_stop {
            entry.state = ServiceState::Stopped;
            if was_manual_restart {
                entry.manual_restart = false;
                if let Err(err) = self.launch(id, 1) {
                    warn!("restart of entry {id} ('{name}') failed to relaunch: {err}");
                }
            }
            return;
        }

        if !autorestart {
            entry.state = if report.exit_code == Some(0) {
                ServiceState::Stopped
            } else {
                ServiceState::Errored
            };
            return;
        }

        if entry.restart_count >= max_restarts {
            entry.state = ServiceState::Errored;
            warn!("entry {id} ('{name}') hit its restart cap ({max_restarts}); not restarting");
            return;
        }

        let stable = started_at
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .map(|uptime| uptime >= min_uptime)
            .unwrap_or(false);
        if !stable {
            entry.unstable_restarts += 1;
        }

        entry.state = ServiceState::WaitingRestart;
        self.arm_restart_timer(id, restart_delay);
    }

    fn arm_restart_timer(&mut self, id: u64, delay: Duration) {
        let cancel = Arc::new(AtomicBool::new(false));
        self.restart_timers.insert(id, Arc::clone(&cancel));
        let sender = self.sender.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if !cancel.load(Ordering::SeqCst) {
                let _ = sender.send(SupervisorEvent::RestartDue { id });
            }
        });
    }

    fn handle_restart_due(&mut self, id: u64) {
        self.restart_timers.remove(&id);
        let Some(entry) = self.registry.get_mut(id) else { return };
        if entry.state != ServiceState::WaitingRestart {
            return;
        }
        entry.restart_count += 1;
        let instances = entry.spec.instances.resolve();
        if let Err(err) = self.launch(id, instances) {
            warn!("scheduled restart of entry {id} failed: {err}");
        }
    }

    /// Restart semantics (used both by the `restart` request and by
    /// policy-triggered recycling): suppress the exit-driven autorestart
    /// policy for the in-flight stop/start pair rather than layering a
    /// second, independent restart path on top of it.
    fn restart_target(&mut self, id: u64) -> Result<()> {
        let has_child = self
            .registry
            .get(id)
            .ok_or_else(|| ProcessManagerError::NotFound { target: id.to_string() })?
            .state
            .has_child();

        if has_child {
            if let Some(entry) = self.registry.get_mut(id) {
                entry.manual_restart = true;
            }
            self.stop_one(id, false)
        } else {
            if let Some(cancel) = self.restart_timers.remove(&id) {
                cancel.store(true, Ordering::SeqCst);
            }
            let instances = {
                let entry = self.registry.get_mut(id).expect("checked above");
                // A manual restart is the other release valve for the restart
                // cap besides `reset` (spec invariant: restart_count <= max_restarts).
                entry.restart_count = 0;
                entry.unstable_restarts = 0;
                entry.spec.instances.resolve()
            };
            self.launch(id, instances)
        }
    }

    fn trigger_restart(&mut self, id: u64, reason: &str) {
        if let Err(err) = self.restart_target(id) {
            warn!("failed to restart entry {id} after {reason}: {err}");
        }
    }

    // -- scale / signal / reset ------------------------------------------

    fn scale(&mut self, target: &str, count: u32) -> Result<Vec<u64>> {
        let ids = self.registry.resolve(target);
        if ids.is_empty() {
            return Err(ProcessManagerError::NotFound { target: target.to_string() });
        }

        let (base_name, spec) = {
            let first = self.registry.get(ids[0]).expect("resolved id exists");
            let base_name = first.name.split('-').next().unwrap_or(&first.name).to_string();
            (base_name, first.spec.clone())
        };

        let mut by_index: Vec<(u32, u64)> = ids
            .iter()
            .filter_map(|&id| self.registry.get(id).and_then(|e| e.worker_index.map(|w| (w, id))))
            .collect();
        by_index.sort_by_key(|(worker, _)| *worker);
        let current = by_index.len() as u32;

        if count > current {
            let mut all_ids: Vec<u64> = by_index.iter().map(|(_, id)| *id).collect();
            for worker in current..count {
                let name = format!("{base_name}-{worker}");
                if self.registry.name_exists(&name) {
                    continue;
                }
                all_ids.push(self.create_and_launch(name, spec.clone(), Some(worker), count));
            }
            Ok(all_ids)
        } else {
            let mut kept = Vec::new();
            for (worker, id) in by_index {
                if worker < count {
                    kept.push(id);
                } else if let Err(err) = self.stop_one(id, true) {
                    warn!("failed to scale down entry {id}: {err}");
                }
            }
            Ok(kept)
        }
    }

    fn signal(&self, ids: &[u64], raw_signal: i32) -> Result<()> {
        let signal = nix::sys::signal::Signal::try_from(raw_signal)
            .map_err(|_| ProcessManagerError::InvalidSpec(format!("unknown signal {raw_signal}")))?;
        for &id in ids {
            if let Some(pid) = self.registry.get(id).and_then(|e| e.pid) {
                if let Err(err) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal) {
                    warn!("failed to signal entry {id} (pid {pid}) with {signal}: {err}");
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self, ids: &[u64]) {
        for &id in ids {
            if let Some(entry) = self.registry.get_mut(id) {
                entry.restart_count = 0;
                entry.unstable_restarts = 0;
            }
        }
    }

    // -- logs / flush / metrics / prometheus ------------------------------

    fn logs(&self, ids: &[u64], lines: usize) -> Value {
        let mut out = Vec::new();
        for &id in ids {
            if let Some(entry) = self.registry.get(id) {
                let (stdout, stderr) = self.sinks.get(&id).map(|s| s.tail(lines)).unwrap_or_default();
                out.push(json!({"id": id, "name": entry.name, "out": stdout, "err": stderr}));
            }
        }
        Value::Array(out)
    }

    fn metrics_snapshot(&self) -> Value {
        let processes: Vec<Value> = self
            .registry
            .all()
            .map(|entry| {
                let sample = self.monitor.latest(entry.id);
                json!({
                    "id": entry.id,
                    "name": entry.name,
                    "cpu_percent": sample.map(|s| s.cpu_percent).unwrap_or(0.0),
                    "memory_bytes": sample.map(|s| s.rss_bytes).unwrap_or(0),
                    "open_fds": sample.and_then(|s| s.open_fds),
                    "timestamp": sample.map(|s| epoch_seconds(s.timestamp)),
                })
            })
            .collect();
        json!({"processes": processes})
    }

    fn metrics_history(&self, seconds: u64) -> Value {
        let processes: Vec<Value> = self
            .registry
            .all()
            .map(|entry| {
                let samples: Vec<Value> = self
                    .monitor
                    .history(entry.id, seconds)
                    .iter()
                    .map(|s| {
                        json!({
                            "timestamp": epoch_seconds(s.timestamp),
                            "cpu_percent": s.cpu_percent,
                            "memory_bytes": s.rss_bytes,
                            "open_fds": s.open_fds,
                        })
                    })
                    .collect();
                json!({"id": entry.id, "name": entry.name, "samples": samples})
            })
            .collect();
        json!({"processes": processes})
    }

    fn prometheus_text(&self) -> String {
        let processes: Vec<ProcessMetric> = self
            .registry
            .all()
            .map(|entry| {
                let sample = self.monitor.latest(entry.id);
                let uptime = entry
                    .started_at
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                ProcessMetric {
                    name: entry.name.clone(),
                    id: entry.id,
                    status: entry.state.as_str().to_string(),
                    online: entry.state == ServiceState::Online,
                    cpu_percent: sample.map(|s| s.cpu_percent).unwrap_or(0.0),
                    memory_bytes: sample.map(|s| s.rss_bytes).unwrap_or(0),
                    restarts_total: entry.restart_count,
                    uptime_seconds: uptime,
                }
            })
            .collect();

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let load = sysinfo::System::load_average();
        let system = SystemMetric {
            memory_total_bytes: sys.total_memory(),
            memory_free_bytes: sys.free_memory(),
            load_average_1m: load.one,
            load_average_5m: load.five,
            load_average_15m: load.fifteen,
        };

        prometheus::render(&processes, &system)
    }

    // -- list / describe --------------------------------------------------

    fn to_process_state(&self, entry: &ServiceEntry) -> Value {
        let uptime_seconds = entry
            .started_at
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let sample = self.monitor.latest(entry.id);

        let mut bm2_env = serde_json::to_value(&entry.spec).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut bm2_env {
            map.insert("status".to_string(), json!(entry.state.as_str()));
            map.insert("pm_id".to_string(), json!(entry.id));
            map.insert("pm_uptime".to_string(), json!(entry.started_at.map(epoch_seconds)));
            map.insert("restart_time".to_string(), json!(entry.restart_count));
            map.insert("unstable_restarts".to_string(), json!(entry.unstable_restarts));
            map.insert("created_at".to_string(), json!(epoch_seconds(entry.created_at)));
        }

        json!({
            "id": entry.id,
            "pm_id": entry.id,
            "name": entry.name,
            "namespace": entry.namespace,
            "status": entry.state.as_str(),
            "health": entry.health,
            "pid": entry.pid,
            "uptime_seconds": uptime_seconds,
            "monit": {
                "memory": sample.map(|s| s.rss_bytes).unwrap_or(0),
                "cpu": sample.map(|s| s.cpu_percent).unwrap_or(0.0),
                "handles": sample.and_then(|s| s.open_fds),
            },
            "bm2_env": bm2_env,
        })
    }

    fn list_all(&self) -> Value {
        let ids: Vec<u64> = self.registry.all().map(|e| e.id).collect();
        self.describe_ids(&ids)
    }

    fn describe_ids(&self, ids: &[u64]) -> Value {
        Value::Array(
            ids.iter()
                .filter_map(|&id| self.registry.get(id))
                .map(|entry| self.to_process_state(entry))
                .collect(),
        )
    }

    fn ecosystem(&mut self, specs: Vec<(String, ServiceSpec)>) -> Vec<u64> {
        let mut ids = Vec::new();
        for (name, spec) in specs {
            match self.start_one(name.clone(), spec) {
                Ok(mut created) => ids.append(&mut created),
                Err(err) => warn!("ecosystem entry '{name}' failed to start: {err}"),
            }
        }
        ids
    }

    // -- save / resurrect --------------------------------------------------

    fn save(&self) -> Result<()> {
        let entries: Vec<DumpEntry> = self
            .registry
            .all()
            .map(|e| DumpEntry {
                name: e.name.clone(),
                spec: e.spec.clone(),
                restart_count: e.restart_count,
            })
            .collect();
        persistence::save(&entries)
    }

    fn resurrect(&mut self) -> Result<Vec<u64>> {
        let entries = persistence::load()?;
        let mut ids = Vec::new();
        for entry in entries {
            let restart_count = entry.restart_count;
            match self.start_one(entry.name.clone(), entry.spec) {
                Ok(created) => {
                    for &id in &created {
                        if let Some(e) = self.registry.get_mut(id) {
                            e.restart_count = restart_count;
                        }
                    }
                    ids.extend(created);
                }
                Err(err) => warn!("resurrect failed for '{}': {err}", entry.name),
            }
        }
        Ok(ids)
    }

    // -- reload ------------------------------------------------------------

    fn reload_target(&mut self, target: &str, reply: Reply) {
        let ids = self.registry.resolve(target);
        if ids.is_empty() {
            let _ = reply.send(Err(ProcessManagerError::NotFound { target: target.to_string() }));
            return;
        }

        let (wait_ready, listen_timeout_ms) = self
            .registry
            .get(ids[0])
            .map(|e| (e.spec.wait_ready, e.spec.listen_timeout_ms))
            .unwrap_or((false, 5000));
        let sender = self.sender.clone();

        thread::spawn(move || {
            let outcome = reload::execute(
                &ids,
                wait_ready,
                Duration::from_millis(listen_timeout_ms),
                constants::DEFAULT_RELOAD_DELAY,
                |id| reload_call_result(&sender, |reply| SupervisorEvent::ReloadSpawnNew { id, reply }),
                |id| reload_call_bool(&sender, |reply| SupervisorEvent::ReloadIsOnline { id, reply }),
                |id| reload_call_result(&sender, |reply| SupervisorEvent::ReloadKillOld { id, reply }),
            );

            let (tx, rx) = mpsc::channel();
            if sender
                .send(SupervisorEvent::DescribeIds { ids: outcome.reloaded, reply: tx })
                .is_ok()
            {
                if let Ok(data) = rx.recv() {
                    let _ = reply.send(Ok(data));
                    return;
                }
            }
            let _ = reply.send(Err(ProcessManagerError::Internal(
                "failed to describe reloaded entries".to_string(),
            )));
        });
    }

    fn reload_spawn_new(&mut self, id: u64) -> Result<()> {
        let (name, spec, worker_index, instances, old_pid) = {
            let entry = self.registry.get(id).ok_or_else(|| ProcessManagerError::NotFound { target: id.to_string() })?;
            let instances = entry.spec.instances.resolve();
            (entry.name.clone(), entry.spec.clone(), entry.worker_index, instances, entry.pid)
        };

        if !self.sinks.contains_key(&id) {
            self.sinks.insert(id, LogSink::new(&name, id, spec.log.clone()));
        }
        let sink = self.sinks.get(&id).expect("log sink just inserted");

        let (child, new_pid) = child::spawn(&spec, id, &name, worker_index, instances, sink)?;
        self.reload_pending.insert(id, (child, new_pid, old_pid));
        Ok(())
    }

    fn reload_kill_old(&mut self, id: u64) -> Result<()> {
        let Some((child, new_pid, old_pid)) = self.reload_pending.remove(&id) else {
            return Err(ProcessManagerError::Internal(format!("no pending reload for entry {id}")));
        };

        let (treekill, kill_timeout, memory_cap) = {
            let entry = self.registry.get_mut(id).ok_or_else(|| ProcessManagerError::NotFound { target: id.to_string() })?;
            entry.pid = Some(new_pid);
            entry.started_at = Some(SystemTime::now());
            entry.restart_count += 1;
            (entry.spec.treekill, Duration::from_millis(entry.spec.kill_timeout_ms), entry.spec.memory_cap)
        };

        self.upsert_monitor_target(MonitorTarget { id, pid: new_pid, memory_cap: memory_cap.map(|b| b.0) });

        let sender = self.sender.clone();
        thread::spawn(move || {
            let report = child::wait_for_exit(child);
            let _ = sender.send(SupervisorEvent::ChildExited { id, pid: new_pid, report });
        });

        if let Some(old_pid) = old_pid {
            thread::spawn(move || {
                if let Err(err) = child::tree_kill(old_pid, treekill, kill_timeout) {
                    warn!("tree-kill of the previous reload instance (pid {old_pid}) failed: {err}");
                }
            });
        }

        Ok(())
    }
}

/// Calls into the inbox from a background thread and blocks for the reply.
/// Used by the reload orchestrator thread, which must never touch the
/// registry directly.
fn reload_call_result(
    sender: &mpsc::Sender<SupervisorEvent>,
    build: impl FnOnce(mpsc::Sender<Result<()>>) -> SupervisorEvent,
) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    sender
        .send(build(tx))
        .map_err(|_| ProcessManagerError::Internal("supervisor inbox closed during reload".to_string()))?;
    rx.recv().map_err(|_| ProcessManagerError::Internal("supervisor reply channel closed during reload".to_string()))?
}

fn reload_call_bool(
    sender: &mpsc::Sender<SupervisorEvent>,
    build: impl FnOnce(mpsc::Sender<bool>) -> SupervisorEvent,
) -> bool {
    let (tx, rx) = mpsc::channel();
    if sender.send(build(tx)).is_err() {
        return false;
    }
    rx.recv().unwrap_or(false)
}

// ---------------------------------------------------------------------------
// IPC request -> SupervisorEvent dispatch
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StartData {
    name: String,
    #[serde(flatten)]
    spec: ServiceSpec,
}

#[derive(Deserialize)]
struct EcosystemData {
    apps: Vec<StartData>,
}

#[derive(Deserialize)]
struct TargetData {
    #[serde(default = "default_all_target")]
    target: String,
}

fn default_all_target() -> String {
    "all".to_string()
}

#[derive(Deserialize)]
struct ScaleData {
    target: String,
    count: u32,
}

#[derive(Deserialize)]
struct SignalData {
    target: String,
    signal: i32,
}

#[derive(Deserialize)]
struct LogsData {
    target: String,
    #[serde(default = "default_log_lines")]
    lines: usize,
}

fn default_log_lines() -> usize {
    200
}

#[derive(Deserialize, Default)]
struct FlushData {
    target: Option<String>,
}

#[derive(Deserialize)]
struct HistoryData {
    seconds: u64,
}

/// Translates one `IpcRequest` into a `SupervisorEvent`, blocks for the
/// reply, and wraps it back up as an `IpcResponse`. This is the only place
/// that understands the §6.1 wire contract; the inbox itself only ever sees
/// `SupervisorEvent`s.
pub fn dispatch(request: crate::ipc::IpcRequest, sender: &mpsc::Sender<SupervisorEvent>) -> crate::ipc::IpcResponse {
    match route(&request, sender) {
        Ok(data) => crate::ipc::IpcResponse::ok(&request, data),
        Err(err) => crate::ipc::IpcResponse::err(&request, err.to_string()),
    }
}

fn route(request: &crate::ipc::IpcRequest, sender: &mpsc::Sender<SupervisorEvent>) -> Result<Value> {
    match request.request_type.as_str() {
        "start" => {
            let data: StartData = serde_json::from_value(request.data.clone())?;
            call(sender, |reply| SupervisorEvent::Start { name: data.name, spec: data.spec, reply })
        }
        "ecosystem" => {
            let data: EcosystemData = serde_json::from_value(request.data.clone())?;
            let specs = data.apps.into_iter().map(|a| (a.name, a.spec)).collect();
            call(sender, |reply| SupervisorEvent::Ecosystem { specs, reply })
        }
        "stop" => target_call(request, sender, |target, reply| SupervisorEvent::Stop { target, reply }),
        "stopAll" => call(sender, |reply| SupervisorEvent::Stop { target: "all".to_string(), reply }),
        "restart" => target_call(request, sender, |target, reply| SupervisorEvent::Restart { target, reply }),
        "restartAll" => call(sender, |reply| SupervisorEvent::Restart { target: "all".to_string(), reply }),
        "reload" => target_call(request, sender, |target, reply| SupervisorEvent::Reload { target, reply }),
        "reloadAll" => call(sender, |reply| SupervisorEvent::Reload { target: "all".to_string(), reply }),
        "delete" => target_call(request, sender, |target, reply| SupervisorEvent::Delete { target, reply }),
        "deleteAll" => call(sender, |reply| SupervisorEvent::Delete { target: "all".to_string(), reply }),
        "reset" => target_call(request, sender, |target, reply| SupervisorEvent::Reset { target, reply }),
        "scale" => {
            let data: ScaleData = serde_json::from_value(request.data.clone())?;
            call(sender, |reply| SupervisorEvent::Scale { target: data.target, count: data.count, reply })
        }
        "signal" => {
            let data: SignalData = serde_json::from_value(request.data.clone())?;
            call(sender, |reply| SupervisorEvent::Signal { target: data.target, signal: data.signal, reply })
        }
        "list" => call(sender, |reply| SupervisorEvent::List { reply }),
        "describe" => target_call(request, sender, |target, reply| SupervisorEvent::Describe { target, reply }),
        "logs" => {
            let data: LogsData = serde_json::from_value(request.data.clone())?;
            call(sender, |reply| SupervisorEvent::Logs { target: data.target, lines: data.lines, reply })
        }
        "flush" => {
            let data: FlushData = serde_json::from_value(request.data.clone()).unwrap_or_default();
            call(sender, |reply| SupervisorEvent::Flush { target: data.target, reply })
        }
        "metrics" => call(sender, |reply| SupervisorEvent::Metrics { reply }),
        "metricsHistory" => {
            let data: HistoryData = serde_json::from_value(request.data.clone())?;
            call(sender, |reply| SupervisorEvent::MetricsHistory { seconds: data.seconds, reply })
        }
        "prometheus" => call(sender, |reply| SupervisorEvent::Prometheus { reply }),
        "save" => call(sender, |reply| SupervisorEvent::Save { reply }),
        "resurrect" => call(sender, |reply| SupervisorEvent::Resurrect { reply }),
        "ping" => call(sender, |reply| SupervisorEvent::Ping { reply }),
        "kill" => call(sender, |reply| SupervisorEvent::Kill { reply }),
        other => Err(ProcessManagerError::InvalidSpec(format!("unknown request type '{other}'"))),
    }
}

fn target_call(
    request: &crate::ipc::IpcRequest,
    sender: &mpsc::Sender<SupervisorEvent>,
    build: impl FnOnce(String, Reply) -> SupervisorEvent,
) -> Result<Value> {
    let data: TargetData = serde_json::from_value(request.data.clone())?;
    call(sender, |reply| build(data.target, reply))
}

fn call(sender: &mpsc::Sender<SupervisorEvent>, build: impl FnOnce(Reply) -> SupervisorEvent) -> Result<Value> {
    let (tx, rx) = mpsc::channel();
    sender
        .send(build(tx))
        .map_err(|_| ProcessManagerError::Internal("supervisor inbox closed".to_string()))?;
    rx.recv().map_err(|_| ProcessManagerError::Internal("supervisor reply channel closed".to_string()))?
}

/// Posts a `Kill` event and waits for its ack — used by the signal handler
/// in the daemon entrypoint to drive a graceful shutdown through the same
/// path an IPC client would use.
pub fn request_shutdown(sender: &mpsc::Sender<SupervisorEvent>) {
    let (tx, rx) = mpsc::channel();
    if sender.send(SupervisorEvent::Kill { reply: tx }).is_ok() {
        let _ = rx.recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSpec;
    use std::time::Instant;

    fn crash_loop_spec(max_restarts: u32) -> ServiceSpec {
        let yaml = format!(
            "command: \"sh -c 'exit 1'\"\nmax_restarts: {max_restarts}\nrestart_delay_ms: 20\n"
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn find<'a>(snapshot: &'a Value, name: &str) -> Option<&'a Value> {
        snapshot.as_array()?.iter().find(|entry| entry["name"] == name)
    }

    fn wait_for_status(sender: &mpsc::Sender<SupervisorEvent>, name: &str, status: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let (tx, rx) = mpsc::channel();
            sender.send(SupervisorEvent::List { reply: tx }).unwrap();
            let snapshot = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            if let Some(entry) = find(&snapshot, name) {
                if entry["status"] == status {
                    return entry.clone();
                }
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for '{name}' to reach status '{status}': {snapshot}");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    // spec.md's "Concrete end-to-end scenario 1": a service with
    // max_restarts=3 that keeps crashing on launch ends up errored with
    // restart_count and unstable_restarts both pinned at 3.
    #[test]
    fn crash_loop_stops_at_max_restarts() {
        let temp = tempfile::tempdir().unwrap();
        let (sup, sender) = Supervisor::new(temp.path().to_path_buf());
        thread::spawn(move || sup.run());

        let (tx, rx) = mpsc::channel();
        sender
            .send(SupervisorEvent::Start {
                name: "flaky".to_string(),
                spec: crash_loop_spec(3),
                reply: tx,
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        let entry = wait_for_status(&sender, "flaky", "errored");
        assert_eq!(entry["bm2_env"]["restart_time"], json!(3));
        assert_eq!(entry["bm2_env"]["unstable_restarts"], json!(3));

        request_shutdown(&sender);
    }

    // A manual restart of a capped, errored entry is the other release valve
    // for the cap besides `reset` (spec invariant 5) — it must bring
    // restart_count back under max_restarts, not push it further over.
    #[test]
    fn manual_restart_resets_counters_on_an_errored_entry() {
        let temp = tempfile::tempdir().unwrap();
        let (sup, sender) = Supervisor::new(temp.path().to_path_buf());
        thread::spawn(move || sup.run());

        let (tx, rx) = mpsc::channel();
        sender
            .send(SupervisorEvent::Start {
                name: "flaky".to_string(),
                spec: crash_loop_spec(1),
                reply: tx,
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        wait_for_status(&sender, "flaky", "errored");

        let (tx, rx) = mpsc::channel();
        sender
            .send(SupervisorEvent::Restart { target: "flaky".to_string(), reply: tx })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let (tx, rx) = mpsc::channel();
            sender.send(SupervisorEvent::List { reply: tx }).unwrap();
            let snapshot = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            let entry = find(&snapshot, "flaky").unwrap().clone();
            if entry["bm2_env"]["restart_time"] == json!(0) {
                assert_eq!(entry["bm2_env"]["unstable_restarts"], json!(0));
                break;
            }
            if Instant::now() >= deadline {
                panic!("restart never reset the restart counters: {entry}");
            }
            thread::sleep(Duration::from_millis(20));
        }

        request_shutdown(&sender);
    }
}
