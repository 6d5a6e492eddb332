#[path = "common/mod.rs"]
mod common;

use std::{
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use bm2::{
    config::load_config,
    supervisor::{Supervisor, SupervisorEvent},
};
use common::{HomeEnvGuard, is_process_alive, wait_for_file_value};
use serde_json::Value;
use std::fs;
use tempfile::tempdir;

fn start_supervisor(project_dir: std::path::PathBuf) -> mpsc::Sender<SupervisorEvent> {
    let (sup, sender) = Supervisor::new(project_dir);
    thread::spawn(move || sup.run());
    sender
}

fn shutdown(sender: &mpsc::Sender<SupervisorEvent>) {
    let (tx, rx) = mpsc::channel();
    let _ = sender.send(SupervisorEvent::Kill { reply: tx });
    let _ = rx.recv_timeout(Duration::from_secs(5));
}

fn start_service(sender: &mpsc::Sender<SupervisorEvent>, name: &str, spec: bm2::config::ServiceSpec) {
    let (tx, rx) = mpsc::channel();
    sender
        .send(SupervisorEvent::Start { name: name.to_string(), spec, reply: tx })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5))
        .expect("start reply")
        .expect("start succeeded");
}

fn list(sender: &mpsc::Sender<SupervisorEvent>) -> Value {
    let (tx, rx) = mpsc::channel();
    sender.send(SupervisorEvent::List { reply: tx }).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap()
}

fn find<'a>(snapshot: &'a Value, name: &str) -> Option<&'a Value> {
    snapshot.as_array()?.iter().find(|entry| entry["name"] == name)
}

fn wait_for_status(sender: &mpsc::Sender<SupervisorEvent>, name: &str, status: &str) -> Value {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = list(sender);
        if let Some(entry) = find(&snapshot, name) {
            if entry["status"] == status {
                return entry.clone();
            }
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for '{name}' to reach status '{status}': {snapshot}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn individual_service_start_stop_restart() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let home = dir.join("home");
    fs::create_dir_all(&home).unwrap();
    let _home = HomeEnvGuard::set(&home);

    let marker = dir.join("marker.txt");
    let config_yaml = format!(
        r#"
services:
  test_service:
    command: "sh -c 'echo running > {} && sleep 5'"
  other_service:
    command: "sleep 5"
"#,
        marker.display()
    );
    let config_path = dir.join("bm2.yaml");
    fs::write(&config_path, config_yaml).unwrap();
    let config = load_config(&config_path).unwrap();

    let sender = start_supervisor(config.project_dir.clone());
    for (name, spec) in config.services.clone() {
        start_service(&sender, &name, spec);
    }

    wait_for_status(&sender, "test_service", "online");
    wait_for_status(&sender, "other_service", "online");
    wait_for_file_value(&marker, "running");

    let other_pid_before = find(&list(&sender), "other_service").unwrap()["pid"].as_u64().unwrap() as u32;

    // Stop only test_service.
    let (tx, rx) = mpsc::channel();
    sender
        .send(SupervisorEvent::Stop { target: "test_service".to_string(), reply: tx })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    wait_for_status(&sender, "test_service", "stopped");

    // other_service is untouched.
    assert!(
        is_process_alive(other_pid_before),
        "other_service should still be running after stopping test_service"
    );

    // Bring test_service back up.
    let (tx, rx) = mpsc::channel();
    sender
        .send(SupervisorEvent::Restart { target: "test_service".to_string(), reply: tx })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    wait_for_status(&sender, "test_service", "online");

    shutdown(&sender);
}

#[test]
fn restart_of_an_online_entry_replaces_its_pid() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let home = dir.join("home");
    fs::create_dir_all(&home).unwrap();
    let _home = HomeEnvGuard::set(&home);

    let config_yaml = r#"
services:
  sleepy:
    command: "sleep 60"
"#;
    let config_path = dir.join("bm2.yaml");
    fs::write(&config_path, config_yaml).unwrap();
    let config = load_config(&config_path).unwrap();

    let sender = start_supervisor(config.project_dir.clone());
    for (name, spec) in config.services.clone() {
        start_service(&sender, &name, spec);
    }

    let entry = wait_for_status(&sender, "sleepy", "online");
    let pid1 = entry["pid"].as_u64().unwrap() as u32;
    assert!(is_process_alive(pid1));

    let (tx, rx) = mpsc::channel();
    sender
        .send(SupervisorEvent::Restart { target: "sleepy".to_string(), reply: tx })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let pid2 = loop {
        let entry = wait_for_status(&sender, "sleepy", "online");
        let candidate = entry["pid"].as_u64().unwrap() as u32;
        if candidate != pid1 {
            break candidate;
        }
        if Instant::now() >= deadline {
            panic!("sleepy never received a new pid after restart");
        }
        thread::sleep(Duration::from_millis(50));
    };

    assert_ne!(pid1, pid2, "restart should assign a new pid");
    assert!(is_process_alive(pid2), "new process should be running");

    shutdown(&sender);
}

#[test]
fn manual_stop_suppresses_pending_autorestart() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let home = dir.join("home");
    fs::create_dir_all(&home).unwrap();
    let _home = HomeEnvGuard::set(&home);

    let counter = dir.join("counter.txt");
    let config_yaml = format!(
        r#"
services:
  flaky:
    command: "sh -c 'echo $$ >> {}; exit 1'"
    restart_delay_ms: 200
    min_uptime_ms: 50
"#,
        counter.display()
    );
    let config_path = dir.join("bm2.yaml");
    fs::write(&config_path, config_yaml).unwrap();
    let config = load_config(&config_path).unwrap();

    let sender = start_supervisor(config.project_dir.clone());
    for (name, spec) in config.services.clone() {
        start_service(&sender, &name, spec);
    }

    // Give the flaky service a few restart cycles to run.
    thread::sleep(Duration::from_secs(2));
    let runs_before = fs::read_to_string(&counter)
        .unwrap_or_default()
        .lines()
        .count();
    assert!(runs_before >= 2, "flaky service should have restarted at least once, ran {runs_before} times");

    let (tx, rx) = mpsc::channel();
    sender
        .send(SupervisorEvent::Stop { target: "flaky".to_string(), reply: tx })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    wait_for_status(&sender, "flaky", "stopped");

    thread::sleep(Duration::from_millis(500));
    let runs_after = fs::read_to_string(&counter)
        .unwrap_or_default()
        .lines()
        .count();
    assert_eq!(runs_before, runs_after, "manual stop should suppress the pending restart");

    shutdown(&sender);
}
