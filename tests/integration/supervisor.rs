#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::mpsc, thread, time::Duration};

use bm2::{
    config::load_config,
    supervisor::{Supervisor, SupervisorEvent},
};
use common::HomeEnvGuard;
use tempfile::tempdir;

#[test]
fn inbox_drains_bulk_start_stop_until_kill() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let home = dir.join("home");
    fs::create_dir_all(&home).expect("failed to create home dir");
    let _home = HomeEnvGuard::set(&home);

    let config_yaml = r#"
services:
  first:
    command: "sleep 30"
  second:
    command: "sleep 30"
"#;
    let config_path = dir.join("bm2.yaml");
    fs::write(&config_path, config_yaml).unwrap();
    let config = load_config(&config_path).unwrap();

    let (sup, sender) = Supervisor::new(config.project_dir.clone());
    let handle = thread::spawn(move || sup.run());

    for (name, spec) in config.services.clone() {
        let (tx, rx) = mpsc::channel();
        sender
            .send(SupervisorEvent::Start { name, spec, reply: tx })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (tx, rx) = mpsc::channel();
        sender.send(SupervisorEvent::List { reply: tx }).unwrap();
        let snapshot = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        let entries = snapshot.as_array().unwrap();
        let all_online = entries.len() == 2 && entries.iter().all(|e| e["status"] == "online");
        if all_online {
            break;
        }
        if std::time::Instant::now() >= deadline {
            panic!("services never reached online: {snapshot}");
        }
        thread::sleep(Duration::from_millis(50));
    }

    // "all" resolves to every registered entry regardless of name.
    let (tx, rx) = mpsc::channel();
    sender
        .send(SupervisorEvent::Stop { target: "all".to_string(), reply: tx })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (tx, rx) = mpsc::channel();
        sender.send(SupervisorEvent::List { reply: tx }).unwrap();
        let snapshot = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        let entries = snapshot.as_array().unwrap();
        if entries.iter().all(|e| e["status"] == "stopped") {
            break;
        }
        if std::time::Instant::now() >= deadline {
            panic!("services never reached stopped: {snapshot}");
        }
        thread::sleep(Duration::from_millis(50));
    }

    // Kill should cause `run()` to return promptly, and should ack before doing so.
    let (tx, rx) = mpsc::channel();
    sender.send(SupervisorEvent::Kill { reply: tx }).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    handle.join().expect("supervisor thread should exit cleanly after Kill");
}
