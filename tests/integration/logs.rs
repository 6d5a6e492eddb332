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
fn logs_tails_the_service_stdout_and_stderr() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let home = dir.join("home");
    fs::create_dir_all(&home).expect("failed to create home dir");
    let _home = HomeEnvGuard::set(&home);

    let config_yaml = r#"
services:
  chatty:
    command: "sh -c 'echo hello-stdout; echo hello-stderr 1>&2; sleep 5'"
"#;
    let config_path = dir.join("bm2.yaml");
    fs::write(&config_path, config_yaml).unwrap();
    let config = load_config(&config_path).unwrap();

    let (sup, sender) = Supervisor::new(config.project_dir.clone());
    thread::spawn(move || sup.run());

    for (name, spec) in config.services.clone() {
        let (tx, rx) = mpsc::channel();
        sender
            .send(SupervisorEvent::Start { name, spec, reply: tx })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    }

    // Give the log sink's debounced writer time to flush to disk.
    thread::sleep(Duration::from_secs(1));

    let (tx, rx) = mpsc::channel();
    sender
        .send(SupervisorEvent::Logs { target: "chatty".to_string(), lines: 10, reply: tx })
        .unwrap();
    let response = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    let entries = response.as_array().expect("logs response is an array");
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry["name"], "chatty");

    let out_lines: Vec<String> = entry["out"]
        .as_array()
        .expect("out is an array")
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    let err_lines: Vec<String> = entry["err"]
        .as_array()
        .expect("err is an array")
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();

    assert!(
        out_lines.iter().any(|line| line.contains("hello-stdout")),
        "stdout tail should contain the echoed line, got {out_lines:?}"
    );
    assert!(
        err_lines.iter().any(|line| line.contains("hello-stderr")),
        "stderr tail should contain the echoed line, got {err_lines:?}"
    );

    let (tx, rx) = mpsc::channel();
    sender.send(SupervisorEvent::Kill { reply: tx }).unwrap();
    let _ = rx.recv_timeout(Duration::from_secs(5));
}
