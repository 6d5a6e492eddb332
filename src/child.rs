//! Spawns and owns a single OS child: piping stdout/stderr to the log sink,
//! tree-kill termination, and one-shot exit delivery.
use std::{
    collections::HashMap,
    fs, io,
    path::Path,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, warn};

use crate::{config::ServiceSpec, error::ProcessManagerError, logs::LogSink};

/// Outcome delivered exactly once when a child exits, regardless of cause.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Splits a command line on whitespace, respecting single/double-quoted
/// segments, and resolves the interpreter per the service's extension rules.
pub fn resolve_executable(spec: &ServiceSpec) -> Result<(String, Vec<String>), ProcessManagerError> {
    let tokens = split_command_line(&spec.command)?;
    let Some(first) = tokens.first().cloned() else {
        return Err(ProcessManagerError::InvalidSpec(
            "empty command".to_string(),
        ));
    };
    let rest = tokens[1..].to_vec();

    if let Some(interpreter) = &spec.interpreter {
        let mut args = vec![first];
        args.extend(rest);
        return Ok((interpreter.clone(), args));
    }

    let extension = Path::new(&first)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match extension {
        "ts" | "tsx" | "js" | "jsx" | "mjs" => {
            let mut args = vec!["run".to_string(), first];
            args.extend(rest);
            Ok(("node".to_string(), args))
        }
        "py" => {
            let mut args = vec![first];
            args.extend(rest);
            Ok(("python3".to_string(), args))
        }
        _ => {
            let mut args = vec!["run".to_string(), first];
            args.extend(rest);
            Ok(("node".to_string(), args))
        }
    }
}

fn split_command_line(command: &str) -> Result<Vec<String>, ProcessManagerError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }

    if quote.is_some() {
        return Err(ProcessManagerError::InvalidSpec(format!(
            "unterminated quote in command '{command}'"
        )));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Environment injected into every spawned child, plus cluster-mode additions.
pub fn build_environment(
    spec: &ServiceSpec,
    id: u64,
    name: &str,
    worker_index: Option<u32>,
    instances: u32,
) -> Vec<(String, String)> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(spec.env.clone());

    env.insert("BM2_ID".to_string(), id.to_string());
    env.insert("BM2_NAME".to_string(), name.to_string());
    env.insert(
        "BM2_EXEC_MODE".to_string(),
        match spec.exec_mode {
            crate::config::ExecMode::Fork => "fork".to_string(),
            crate::config::ExecMode::Cluster => "cluster".to_string(),
        },
    );

    if let Some(worker_index) = worker_index {
        env.insert("BM2_CLUSTER".to_string(), "true".to_string());
        env.insert("BM2_WORKER_ID".to_string(), worker_index.to_string());
        env.insert("BM2_INSTANCES".to_string(), instances.to_string());
        env.insert("NODE_APP_INSTANCE".to_string(), worker_index.to_string());
        if let Some(port) = spec.port {
            env.insert("PORT".to_string(), (port as u32 + worker_index).to_string());
        }
    }

    env.into_iter().collect()
}

/// Spawns the OS process described by `spec`, wiring its stdout/stderr into
/// `sink` via piped reader threads, and returns the handle plus raw PID.
pub fn spawn(
    spec: &ServiceSpec,
    id: u64,
    name: &str,
    worker_index: Option<u32>,
    instances: u32,
    sink: &LogSink,
) -> Result<(Child, u32), ProcessManagerError> {
    let (program, args) = resolve_executable(spec)?;
    let mut command = Command::new(&program);
    command.args(&args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    command.env_clear();
    for (key, value) in build_environment(spec, id, name, worker_index, instances) {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| ProcessManagerError::SpawnFailed {
        service: name.to_string(),
        source,
    })?;
    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        sink.spawn_reader(stdout, crate::logs::Stream::Out);
    }
    if let Some(stderr) = child.stderr.take() {
        sink.spawn_reader(stderr, crate::logs::Stream::Err);
    }

    Ok((child, pid))
}

/// Blocks until `child` exits and reports the outcome. Intended to run on a
/// dedicated thread per child; the caller hands the result back to the
/// Supervisor inbox as a `ChildExited` event.
pub fn wait_for_exit(mut child: Child) -> ExitReport {
    match child.wait() {
        Ok(status) => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                ExitReport {
                    exit_code: status.code(),
                    signal: status.signal(),
                }
            }
            #[cfg(not(unix))]
            ExitReport {
                exit_code: status.code(),
                signal: None,
            }
        }
        Err(err) => {
            warn!("failed to wait on child: {err}");
            ExitReport {
                exit_code: None,
                signal: None,
            }
        }
    }
}

/// Enumerates the process tree rooted at `pid` via `/proc/<pid>/task`
/// children links (Linux) or `pgrep -P` (other Unixes), depth-first,
/// root last, and sends `SIGTERM` to each, waiting up to `kill_timeout`
/// for the root to exit before escalating the whole tree to `SIGKILL`.
pub fn tree_kill(pid: u32, treekill: bool, kill_timeout: Duration) -> io::Result<()> {
    let tree = if treekill {
        descendant_pids(pid)
    } else {
        vec![pid]
    };

    for &target in tree.iter().filter(|&&p| p != pid) {
        send_signal(target, Signal::SIGTERM);
    }
    send_signal(pid, Signal::SIGTERM);

    let deadline = Instant::now() + kill_timeout;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }

    for &target in &tree {
        send_signal(target, Signal::SIGKILL);
    }
    Ok(())
}

fn send_signal(pid: u32, sig: Signal) {
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), sig) {
        debug!("signal {sig} to pid {pid} failed: {err}");
    }
}

pub fn process_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(target_os = "linux")]
fn direct_children(pid: u32) -> Vec<u32> {
    let path = format!("/proc/{pid}/task/{pid}/children");
    fs::read_to_string(path)
        .map(|contents| {
            contents
                .split_whitespace()
                .filter_map(|tok| tok.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
fn direct_children(pid: u32) -> Vec<u32> {
    let output = std::process::Command::new("pgrep")
        .arg("-P")
        .arg(pid.to_string())
        .output();
    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .filter_map(|tok| tok.parse().ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Leaves-last (post-order) walk of the process tree rooted at `pid`.
fn descendant_pids(pid: u32) -> Vec<u32> {
    let mut ordered = Vec::new();
    for child in direct_children(pid) {
        ordered.extend(descendant_pids(child));
    }
    ordered.push(pid);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSpec;

    fn spec_with(command: &str, interpreter: Option<&str>) -> ServiceSpec {
        let mut yaml = format!("command: \"{command}\"");
        if let Some(interpreter) = interpreter {
            yaml.push_str(&format!("\ninterpreter: \"{interpreter}\""));
        }
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn resolves_javascript_extensions_to_node_run() {
        let spec = spec_with("server.mjs --port 8080", None);
        let (program, args) = resolve_executable(&spec).unwrap();
        assert_eq!(program, "node");
        assert_eq!(args, vec!["run", "server.mjs", "--port", "8080"]);
    }

    #[test]
    fn resolves_python_extension() {
        let spec = spec_with("worker.py", None);
        let (program, args) = resolve_executable(&spec).unwrap();
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["worker.py"]);
    }

    #[test]
    fn explicit_interpreter_overrides_extension_sniffing() {
        let spec = spec_with("script.py --flag", Some("bun"));
        let (program, args) = resolve_executable(&spec).unwrap();
        assert_eq!(program, "bun");
        assert_eq!(args, vec!["script.py", "--flag"]);
    }

    #[test]
    fn extensionless_commands_default_to_node() {
        let spec = spec_with("/usr/bin/env true", None);
        let (program, args) = resolve_executable(&spec).unwrap();
        assert_eq!(program, "node");
        assert_eq!(args, vec!["run", "/usr/bin/env", "true"]);
    }

    #[test]
    fn quoted_segments_are_kept_intact() {
        let spec = spec_with(r#"echo "hello world""#, None);
        let (program, args) = resolve_executable(&spec).unwrap();
        assert_eq!(program, "echo");
        assert_eq!(args, vec!["hello world"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        let spec = spec_with(" ", None);
        assert!(resolve_executable(&spec).is_err());
    }
}
