//! Unix-domain control channel: newline-delimited JSON request/response
//! framing, the single-instance PID-file guard, and a background accept loop
//! that hands each connection's request to a caller-supplied dispatcher.
//!
//! This module knows nothing about `Supervisor` or `Registry` — it only
//! speaks the wire shape in the external interface. The dispatcher closure
//! (built in `supervisor.rs`/the daemon entrypoint) is what turns a request
//! into a registry operation.
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::runtime;

/// A message sent from a control client to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default)]
    pub data: Value,
    pub id: String,
}

impl IpcRequest {
    pub fn new(request_type: impl Into<String>, data: Value) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = format!(
            "{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            request_type: request_type.into(),
            data,
            id,
        }
    }
}

/// The supervisor's reply. `id` always mirrors the request that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    #[serde(rename = "type")]
    pub response_type: String,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub id: String,
}

impl IpcResponse {
    pub fn ok(request: &IpcRequest, data: Value) -> Self {
        Self {
            response_type: request.request_type.clone(),
            success: true,
            data,
            error: None,
            id: request.id.clone(),
        }
    }

    pub fn err(request: &IpcRequest, message: impl Into<String>) -> Self {
        Self {
            response_type: request.request_type.clone(),
            success: false,
            data: Value::Null,
            error: Some(message.into()),
            id: request.id.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialize control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("control socket not available")]
    NotAvailable,
    #[error("supervisor reported error: {0}")]
    Server(String),
    #[error("another supervisor is already running (pid {0})")]
    AlreadyRunning(u32),
}

/// Sends `request` over the control socket and waits for the matching response.
pub fn send_request(request: &IpcRequest) -> Result<IpcResponse, IpcError> {
    let path = runtime::socket_path();
    if !path.exists() {
        return Err(IpcError::NotAvailable);
    }

    let mut stream = UnixStream::connect(&path)?;
    let payload = serde_json::to_vec(request)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(IpcError::NotAvailable);
    }

    let response: IpcResponse = serde_json::from_str(line.trim())?;
    Ok(response)
}

/// Reads one newline-delimited JSON request from an accepted connection.
pub fn read_request(stream: &mut UnixStream) -> Result<IpcRequest, IpcError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(IpcError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control request",
        )));
    }
    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a single newline-delimited JSON response back to the client.
pub fn write_response(stream: &mut UnixStream, response: &IpcResponse) -> Result<(), IpcError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Persists the daemon's own PID so later invocations can detect it.
pub fn write_pid_file() -> Result<(), IpcError> {
    fs::write(runtime::pid_file_path(), std::process::id().to_string())?;
    Ok(())
}

/// Reads the recorded daemon PID, if the file exists and parses cleanly.
pub fn read_pid_file() -> Option<u32> {
    fs::read_to_string(runtime::pid_file_path())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Removes the socket and PID file. Called on clean shutdown, and to clear
/// stale artefacts left by a crashed previous instance.
pub fn cleanup_runtime() {
    let socket = runtime::socket_path();
    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    let pid_file = runtime::pid_file_path();
    if pid_file.exists() {
        let _ = fs::remove_file(&pid_file);
    }
}

/// Enforces the §4.9 single-instance invariant: if the PID file names a live
/// process *and* that process answers `ping` on the socket, refuse to start.
/// Otherwise any stale socket/PID file is removed and startup proceeds.
pub fn enforce_single_instance() -> Result<(), IpcError> {
    let Some(pid) = read_pid_file() else {
        cleanup_runtime();
        return Ok(());
    };

    if !process_alive(pid) {
        cleanup_runtime();
        return Ok(());
    }

    let ping = IpcRequest::new("ping", Value::Null);
    match send_request(&ping) {
        Ok(response) if response.success => Err(IpcError::AlreadyRunning(pid)),
        _ => {
            cleanup_runtime();
            Ok(())
        }
    }
}

/// Background acceptor: owns the bound socket and hands each connection's
/// request to `dispatch`, writing back whatever it returns.
pub struct IpcServer {
    stop: Arc<AtomicBool>,
}

impl IpcServer {
    pub fn bind<F>(dispatch: F) -> Result<Self, IpcError>
    where
        F: Fn(IpcRequest) -> IpcResponse + Send + Sync + 'static,
    {
        let path = runtime::socket_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let dispatch = Arc::new(dispatch);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);

        thread::spawn(move || {
            loop {
                if stop_clone.load(Ordering::SeqCst) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, _addr)) => {
                        let dispatch = Arc::clone(&dispatch);
                        thread::spawn(move || handle_connection(stream, dispatch));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(err) => {
                        warn!("ipc accept failed: {err}");
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }
        });

        Ok(Self { stop })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        cleanup_runtime();
    }
}

fn handle_connection<F>(mut stream: UnixStream, dispatch: Arc<F>)
where
    F: Fn(IpcRequest) -> IpcResponse + Send + Sync + 'static,
{
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            debug!("failed to read ipc request: {err}");
            return;
        }
    };

    let response = dispatch(request);
    if let Err(err) = write_response(&mut stream, &response) {
        debug!("failed to write ipc response: {err}");
    }
}
