use std::{
    error::Error,
    fs,
    os::unix::io::IntoRawFd,
    path::{Path, PathBuf},
    sync::mpsc,
};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bm2::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    ipc::{self, IpcRequest, IpcServer},
    runtime,
    supervisor::{self, Supervisor, SupervisorEvent},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    runtime::init();
    init_logging(&args);

    match args.command {
        Commands::Start { config, daemonize } => {
            let config_path = resolve_config_path(&config);
            if daemonize {
                daemonize_process()?;
            }
            run_daemon(&config_path)?;
        }
        Commands::Stop => stop_daemon()?,
        Commands::Purge => purge_state()?,
    }

    Ok(())
}

/// Boots the supervisor in this process: loads the config, binds the control
/// socket, starts every configured service, and blocks until a `kill` event
/// (via IPC or a delivered termination signal) tears it down.
fn run_daemon(config_path: &Path) -> Result<(), Box<dyn Error>> {
    ipc::enforce_single_instance()?;
    runtime::ensure_directories()?;
    ipc::write_pid_file()?;

    let config = load_config(config_path)?;
    let project_dir = config.project_dir.clone();
    let (mut sup, sender) = Supervisor::new(project_dir);

    let ipc_sender = sender.clone();
    let _server = IpcServer::bind(move |request| supervisor::dispatch(request, &ipc_sender))?;

    register_signal_handler(sender.clone());

    for (name, spec) in config.services {
        let (tx, rx) = mpsc::channel();
        if sender
            .send(SupervisorEvent::Start { name: name.clone(), spec, reply: tx })
            .is_ok()
        {
            match rx.recv() {
                Ok(Ok(_)) => info!("started '{name}'"),
                Ok(Err(err)) => warn!("'{name}' failed to start: {err}"),
                Err(_) => warn!("'{name}' start request lost: inbox closed before replying"),
            }
        }
    }

    sup.run();
    Ok(())
}

/// Drives a graceful shutdown of a resident daemon over the control socket.
fn stop_daemon() -> Result<(), Box<dyn Error>> {
    let request = IpcRequest::new("kill", serde_json::Value::Null);
    match ipc::send_request(&request) {
        Ok(response) if response.success => {
            info!("supervisor stopped");
            Ok(())
        }
        Ok(response) => Err(response.error.unwrap_or_else(|| "unknown error".to_string()).into()),
        Err(ipc::IpcError::NotAvailable) => {
            warn!("no running supervisor found");
            ipc::cleanup_runtime();
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Removes the daemon's on-disk state. Refuses while a supervisor answers on
/// the control socket.
fn purge_state() -> Result<(), Box<dyn Error>> {
    let ping = IpcRequest::new("ping", serde_json::Value::Null);
    if let Ok(response) = ipc::send_request(&ping) {
        if response.success {
            return Err("refusing to purge while a supervisor is running; stop it first".into());
        }
    }

    let root = runtime::root_dir();
    if root.exists() {
        fs::remove_dir_all(&root)?;
        println!("removed {}", root.display());
    } else {
        println!("nothing to purge at {}", root.display());
    }
    Ok(())
}

fn resolve_config_path(path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        std::env::current_dir().map(|cwd| cwd.join(&candidate)).unwrap_or(candidate)
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let log_dir = runtime::log_dir();
    if let Err(err) = fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory {log_dir:?}: {err}");
    }
    let log_path = log_dir.join("supervisor.log");

    let file = match fs::OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open supervisor log file {log_path:?}: {err}");
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || file.try_clone().unwrap())
        .with_ansi(false)
        .try_init();
}

/// Double-forks into the background, matching the teacher's daemonization
/// sequence: detach the session, reparent to init, and redirect the standard
/// streams to `/dev/null`.
fn daemonize_process() -> std::io::Result<()> {
    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }
    unsafe {
        libc::setsid();
    }
    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = fs::File::open("/dev/null")?;
    let fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }
    Ok(())
}

/// Routes SIGINT/SIGTERM through the same `kill` path an IPC client would
/// use, so shutdown always goes through the inbox rather than a bare exit.
fn register_signal_handler(sender: mpsc::Sender<SupervisorEvent>) {
    let _ = ctrlc::set_handler(move || {
        info!("received termination signal, shutting down");
        supervisor::request_shutdown(&sender);
        std::process::exit(0);
    });
}
