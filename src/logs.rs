//! Per-service log capture: buffered append-only writers, debounced flush,
//! and crash-safe rotation with optional gzip compression of old segments.
use std::{
    collections::{HashMap, VecDeque},
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Write},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use flate2::{Compression, write::GzEncoder};
use tracing::{debug, warn};

use crate::{config::LogRotationConfig, constants, runtime};

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Out,
    Err,
}

impl Stream {
    fn as_str(&self) -> &'static str {
        match self {
            Stream::Out => "out",
            Stream::Err => "err",
        }
    }
}

/// Path to the active log file for `(name, id, stream)`.
pub fn log_path(name: &str, id: u64, stream: Stream) -> PathBuf {
    runtime::log_dir().join(format!("{name}-{id}-{}.log", stream.as_str()))
}

fn rotated_path(base: &PathBuf, index: usize, compressed: bool) -> PathBuf {
    let mut path = base.clone();
    let mut extension = format!(".{index}");
    if compressed {
        extension.push_str(".gz");
    }
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(extension);
    path.set_file_name(name);
    path
}

struct Writer {
    path: PathBuf,
    queue: VecDeque<String>,
}

/// Append-only, debounced, rotating writer pair for one service's stdout/stderr.
pub struct LogSink {
    name: String,
    id: u64,
    rotation: LogRotationConfig,
    writers: Arc<Mutex<HashMap<&'static str, Writer>>>,
    stop: Arc<AtomicBool>,
}

impl LogSink {
    pub fn new(name: &str, id: u64, rotation: LogRotationConfig) -> Self {
        let mut writers = HashMap::new();
        writers.insert(
            "out",
            Writer {
                path: log_path(name, id, Stream::Out),
                queue: VecDeque::new(),
            },
        );
        writers.insert(
            "err",
            Writer {
                path: log_path(name, id, Stream::Err),
                queue: VecDeque::new(),
            },
        );

        let sink = Self {
            name: name.to_string(),
            id,
            rotation,
            writers: Arc::new(Mutex::new(writers)),
            stop: Arc::new(AtomicBool::new(false)),
        };
        sink.spawn_background_loop();
        sink
    }

    fn spawn_background_loop(&self) {
        let writers = Arc::clone(&self.writers);
        let stop = Arc::clone(&self.stop);
        let rotation = self.rotation.clone();
        let name = self.name.clone();

        thread::spawn(move || {
            let mut last_rotation_check = Instant::now();
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(constants::LOG_FLUSH_DEBOUNCE);
                flush_queues(&writers, &name);

                if last_rotation_check.elapsed() >= constants::LOG_ROTATION_CHECK_INTERVAL {
                    last_rotation_check = Instant::now();
                    check_rotation(&writers, &rotation, &name);
                }
            }
        });
    }

    /// Spawns a thread that reads `reader` line by line, decorates each line
    /// with an ISO-8601 timestamp, and enqueues it for the next debounced flush.
    pub fn spawn_reader(&self, reader: impl Read + Send + 'static, stream: Stream) {
        let writers = Arc::clone(&self.writers);
        let key = match stream {
            Stream::Out => "out",
            Stream::Err => "err",
        };

        thread::spawn(move || {
            let reader = BufReader::new(reader);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let decorated = format!("[{}] {line}", format_timestamp(SystemTime::now()));
                if let Ok(mut guard) = writers.lock()
                    && let Some(writer) = guard.get_mut(key)
                {
                    writer.queue.push_back(decorated);
                }
            }
        });
    }

    /// Truncates both active log files without rotating. Matches `Flush(target)`.
    pub fn truncate(&self) -> io::Result<()> {
        let guard = self.writers.lock().expect("log writer lock poisoned");
        for writer in guard.values() {
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .create(true)
                .open(&writer.path)?;
        }
        Ok(())
    }

    /// Returns the last `n` newline-separated lines from disk for each stream.
    pub fn tail(&self, n: usize) -> (Vec<String>, Vec<String>) {
        let out = tail_file(&log_path(&self.name, self.id, Stream::Out), n);
        let err = tail_file(&log_path(&self.name, self.id, Stream::Err), n);
        (out, err)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        flush_queues(&self.writers, &self.name);
    }
}

fn format_timestamp(time: SystemTime) -> String {
    let datetime: chrono::DateTime<chrono::Utc> = time.into();
    datetime.format(constants::LOG_TIMESTAMP_FORMAT).to_string()
}

fn flush_queues(writers: &Arc<Mutex<HashMap<&'static str, Writer>>>, name: &str) {
    let mut guard = match writers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    for writer in guard.values_mut() {
        if writer.queue.is_empty() {
            continue;
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&writer.path)
        {
            Ok(mut file) => {
                for line in writer.queue.drain(..) {
                    if let Err(err) = writeln!(file, "{line}") {
                        warn!("failed to write log line for '{name}': {err}");
                        break;
                    }
                }
            }
            Err(err) => warn!("failed to open log file for '{name}': {err}"),
        }
    }
}

fn check_rotation(
    writers: &Arc<Mutex<HashMap<&'static str, Writer>>>,
    rotation: &LogRotationConfig,
    name: &str,
) {
    let guard = writers.lock().expect("log writer lock poisoned");
    for writer in guard.values() {
        let size = fs::metadata(&writer.path).map(|m| m.len()).unwrap_or(0);
        if size >= rotation.max_bytes.0 {
            if let Err(err) = rotate_one(&writer.path, rotation) {
                warn!("log rotation failed for '{name}': {err}");
            }
        }
    }
}

/// Crash-safe rename-chain rotation: renames happen before truncation, so a
/// crash mid-rotation leaves at worst one extra rotated segment, never a hole.
fn rotate_one(path: &PathBuf, rotation: &LogRotationConfig) -> io::Result<()> {
    let retain = rotation.retain;
    if retain == 0 {
        return truncate_in_place(path);
    }

    let oldest = rotated_path(path, retain, rotation.compress);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    for index in (1..retain).rev() {
        let from = rotated_path(path, index, rotation.compress);
        let to = rotated_path(path, index + 1, rotation.compress);
        if from.exists() {
            fs::rename(from, to)?;
        }
    }

    let first_rotated = rotated_path(path, 1, false);
    fs::rename(path, &first_rotated)?;

    if rotation.compress {
        gzip_in_place(&first_rotated)?;
    }

    truncate_in_place(path)
}

fn truncate_in_place(path: &PathBuf) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(path)?;
    Ok(())
}

fn gzip_in_place(path: &PathBuf) -> io::Result<()> {
    let data = fs::read(path)?;
    let compressed_path = {
        let mut p = path.clone();
        let mut name = p.file_name().unwrap_or_default().to_os_string();
        name.push(".gz");
        p.set_file_name(name);
        p
    };

    let file = File::create(&compressed_path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

fn tail_file(path: &PathBuf, n: usize) -> Vec<String> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    let reader = BufReader::new(file);
    let mut ring: VecDeque<String> = VecDeque::with_capacity(n + 1);
    for line in reader.lines().map_while(Result::ok) {
        if ring.len() == n {
            ring.pop_front();
        }
        ring.push_back(line);
    }
    ring.into_iter().collect()
}
