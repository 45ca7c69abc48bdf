//! Serial background-writer-thread JSONL file: a dedicated thread per file
//! drains an mpsc queue of append commands so concurrent callers never
//! interleave partial lines. The channel payload is a JSON-serialized
//! record, and a writer may optionally bound itself to the last `retention`
//! lines by rewriting the file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

const DEFAULT_QUEUE_CAPACITY: usize = 2048;
const FLUSH_WAIT_TIMEOUT_MS: u64 = 200;

enum Command {
    Append { line: String, ack: Option<SyncSender<()>> },
    ResetPath(PathBuf),
}

/// Reads every line of `path`, skipping lines that fail to parse as JSON
/// (malformed lines are tolerated, per the trace-log read contract).
pub(super) fn read_tolerant(path: &Path) -> Vec<String> {
    let Ok(file) = File::open(path) else { return Vec::new() };
    BufReader::new(file)
        .lines()
        .filter_map(|line| line.ok())
        .filter(|line| !line.trim().is_empty())
        .filter(|line| serde_json::from_str::<serde_json::Value>(line).is_ok())
        .collect()
}

struct FileWriter {
    path: PathBuf,
    retention: Option<usize>,
    lines: Vec<String>,
    append_handle: Option<BufWriter<File>>,
}

impl FileWriter {
    fn new(path: PathBuf, retention: Option<usize>) -> Self {
        let lines = match retention {
            Some(max) => {
                let mut preloaded = read_tolerant(&path);
                if preloaded.len() > max {
                    let drop_count = preloaded.len() - max;
                    preloaded.drain(0..drop_count);
                }
                preloaded
            }
            None => Vec::new(),
        };
        Self { path, retention, lines, append_handle: None }
    }

    fn append(&mut self, line: String) -> io::Result<()> {
        match self.retention {
            Some(max) => {
                self.lines.push(line);
                if self.lines.len() > max {
                    let drop_count = self.lines.len() - max;
                    self.lines.drain(0..drop_count);
                }
                self.rewrite()
            }
            None => self.append_only(&line),
        }
    }

    fn rewrite(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut body = self.lines.join("\n");
        if !self.lines.is_empty() {
            body.push('\n');
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, body)?;
        fs::rename(&tmp_path, &self.path)
    }

    fn reset_path(&mut self, next_path: PathBuf) {
        if self.path == next_path {
            return;
        }
        self.path = next_path;
        self.append_handle = None;
        if self.retention.is_some() {
            let mut preloaded = read_tolerant(&self.path);
            if let Some(max) = self.retention {
                if preloaded.len() > max {
                    let drop_count = preloaded.len() - max;
                    preloaded.drain(0..drop_count);
                }
            }
            self.lines = preloaded;
        }
    }

    fn append_only(&mut self, line: &str) -> io::Result<()> {
        if self.append_handle.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.append_handle = Some(BufWriter::new(file));
        }
        let writer = self.append_handle.as_mut().expect("append handle just initialized");
        writeln!(writer, "{line}")?;
        writer.flush()
    }
}

fn writer_loop(rx: Receiver<Command>, mut writer: FileWriter) {
    while let Ok(command) = rx.recv() {
        match command {
            Command::Append { line, ack } => {
                if let Err(err) = writer.append(line) {
                    log::warn!("trace log write failed: path={}, err={}", writer.path.display(), err);
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Command::ResetPath(path) => writer.reset_path(path),
        }
    }
}

/// A named async JSONL writer backed by one dedicated background thread.
pub(super) struct AsyncJsonlWriter {
    tx: SyncSender<Command>,
    dropped: AtomicU64,
}

impl AsyncJsonlWriter {
    pub(super) fn spawn(name: &'static str, path: PathBuf, retention: Option<usize>) -> Self {
        let (tx, rx) = mpsc::sync_channel::<Command>(DEFAULT_QUEUE_CAPACITY);
        let writer = FileWriter::new(path, retention);
        let _ = thread::Builder::new().name(name.to_string()).spawn(move || writer_loop(rx, writer));
        Self { tx, dropped: AtomicU64::new(0) }
    }

    /// Enqueues a line, dropping it (with a throttled warning) if the queue
    /// is full rather than blocking the caller.
    pub(super) fn append(&self, line: String) {
        match self.tx.try_send(Command::Append { line, ack: None }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1024 == 0 {
                    log::warn!("trace queue full; dropped_lines={}", dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("trace enqueue failed: writer channel closed");
            }
        }
    }

    /// Enqueues a line and waits (bounded) for the write to complete.
    pub(super) fn append_and_wait(&self, line: String) {
        let (ack_tx, ack_rx) = mpsc::sync_channel(0);
        if self.tx.send(Command::Append { line, ack: Some(ack_tx) }).is_err() {
            log::warn!("trace enqueue failed: writer channel closed");
            return;
        }
        let _ = ack_rx.recv_timeout(Duration::from_millis(FLUSH_WAIT_TIMEOUT_MS));
    }

    pub(super) fn reset_path(&self, path: PathBuf) {
        if self.tx.send(Command::ResetPath(path)).is_err() {
            log::warn!("trace reset-path failed: writer channel closed");
        }
    }
}
