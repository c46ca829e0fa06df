//! Background log tailing: one worker per log source, each owning its
//! `TailState` and publishing a `TailSnapshot` after every tick that changed
//! something.

mod decode;
mod selection;

pub use decode::{decode_line, truncate_str, TRUNCATION_MARKER};
pub use selection::{pick_newest, select_latest, Candidate};

use crate::engine::published::Published;
use crate::error::{ErrorRecord, LogError};
use crate::model::{LogSpec, TextEncoding};
use crate::services::ipc::IpcClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

/// Bytes read from a file per tick; a larger append is consumed over several ticks.
pub const MAX_READ_PER_TICK: u64 = 4 * 1024 * 1024;
/// How far back from the end the first selection looks for `tailLines` lines.
pub const MAX_SEED_BYTES: u64 = 2 * 1024 * 1024;

/// Bounded line buffer, oldest evicted first.
#[derive(Debug, Clone)]
pub struct LineRing {
    lines: VecDeque<String>,
    capacity: usize,
    // bumped on every push so publishers can tell whether anything changed
    revision: u64,
}

impl LineRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
            revision: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
        self.revision += 1;
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Fingerprint of the file being tailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub inode: Option<u64>,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FileIdentity {
    fn from_metadata(path: PathBuf, meta: &Metadata) -> Self {
        #[cfg(unix)]
        let inode = {
            use std::os::unix::fs::MetadataExt;
            Some(meta.ino())
        };
        #[cfg(not(unix))]
        let inode = None;
        Self {
            path,
            inode,
            size: meta.len(),
            modified: meta.modified().ok(),
        }
    }

    /// Same path and, where known, same inode. Size and mtime are expected to move.
    pub fn same_file(&self, other: &FileIdentity) -> bool {
        self.path == other.path && self.inode == other.inode
    }
}

/// Read position within the currently selected file.
#[derive(Debug, Default)]
pub struct TailState {
    pub file: Option<FileIdentity>,
    pub cursor: u64,
    // bytes of an unterminated trailing line
    pending: Vec<u8>,
    // the pending line already went out truncated; drop the rest of it
    skipping: bool,
    seeded: bool,
}

/// One source of new log lines, polled by the worker.
pub trait TailSource: Send {
    fn poll(&mut self, ring: &mut LineRing) -> Result<(), LogError>;
    fn active_path(&self) -> Option<&Path>;
}

/// Tails the newest file matching a glob.
pub struct FileTail {
    spec: LogSpec,
    state: TailState,
}

impl FileTail {
    pub fn new(spec: LogSpec) -> Self {
        Self {
            spec,
            state: TailState::default(),
        }
    }

    pub fn state(&self) -> &TailState {
        &self.state
    }

    fn io_error(path: &Path, e: std::io::Error) -> LogError {
        LogError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }

    // First selection: start near the end so only the last tailLines lines show
    fn seed(&mut self, ident: FileIdentity, ring: &mut LineRing) -> Result<(), LogError> {
        let start = ident.size.saturating_sub(MAX_SEED_BYTES);
        let mut buf = Vec::new();
        let mut file = File::open(&ident.path).map_err(|e| Self::io_error(&ident.path, e))?;
        file.seek(SeekFrom::Start(start))
            .and_then(|_| (&mut file).take(ident.size - start).read_to_end(&mut buf))
            .map_err(|e| Self::io_error(&ident.path, e))?;

        let mut body: &[u8] = &buf;
        if start == 0 && self.spec.encoding == TextEncoding::Utf8 {
            body = decode::strip_bom(body);
        } else if start > 0 {
            // began mid-line; drop the fragment
            body = match body.iter().position(|&b| b == b'\n') {
                Some(i) => &body[i + 1..],
                None => &[],
            };
        }
        let (complete, rest) = match body.iter().rposition(|&b| b == b'\n') {
            Some(i) => (Some(&body[..i]), &body[i + 1..]),
            None => (None, body),
        };
        if let Some(complete) = complete {
            let lines: Vec<&[u8]> = complete.split(|&b| b == b'\n').collect();
            let skip = lines.len().saturating_sub(self.spec.tail_lines);
            for raw in &lines[skip..] {
                ring.push(decode_line(raw, self.spec.encoding, self.spec.max_line_bytes));
            }
        }
        self.state.pending = rest.to_vec();
        self.state.skipping = false;
        self.state.cursor = ident.size;
        self.state.file = Some(ident);
        self.state.seeded = true;
        self.flush_overlong(ring);
        Ok(())
    }

    fn switch_to(&mut self, ident: FileIdentity) {
        tracing::info!(
            stream = %self.spec.stream,
            path = %ident.path.display(),
            "log rotated; following new file"
        );
        self.state.file = Some(ident);
        self.state.cursor = 0;
        self.state.pending.clear();
        self.state.skipping = false;
    }

    fn read_forward(&mut self, ring: &mut LineRing) -> Result<(), LogError> {
        let Some(ident) = self.state.file.as_ref() else {
            return Ok(());
        };
        let path = ident.path.clone();
        if ident.size <= self.state.cursor {
            return Ok(());
        }
        let start = self.state.cursor;
        let mut buf = Vec::new();
        let mut file = File::open(&path).map_err(|e| Self::io_error(&path, e))?;
        file.seek(SeekFrom::Start(start))
            .and_then(|_| (&mut file).take(MAX_READ_PER_TICK).read_to_end(&mut buf))
            .map_err(|e| Self::io_error(&path, e))?;
        self.state.cursor += buf.len() as u64;

        let chunk: &[u8] = if start == 0 && self.spec.encoding == TextEncoding::Utf8 {
            decode::strip_bom(&buf)
        } else {
            &buf
        };
        for piece in chunk.split_inclusive(|&b| b == b'\n') {
            match piece.strip_suffix(b"\n") {
                Some(tail) => {
                    if self.state.skipping {
                        self.state.skipping = false;
                        self.state.pending.clear();
                        continue;
                    }
                    self.state.pending.extend_from_slice(tail);
                    let raw = std::mem::take(&mut self.state.pending);
                    ring.push(decode_line(&raw, self.spec.encoding, self.spec.max_line_bytes));
                }
                None => {
                    if !self.state.skipping {
                        self.state.pending.extend_from_slice(piece);
                    }
                }
            }
        }
        self.flush_overlong(ring);
        Ok(())
    }

    // An unterminated line past the limit goes out now, truncated
    fn flush_overlong(&mut self, ring: &mut LineRing) {
        if !self.state.skipping && self.state.pending.len() > self.spec.max_line_bytes {
            let raw = std::mem::take(&mut self.state.pending);
            ring.push(decode_line(&raw, self.spec.encoding, self.spec.max_line_bytes));
            self.state.skipping = true;
        }
    }
}

impl TailSource for FileTail {
    fn poll(&mut self, ring: &mut LineRing) -> Result<(), LogError> {
        let Some(path) = select_latest(&self.spec.glob)? else {
            self.state.file = None;
            if self.spec.allow_missing {
                return Ok(());
            }
            return Err(LogError::Missing {
                glob: self.spec.glob.clone(),
            });
        };
        let meta = fs::metadata(&path).map_err(|e| Self::io_error(&path, e))?;
        let ident = FileIdentity::from_metadata(path, &meta);

        let same = self.state.file.as_ref().map(|current| current.same_file(&ident));
        match same {
            None if !self.state.seeded => return self.seed(ident, ring),
            Some(true) => {
                if ident.size < self.state.cursor {
                    tracing::info!(
                        stream = %self.spec.stream,
                        path = %ident.path.display(),
                        "log truncated; reading from start"
                    );
                    self.state.cursor = 0;
                    self.state.pending.clear();
                    self.state.skipping = false;
                }
                self.state.file = Some(ident);
            }
            // a different file, or one that came back after going missing
            _ => self.switch_to(ident),
        }
        self.read_forward(ring)
    }

    fn active_path(&self) -> Option<&Path> {
        self.state.file.as_ref().map(|f| f.path.as_path())
    }
}

/// Tails a stream exposed by the target over IPC.
pub struct IpcTail {
    client: Arc<IpcClient>,
    stream: String,
    max_line_bytes: usize,
    cursor: u64,
}

impl IpcTail {
    pub fn new(client: Arc<IpcClient>, stream: &str, max_line_bytes: usize) -> Self {
        Self {
            client,
            stream: stream.to_string(),
            max_line_bytes,
            cursor: 0,
        }
    }
}

impl TailSource for IpcTail {
    fn poll(&mut self, ring: &mut LineRing) -> Result<(), LogError> {
        let tail = self
            .client
            .get_log_tail(&self.stream, self.cursor)
            .map_err(|e| LogError::Transport(e.to_string()))?;
        for line in &tail.lines {
            ring.push(truncate_str(line, self.max_line_bytes));
        }
        self.cursor = tail.next_cursor;
        Ok(())
    }

    fn active_path(&self) -> Option<&Path> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TailSnapshot {
    pub target_id: String,
    pub stream: String,
    pub path: Option<PathBuf>,
    pub lines: Vec<String>,
    pub error: Option<ErrorRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Worker thread driving one `TailSource`. Stops and joins on drop.
pub struct LogTailer {
    target_id: String,
    stream: String,
    cell: Arc<Published<TailSnapshot>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LogTailer {
    pub fn start(target_id: &str, spec: &LogSpec, mut source: Box<dyn TailSource>) -> Self {
        let cell = Arc::new(Published::new(TailSnapshot {
            target_id: target_id.to_string(),
            stream: spec.stream.clone(),
            path: None,
            lines: vec![],
            error: None,
            updated_at: None,
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let interval = spec.poll_interval();
        let capacity = spec.tail_lines;
        let worker_cell = Arc::clone(&cell);
        let worker_stop = Arc::clone(&stop);
        let stream = spec.stream.clone();
        let id = target_id.to_string();
        let handle = thread::Builder::new()
            .name(format!("tail-{target_id}-{}", spec.stream))
            .spawn(move || {
                tracing::info!(target_id = %id, %stream, "log tailer started");
                let mut ring = LineRing::new(capacity);
                let mut last_error: Option<LogError> = None;
                let mut published_rev = 0u64;
                let mut published_path: Option<PathBuf> = None;
                while !worker_stop.load(Ordering::SeqCst) {
                    let result = source.poll(&mut ring);
                    let error = result.err();
                    if let Some(e) = &error {
                        if last_error.as_ref() != Some(e) {
                            tracing::warn!(target_id = %id, %stream, error = %e, "log tail problem");
                        }
                    }
                    let path = source.active_path().map(Path::to_path_buf);
                    let changed = ring.revision() != published_rev
                        || path != published_path
                        || error != last_error;
                    if changed {
                        let record = error.as_ref().map(|e| ErrorRecord::now(e.to_string()));
                        worker_cell.update(|snap| {
                            snap.path = path.clone();
                            snap.lines = ring.to_vec();
                            snap.error = record;
                            snap.updated_at = Some(Utc::now());
                        });
                        published_rev = ring.revision();
                        published_path = path;
                    }
                    last_error = error;
                    sleep_unless_stopped(interval, &worker_stop);
                }
                tracing::info!(target_id = %id, %stream, "log tailer stopped");
            })
            .ok();
        if handle.is_none() {
            tracing::error!(target_id, stream = %spec.stream, "could not spawn log tailer thread");
        }
        Self {
            target_id: target_id.to_string(),
            stream: spec.stream.clone(),
            cell,
            stop,
            handle,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn snapshot(&self) -> Arc<TailSnapshot> {
        self.cell.snapshot()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop();
    }
}

// Sleep in short steps so a stop request is noticed quickly
fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < total {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let d = step.min(total - waited);
        thread::sleep(d);
        waited += d;
    }
}
