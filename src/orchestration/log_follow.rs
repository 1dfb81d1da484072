//! # Log Following
//!
//! Tails a log file that another process is writing while an operation is in
//! flight, forwarding complete lines to the structured logger. The follower
//! only reads; it never touches shared orchestration state.

use crate::error::{ControlError, ControlResult};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a follower saw before it stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowReport {
    pub lines: Vec<String>,
    pub bytes_read: u64,
}

/// Background tail of one file
#[derive(Debug)]
pub struct LogFollower {
    path: PathBuf,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<ControlResult<FollowReport>>>,
}

impl LogFollower {
    /// Follow lines appended after the file's current end.
    ///
    /// A file that does not exist yet is read from its start once it appears.
    pub async fn start(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        let path = path.into();
        let offset = tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        Self::start_at(path, label, offset)
    }

    /// Follow from a byte offset
    pub fn start_at(path: impl Into<PathBuf>, label: impl Into<String>, offset: u64) -> Self {
        let path = path.into();
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(follow(path.clone(), label.into(), offset, stop_rx));
        Self {
            path,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read whatever is left, close the file and return what was seen.
    ///
    /// A trailing line without a newline is reported here and only here.
    pub async fn stop(mut self) -> ControlResult<FollowReport> {
        if let Some(stop_tx) = self.stop_tx.take() {
            // The task may already be gone if it failed
            let _ = stop_tx.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.await.map_err(|e| {
                ControlError::system(format!(
                    "log follower for {} panicked: {e}",
                    self.path.display()
                ))
            })?,
            None => Ok(FollowReport::default()),
        }
    }
}

impl Drop for LogFollower {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Run `operation` while following `path`; the follower is stopped on every path
pub async fn follow_during<T, Fut>(
    path: impl Into<PathBuf>,
    label: impl Into<String>,
    operation: Fut,
) -> (ControlResult<T>, FollowReport)
where
    Fut: Future<Output = ControlResult<T>>,
{
    let follower = LogFollower::start(path, label).await;
    let result = operation.await;
    let report = match follower.stop().await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "log follower failed");
            FollowReport::default()
        }
    };
    (result, report)
}

struct Tail {
    label: String,
    pending: Vec<u8>,
    report: FollowReport,
}

impl Tail {
    fn feed(&mut self, chunk: &[u8]) {
        self.report.bytes_read += chunk.len() as u64;
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&raw[..raw.len() - 1]);
        }
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            self.emit(&raw);
        }
    }

    fn emit(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw)
            .trim_end_matches('\r')
            .to_string();
        info!(target: "pgcontrol::logs", source = %self.label, "{line}");
        self.report.lines.push(line);
    }
}

async fn open_at(path: &Path, offset: u64) -> std::io::Result<Option<File>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(Some(file))
}

async fn follow(
    path: PathBuf,
    label: String,
    offset: u64,
    mut stop_rx: oneshot::Receiver<()>,
) -> ControlResult<FollowReport> {
    let mut tail = Tail {
        label,
        pending: Vec::new(),
        report: FollowReport::default(),
    };
    let io_err = |e: std::io::Error| ControlError::io(&path, e);

    let mut file = open_at(&path, offset).await.map_err(io_err)?;
    let mut buf = Vec::with_capacity(8 * 1024);

    loop {
        let stopping = tokio::select! {
            _ = &mut stop_rx => true,
            _ = tokio::time::sleep(POLL_INTERVAL) => false,
        };

        if file.is_none() {
            file = open_at(&path, offset).await.map_err(io_err)?;
        }
        if let Some(f) = file.as_mut() {
            buf.clear();
            f.read_to_end(&mut buf).await.map_err(io_err)?;
            if !buf.is_empty() {
                tail.feed(&buf);
            }
        }

        if stopping {
            break;
        }
    }

    tail.flush();
    drop(file);
    debug!(
        path = %path.display(),
        lines = tail.report.lines.len(),
        bytes = tail.report.bytes_read,
        "log follower stopped"
    );
    Ok(tail.report)
}
