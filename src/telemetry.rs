//! Invocation telemetry.
//!
//! One JSON line is appended per handler invocation to `LOG_FILE`. The file
//! is rotated by size into numbered backups (`<path>.1` is the newest), and
//! the newest backup can be gzip-compressed on rotation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

use crate::handlers::{HandlerKind, HandlerResponse};

/// Version of the line layout written by [`TelemetrySink::emit_invocation`].
pub const SCHEMA_VERSION: u32 = 1;

/// Size-based rotation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

/// Appends lines to a file, rotating it once it reaches `max_bytes`.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    rotation: RotationConfig,
}

impl RotatingWriter {
    pub fn open(path: impl AsRef<Path>, rotation: RotationConfig) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            rotation,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.current_size().unwrap_or(0) >= limit {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    /// Path of the `idx`-th backup.
    pub fn backup_path(&self, idx: usize) -> PathBuf {
        let suffix = if self.rotation.compress { ".gz" } else { "" };
        PathBuf::from(format!("{}.{}{}", self.path.display(), idx, suffix))
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        let keep = self.rotation.keep;
        if keep == 0 {
            return self.truncate();
        }
        let _ = fs::remove_file(self.backup_path(keep));
        for idx in (1..keep).rev() {
            let from = self.backup_path(idx);
            if from.exists() {
                fs::rename(&from, self.backup_path(idx + 1))?;
            }
        }
        if self.rotation.compress {
            let data = fs::read(&self.path)?;
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            gz.write_all(&data)?;
            fs::write(self.backup_path(1), gz.finish()?)?;
        } else {
            fs::rename(&self.path, self.backup_path(1))?;
        }
        tracing::debug!(path = %self.path.display(), keep, "telemetry log rotated");
        self.truncate()
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }
}

/// Writes invocation records and counts what was written.
#[derive(Clone, Default)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(writer: Option<RotatingWriter>, log_stdout: bool) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open `path` when set. A file that cannot be opened disables telemetry
    /// with a warning rather than failing startup.
    pub fn from_path(path: Option<&str>, rotation: RotationConfig, log_stdout: bool) -> Self {
        let writer = match path {
            Some(path) => match RotatingWriter::open(path, rotation) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to open LOG_FILE; invocation log disabled");
                    None
                }
            },
            None => {
                tracing::info!("invocation log disabled: LOG_FILE not set");
                None
            }
        };
        Self::new(writer, log_stdout)
    }

    pub fn emit_invocation(&self, handler: HandlerKind, response: &HandlerResponse, latency_ms: u64) {
        let record = json!({
            "schemaVersion": SCHEMA_VERSION,
            "ts": chrono::Utc::now().to_rfc3339(),
            "handler": handler.name(),
            "outcome": response.outcome.as_str(),
            "shape": response.shape,
            "agentChars": response.agent_chars,
            "latencyMs": latency_ms,
        });
        let wrote = self.write(&record.to_string());
        if (wrote || self.writer.is_none()) && self.log_stdout {
            tracing::info!(
                target: "telemetry",
                handler = handler.name(),
                outcome = response.outcome.as_str(),
                shape = response.shape,
                agentChars = response.agent_chars,
                latencyMs = latency_ms,
                "invocation"
            );
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    fn write(&self, line: &str) -> bool {
        let Some(writer) = &self.writer else {
            return false;
        };
        let Ok(mut guard) = writer.lock() else {
            return false;
        };
        match guard.write_line(line) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to write invocation record");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}
