use crate::error::{Result, WardenError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Which standard stream a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn tag(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Result of appending one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// First failure since the file was last healthy
    Degraded(String),
    /// File still unwritable; record discarded
    Dropped,
    /// Written after a period of degradation
    Recovered,
}

/// One append-only log file with an optional rotation boundary
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    file: Option<TokioFile>,
    size: u64,
    max_size: Option<u64>,
    degraded: bool,
}

impl LogFile {
    /// Open (creating if needed) in append mode. Existing content is kept.
    pub async fn open(path: &Path, max_size: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                WardenError::LogError(format!("Failed to create log directory: {}", e))
            })?;
        }

        let (file, size) = Self::open_append(path)
            .map_err(|e| WardenError::LogFileError(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            size,
            max_size,
            degraded: false,
        })
    }

    fn open_append(path: &Path) -> std::io::Result<(TokioFile, u64)> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok((TokioFile::from_std(file), size))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Append a fully formatted record.
    ///
    /// Failures never propagate: the first one is reported as `Degraded`, later
    /// ones drop the record. Each call after a failure retries opening the file.
    pub async fn append(&mut self, record: &[u8]) -> WriteOutcome {
        if self.max_size.map(|max| self.size >= max).unwrap_or(false) {
            self.rotate().await;
        }

        match self.try_append(record).await {
            Ok(()) => {
                self.size += record.len() as u64;
                if self.degraded {
                    self.degraded = false;
                    WriteOutcome::Recovered
                } else {
                    WriteOutcome::Written
                }
            }
            Err(e) => {
                self.file = None;
                if self.degraded {
                    WriteOutcome::Dropped
                } else {
                    self.degraded = true;
                    WriteOutcome::Degraded(format!("{}: {}", self.path.display(), e))
                }
            }
        }
    }

    async fn try_append(&mut self, record: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            let (file, size) = Self::open_append(&self.path)?;
            self.file = Some(file);
            self.size = size;
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all(record).await?;
            file.flush().await?;
        }
        Ok(())
    }

    /// Rename the current file with a timestamp suffix and start a fresh one.
    /// On failure the current file keeps growing.
    async fn rotate(&mut self) {
        let timestamp = Local::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("log")
            .to_string();
        let mut rotated = self.path.with_file_name(format!("{}-{}.log", stem, timestamp));
        let mut suffix = 1;
        while rotated.exists() {
            rotated = self
                .path
                .with_file_name(format!("{}-{}-{}.log", stem, timestamp, suffix));
            suffix += 1;
        }

        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }

        if let Err(e) = tokio::fs::rename(&self.path, &rotated).await {
            warn!("log rotation failed for {}: {}", self.path.display(), e);
        }

        match Self::open_append(&self.path) {
            Ok((file, size)) => {
                self.file = Some(file);
                self.size = size;
            }
            // Left closed; try_append reopens and reports
            Err(e) => warn!("failed to reopen {} after rotation: {}", self.path.display(), e),
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()
                .await
                .map_err(|e| WardenError::LogError(format!("Failed to flush log: {}", e)))?;
        }
        Ok(())
    }
}

/// Paired stdout/stderr destinations, shared by every drain across restarts
#[derive(Debug, Clone)]
pub struct LogSink {
    stdout: Arc<Mutex<LogFile>>,
    stderr: Arc<Mutex<LogFile>>,
    date_format: Arc<str>,
}

impl LogSink {
    /// Open both files in append mode
    ///
    /// # Arguments
    /// * `out_path` - Stdout log file
    /// * `err_path` - Stderr log file
    /// * `date_format` - chrono strftime format for record timestamps
    /// * `max_size` - Optional rotation boundary in bytes
    pub async fn open(
        out_path: &Path,
        err_path: &Path,
        date_format: &str,
        max_size: Option<u64>,
    ) -> Result<Self> {
        let stdout = LogFile::open(out_path, max_size).await?;
        let stderr = LogFile::open(err_path, max_size).await?;

        Ok(Self {
            stdout: Arc::new(Mutex::new(stdout)),
            stderr: Arc::new(Mutex::new(stderr)),
            date_format: Arc::from(date_format),
        })
    }

    fn file(&self, stream: StreamKind) -> &Arc<Mutex<LogFile>> {
        match stream {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    /// Timestamp and append one line (trailing newline optional)
    pub async fn write_line(&self, stream: StreamKind, line: &[u8]) -> WriteOutcome {
        let record = format_record(&Local::now(), &self.date_format, stream, line);
        self.file(stream).lock().await.append(&record).await
    }

    pub async fn path(&self, stream: StreamKind) -> PathBuf {
        self.file(stream).lock().await.path().to_path_buf()
    }

    pub async fn flush(&self) -> Result<()> {
        self.stdout.lock().await.flush().await?;
        self.stderr.lock().await.flush().await
    }
}

/// Format: `<timestamp> <stream-tag> <line>\n`
pub fn format_record(
    timestamp: &DateTime<Local>,
    date_format: &str,
    stream: StreamKind,
    line: &[u8],
) -> Vec<u8> {
    let prefix = format!("{} {} ", timestamp.format(date_format), stream.tag());

    let body = line.strip_suffix(b"\n").unwrap_or(line);
    let body = body.strip_suffix(b"\r").unwrap_or(body);

    let mut record = Vec::with_capacity(prefix.len() + body.len() + 1);
    record.extend_from_slice(prefix.as_bytes());
    record.extend_from_slice(body);
    record.push(b'\n');
    record
}
