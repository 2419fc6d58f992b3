//! On-disk spool and the drainer that re-uploads it.
//!
//! Artifacts are named by capture time in fractional epoch seconds, zero
//! padded so lexicographic order is chronological:
//!
//! ```text
//! /sdcard/1700000000.250500.tmp   being written
//! /sdcard/1700000000.250500.jpg   complete, waiting for upload
//! ```
//!
//! The rename from `.tmp` to `.jpg` happens only after the data is synced,
//! so the drainer never sees a partial `.jpg`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::sink::PushTransport;
use super::SharedFlag;
use crate::encoder::Observation;
use crate::error::Result;

/// Extension of complete artifacts
pub const SPOOL_EXTENSION: &str = "jpg";

/// Extension of artifacts still being written
pub const TEMP_EXTENSION: &str = "tmp";

/// Uploads between progress log lines
const PROGRESS_EVERY: u64 = 5;

/// File stem for a capture time, e.g. `1700000000.250500`
pub fn artifact_stem(captured_at: DateTime<Utc>) -> String {
    format!("{:017.6}", captured_at.timestamp_micros() as f64 / 1_000_000.0)
}

/// Capture time in epoch seconds recovered from an artifact path
pub fn parse_artifact_time(path: &Path) -> Option<f64> {
    path.file_stem()?.to_str()?.parse::<f64>().ok().filter(|t| t.is_finite())
}

fn is_artifact_name(name: &str) -> bool {
    name.len() > SPOOL_EXTENSION.len() + 1
        && name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(SPOOL_EXTENSION))
}

/// Directory of staged captures
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the spool directory if missing and sweep partial writes
    ///
    /// A `.tmp` file at startup belongs to a write interrupted before its
    /// rename; it is never uploaded, so it is deleted here.
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let mut entries = fs::read_dir(&self.dir).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_temp = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(TEMP_EXTENSION));
            if !is_temp || !entry.file_type().await?.is_file() {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove partial artifact {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("Removed {} partial artifacts from {}", removed, self.dir.display());
        }
        Ok(())
    }

    /// Stage one capture: write to `.tmp`, sync, then rename to `.jpg`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written or renamed; a leftover
    /// `.tmp` is never picked up by the drainer.
    pub async fn write(&self, captured_at: DateTime<Utc>, data: &[u8]) -> Result<PathBuf> {
        let stem = artifact_stem(captured_at);
        let temp = self.dir.join(format!("{}.{}", stem, TEMP_EXTENSION));
        let target = self.dir.join(format!("{}.{}", stem, SPOOL_EXTENSION));

        let mut file = fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &target).await?;
        debug!("Spooled {} ({} bytes)", target.display(), data.len());
        Ok(target)
    }

    /// Complete artifacts in chronological order
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut paths = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_artifact_name(name) && entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }

        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(paths)
    }
}

/// Outcome of one pass over the spool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub found: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Re-uploads spooled captures and deletes them once accepted
pub struct Drainer<T> {
    spool: Spool,
    transport: T,
    path: String,
    max_file_bytes: u64,
    idle: Duration,
    network_up: SharedFlag,
    uploaded_total: u64,
}

impl<T: PushTransport> Drainer<T> {
    /// # Arguments
    ///
    /// * `spool` - Directory to drain
    /// * `transport` - Client owned by the drainer task
    /// * `path` - Upload path, e.g. `/camera`
    /// * `max_file_bytes` - Larger artifacts are left in place
    /// * `idle` - Sleep when a pass uploaded nothing
    /// * `network_up` - Set after every upload outcome
    pub fn new(
        spool: Spool,
        transport: T,
        path: impl Into<String>,
        max_file_bytes: u64,
        idle: Duration,
        network_up: SharedFlag,
    ) -> Self {
        Self {
            spool,
            transport,
            path: path.into(),
            max_file_bytes,
            idle,
            network_up,
            uploaded_total: 0,
        }
    }

    /// Upload every artifact currently in the spool, oldest first
    ///
    /// The pass stops at the first failed upload; the artifact stays for the
    /// next pass.
    pub async fn drain_once(&mut self) -> Result<DrainReport> {
        let paths = self.spool.list().await?;
        let mut report = DrainReport {
            found: paths.len(),
            ..Default::default()
        };

        for path in paths {
            let size = match fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("Cannot stat {}: {}", path.display(), e);
                    report.skipped += 1;
                    continue;
                }
            };

            if size > self.max_file_bytes {
                warn!(
                    "{} is {} bytes, over the {} byte limit; leaving it in place",
                    path.display(),
                    size,
                    self.max_file_bytes
                );
                report.skipped += 1;
                continue;
            }

            let Some(seconds) = parse_artifact_time(&path) else {
                warn!("Cannot parse a capture time from {}", path.display());
                report.skipped += 1;
                continue;
            };

            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!("Cannot read {}: {}", path.display(), e);
                    report.skipped += 1;
                    continue;
                }
            };

            let observation = Observation::new(seconds * 1000.0, None, STANDARD.encode(&data));
            let body = serde_json::to_string(&observation)?;

            if let Err(e) = self.transport.post_json(&self.path, body).await {
                warn!("Upload of {} failed: {}", path.display(), e);
                self.network_up.set(false);
                report.failed += 1;
                break;
            }

            self.network_up.set(true);
            report.uploaded += 1;
            self.uploaded_total += 1;

            if let Err(e) = fs::remove_file(&path).await {
                warn!("Uploaded {} but could not delete it: {}", path.display(), e);
            }

            if self.uploaded_total % PROGRESS_EVERY == 0 {
                info!("Uploaded {} spooled frames", self.uploaded_total);
            }
        }

        Ok(report)
    }

    /// Drain forever, idling between passes that made no progress
    pub async fn run(mut self) -> Result<()> {
        info!("Spool drainer watching {}", self.spool.dir().display());
        loop {
            match self.drain_once().await {
                Ok(report) if report.uploaded > 0 => {
                    debug!("Drain pass: {:?}", report);
                }
                Ok(_) => tokio::time::sleep(self.idle).await,
                Err(e) => {
                    warn!("Drain pass failed: {}", e);
                    tokio::time::sleep(self.idle).await;
                }
            }
        }
    }
}
