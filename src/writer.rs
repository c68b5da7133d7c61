//! Batch writer: chunked, single-target output through a `RowEncoder`.

use crate::codec::{RowCodec, RowEncoder};
use crate::error::MergeError;
use crate::governor::{ErrorGovernor, ErrorRecord, Phase};
use crate::mem::MemoryGuard;
use crate::progress::{ProgressReporter, Stage};
use crate::util::replace_file_atomic_backoff;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_WRITE_CHUNK: usize = 5000;

/// Chunk size for a known row total: bigger outputs get bigger chunks,
/// never smaller than `configured`.
pub fn tuned_chunk_size(configured: usize, total_rows: u64) -> usize {
    let configured = if configured > 0 { configured } else { DEFAULT_WRITE_CHUNK };
    let floor = if total_rows >= 1_000_000 {
        20_000
    } else if total_rows >= 100_000 {
        10_000
    } else {
        0
    };
    configured.max(floor)
}

pub struct BatchWriter<T> {
    job_id: String,
    path: PathBuf,
    encoder: Option<Box<dyn RowEncoder<T>>>,
    chunk_size: usize,
    governor: Arc<ErrorGovernor<T>>,
    progress: Arc<ProgressReporter>,
    memory: Option<Arc<MemoryGuard>>,
    expected_total: u64,
    rows_written: u64,
    chunks_written: u64,
    chunks_failed: u64,
    started: Instant,
    finished_at: Option<Instant>,
}

impl<T: Clone + Send + Sync> BatchWriter<T> {
    pub fn create(
        job_id: impl Into<String>,
        codec: &dyn RowCodec<T>,
        path: &Path,
        chunk_size: usize,
        governor: Arc<ErrorGovernor<T>>,
        progress: Arc<ProgressReporter>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let encoder = codec.create_encoder(path)?;
        Ok(Self {
            job_id: job_id.into(),
            path: path.to_path_buf(),
            encoder: Some(encoder),
            chunk_size: if chunk_size > 0 { chunk_size } else { DEFAULT_WRITE_CHUNK },
            governor,
            progress,
            memory: None,
            expected_total: 0,
            rows_written: 0,
            chunks_written: 0,
            chunks_failed: 0,
            started: Instant::now(),
            finished_at: None,
        })
    }

    pub fn with_memory_guard(mut self, guard: Arc<MemoryGuard>) -> Self {
        self.memory = Some(guard);
        self
    }

    /// Announce the number of rows about to be written; grows the chunk size for large outputs.
    pub fn expect_rows(&mut self, total: u64) {
        self.expected_total = total;
        let tuned = tuned_chunk_size(self.chunk_size, total);
        if tuned != self.chunk_size {
            tracing::info!("[{}] {} rows to write; chunk size {} -> {}", self.job_id, total, self.chunk_size, tuned);
            self.chunk_size = tuned;
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Write `rows` in chunks. A failed chunk is recorded against its first
    /// row and skipped unless the governor says stop.
    pub fn write(&mut self, rows: Vec<T>) -> Result<()> {
        if self.finished_at.is_some() {
            bail!("writer for {} already finished", self.path.display());
        }
        let Some(encoder) = self.encoder.as_mut() else {
            bail!("writer for {} has no encoder", self.path.display());
        };
        for chunk in rows.chunks(self.chunk_size) {
            if self.governor.is_stopped() {
                return Err(MergeError::aborted(Phase::Write, "error governor stopped the job").into());
            }
            match encoder.encode(chunk) {
                Ok(()) => {
                    self.rows_written += chunk.len() as u64;
                    self.chunks_written += 1;
                    self.progress.report(self.rows_written, self.expected_total, Stage::Write, None);
                }
                Err(e) => {
                    self.chunks_failed += 1;
                    let rec = ErrorRecord::write_error("chunk", format!("failed to write chunk of {} rows", chunk.len()))
                        .with_record(chunk[0].clone())
                        .with_source(self.path.display().to_string())
                        .with_cause(e);
                    if self.governor.record(rec) {
                        return Err(MergeError::aborted(Phase::Write, "error governor stopped the job").into());
                    }
                    tracing::warn!("[{}] skipped chunk of {} rows", self.job_id, chunk.len());
                }
            }
            if let Some(m) = &self.memory {
                m.maybe_check(chunk.len() as u64);
            }
        }
        Ok(())
    }

    /// Flush and close the output. Calling it again is a no-op.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished_at.is_some() {
            return Ok(());
        }
        self.finished_at = Some(Instant::now());
        if let Some(mut enc) = self.encoder.take() {
            enc.finish().with_context(|| format!("finish {}", self.path.display()))?;
        }
        tracing::info!(
            "[{}] wrote {} rows to {} in {:.2}s ({:.0} rows/s, {} chunks, {} skipped)",
            self.job_id,
            self.rows_written,
            self.path.display(),
            self.elapsed().as_secs_f64(),
            self.rows_per_second(),
            self.chunks_written,
            self.chunks_failed
        );
        Ok(())
    }

    /// Finish, then move the output onto `target`, replacing it.
    pub fn commit(&mut self, target: &Path) -> Result<()> {
        self.finish()?;
        replace_file_atomic_backoff(&self.path, target)
            .with_context(|| format!("promote {} -> {}", self.path.display(), target.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn chunks_failed(&self) -> u64 {
        self.chunks_failed
    }

    pub fn elapsed(&self) -> Duration {
        self.finished_at.unwrap_or_else(Instant::now).duration_since(self.started)
    }

    pub fn rows_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.rows_written as f64 / secs
        } else {
            0.0
        }
    }
}

impl<T> Drop for BatchWriter<T> {
    fn drop(&mut self) {
        if let Some(mut enc) = self.encoder.take() {
            if let Err(e) = enc.finish() {
                tracing::warn!("[{}] closing {} failed: {:#}", self.job_id, self.path.display(), e);
            }
        }
    }
}
