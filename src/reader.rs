//! Batch reader: decodes source files concurrently (bounded by
//! `max_concurrent_files`) and hands fixed-size batches to a consumer.

use crate::codec::{RowCodec, RowFault, RowVisitor};
use crate::concurrency::{plan_waves, run_wave};
use crate::error::MergeError;
use crate::governor::{ErrorGovernor, ErrorRecord, Phase};
use crate::mem::MemoryGuard;
use crate::pool::{TaskOutcome, WorkerPool};
use crate::progress::{ProgressReporter, Stage};
use anyhow::Result;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_BATCH_SIZE: usize = 5000;
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 3;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_PROGRESS_EVERY_ROWS: u64 = 10_000;

/// A run of consecutive rows from one source file.
#[derive(Debug)]
pub struct FileBatch<T> {
    pub file_index: usize,
    pub source: Arc<PathBuf>,
    /// Row index (0-based) of the first record in `rows`.
    pub first_row: u64,
    pub rows: Vec<T>,
}

/// Downstream of the reader. Called from worker threads.
pub trait BatchConsumer<T>: Send + Sync {
    fn accept(&self, batch: FileBatch<T>) -> Result<()>;

    /// Every file in `files` has finished (successfully or not).
    fn wave_complete(&self, _files: &[usize]) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ReaderSettings {
    pub batch_size: usize,
    pub max_concurrent_files: usize,
    pub continue_on_error: bool,
    pub skip_invalid_data: bool,
    pub read_timeout: Duration,
    pub progress_every_rows: u64,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            continue_on_error: true,
            skip_invalid_data: true,
            read_timeout: DEFAULT_READ_TIMEOUT,
            progress_every_rows: DEFAULT_PROGRESS_EVERY_ROWS,
        }
    }
}

impl ReaderSettings {
    /// Zero sizes fall back to the defaults.
    pub fn normalized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.max_concurrent_files == 0 {
            self.max_concurrent_files = DEFAULT_MAX_CONCURRENT_FILES;
        }
        if self.progress_every_rows == 0 {
            self.progress_every_rows = DEFAULT_PROGRESS_EVERY_ROWS;
        }
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadSummary {
    /// Rows delivered to the consumer.
    pub total_rows: u64,
    pub rows_rejected: u64,
    pub files_completed: usize,
    pub files_failed: usize,
    /// Highest number of files decoded at the same time.
    pub peak_open_files: usize,
}

enum FileOutcome {
    Completed,
    Failed,
}

struct ReadShared<T> {
    job_id: String,
    settings: ReaderSettings,
    governor: Arc<ErrorGovernor<T>>,
    memory: Arc<MemoryGuard>,
    progress: Arc<ProgressReporter>,
    codec: Arc<dyn RowCodec<T>>,
    consumer: Arc<dyn BatchConsumer<T>>,
    total_files: usize,
    total_rows: AtomicU64,
    rows_rejected: AtomicU64,
    files_completed: AtomicUsize,
    files_failed: AtomicUsize,
    open_now: AtomicUsize,
    peak_open: AtomicUsize,
}

struct OpenFileGuard<'a> {
    open_now: &'a AtomicUsize,
}

impl<'a> OpenFileGuard<'a> {
    fn enter(open_now: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let n = open_now.fetch_add(1, Ordering::AcqRel) + 1;
        peak.fetch_max(n, Ordering::AcqRel);
        Self { open_now }
    }
}

impl Drop for OpenFileGuard<'_> {
    fn drop(&mut self) {
        self.open_now.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: Clone + Send + Sync + 'static> ReadShared<T> {
    fn abort(&self, reason: impl Into<String>) -> anyhow::Error {
        MergeError::aborted(Phase::Read, reason).into()
    }

    /// Record a whole-file failure and apply the continue/abort policy.
    fn file_failed(&self, path: &Path, message: String, cause: Option<anyhow::Error>) -> Result<FileOutcome> {
        let mut rec = ErrorRecord::read_error("file", path.display().to_string(), -1, message);
        if let Some(c) = cause {
            rec = rec.with_cause(c);
        }
        let stop = self.governor.record(rec);
        self.escalate(path, stop)
    }

    /// Outstanding work at the read deadline: recorded, then the read fails as a whole.
    fn record_timeout(&self, path: &Path, message: &str) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        self.governor.record(ErrorRecord::read_error("file", path.display().to_string(), -1, message));
    }

    fn escalate(&self, path: &Path, stop: bool) -> Result<FileOutcome> {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        if stop || !self.settings.continue_on_error {
            return Err(self.abort(format!("failed to read {}", path.display())));
        }
        Ok(FileOutcome::Failed)
    }

    fn read_one(&self, file_index: usize, path: &Path) -> Result<FileOutcome> {
        let _open = OpenFileGuard::enter(&self.open_now, &self.peak_open);
        tracing::info!("[{}] reading file {}/{}: {}", self.job_id, file_index + 1, self.total_files, path.display());
        let started = Instant::now();

        let mut visitor = FileVisitor {
            ctx: self,
            file_index,
            source: Arc::new(path.to_path_buf()),
            batch: Vec::with_capacity(self.settings.batch_size),
            batch_first_row: 0,
            rows: 0,
            escalated: false,
            aborted: false,
        };
        let decoded = self.codec.decode(path, &mut visitor);

        match decoded {
            Ok(()) => {
                visitor.flush()?;
                let done = self.files_completed.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::info!(
                    "[{}] finished {} ({} rows in {:.2}s)",
                    self.job_id,
                    path.display(),
                    visitor.rows,
                    started.elapsed().as_secs_f64()
                );
                let msg = path.display().to_string();
                self.progress.report(done as u64, self.total_files as u64, Stage::Read, Some(&msg));
                Ok(FileOutcome::Completed)
            }
            Err(e) if MergeError::is_abort(&e) => Err(e),
            Err(_) if visitor.aborted || self.governor.is_stopped() => {
                Err(self.abort(format!("error governor stopped reading {}", path.display())))
            }
            Err(e) => {
                if !visitor.batch.is_empty() {
                    tracing::warn!(
                        "[{}] discarding {} buffered rows of failed file {}",
                        self.job_id,
                        visitor.batch.len(),
                        path.display()
                    );
                }
                if visitor.escalated {
                    // Row-level failure already recorded at its row.
                    self.escalate(path, false)
                } else {
                    self.file_failed(path, "failed to read file".to_string(), Some(e))
                }
            }
        }
    }
}

struct FileVisitor<'a, T> {
    ctx: &'a ReadShared<T>,
    file_index: usize,
    source: Arc<PathBuf>,
    batch: Vec<T>,
    batch_first_row: u64,
    rows: u64,
    /// A bad row ended the file because invalid data is not skipped.
    escalated: bool,
    /// The governor asked to stop while decoding.
    aborted: bool,
}

impl<T: Clone + Send + Sync + 'static> FileVisitor<'_, T> {
    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let ctx = self.ctx;
        if ctx.governor.is_stopped() {
            self.aborted = true;
            return Err(ctx.abort("error governor stopped the job"));
        }
        ctx.memory.wait_for_headroom();

        let rows = mem::replace(&mut self.batch, Vec::with_capacity(ctx.settings.batch_size));
        let n = rows.len();
        let batch = FileBatch { file_index: self.file_index, source: self.source.clone(), first_row: self.batch_first_row, rows };
        match ctx.consumer.accept(batch) {
            Ok(()) => {}
            Err(e) if MergeError::is_abort(&e) => {
                self.aborted = true;
                return Err(e);
            }
            Err(e) => {
                let rec = ErrorRecord::process_error("batch", format!("failed to process batch of {} rows", n))
                    .with_source(self.source.display().to_string())
                    .with_cause(e);
                if ctx.governor.record(rec) {
                    self.aborted = true;
                    return Err(ctx.abort("error governor stopped the job"));
                }
            }
        }
        ctx.memory.maybe_check(n as u64);
        Ok(())
    }
}

impl<T: Clone + Send + Sync + 'static> RowVisitor<T> for FileVisitor<'_, T> {
    fn record(&mut self, row_index: u64, record: T) -> Result<()> {
        if self.batch.is_empty() {
            self.batch_first_row = row_index;
        }
        self.batch.push(record);
        self.rows += 1;
        self.ctx.total_rows.fetch_add(1, Ordering::Relaxed);

        if self.batch.len() >= self.ctx.settings.batch_size {
            self.flush()?;
        }
        if self.rows % self.ctx.settings.progress_every_rows.max(1) == 0 {
            let msg = format!("{}: {} rows", self.source.display(), self.rows);
            self.ctx.progress.report(self.rows, 0, Stage::ReadRows, Some(&msg));
        }
        Ok(())
    }

    fn row_error(&mut self, row_index: u64, fault: RowFault, error: anyhow::Error) -> bool {
        let ctx = self.ctx;
        let source = self.source.display().to_string();
        let rec = match fault {
            RowFault::Unreadable => ErrorRecord::read_error("row", source, row_index as i64, "unreadable row"),
            RowFault::Invalid => ErrorRecord::transform_error("row", source, row_index as i64, "invalid row"),
        }
        .with_cause(error);
        ctx.rows_rejected.fetch_add(1, Ordering::Relaxed);

        if ctx.governor.record(rec) {
            self.aborted = true;
            return false;
        }
        if !ctx.settings.skip_invalid_data {
            self.escalated = true;
            return false;
        }
        true
    }

    fn complete(&mut self) -> Result<()> {
        self.flush()
    }
}

pub struct BatchReader<T> {
    job_id: String,
    settings: ReaderSettings,
    pool: Arc<WorkerPool>,
    governor: Arc<ErrorGovernor<T>>,
    memory: Arc<MemoryGuard>,
    progress: Arc<ProgressReporter>,
}

impl<T: Clone + Send + Sync + 'static> BatchReader<T> {
    pub fn new(
        job_id: impl Into<String>,
        settings: ReaderSettings,
        pool: Arc<WorkerPool>,
        governor: Arc<ErrorGovernor<T>>,
        memory: Arc<MemoryGuard>,
        progress: Arc<ProgressReporter>,
    ) -> Self {
        Self { job_id: job_id.into(), settings: settings.normalized(), pool, governor, memory, progress }
    }

    /// Read every file in `files`, in waves of at most `max_concurrent_files`.
    ///
    /// Failed files are recorded and skipped while `continue_on_error` holds
    /// and the governor allows it; otherwise the read aborts. Work still
    /// outstanding at the read deadline counts as failed.
    pub fn read_files(
        &self,
        files: &[PathBuf],
        codec: Arc<dyn RowCodec<T>>,
        consumer: Arc<dyn BatchConsumer<T>>,
    ) -> Result<ReadSummary> {
        let limit = self.settings.max_concurrent_files.max(1);
        let deadline = Instant::now() + self.settings.read_timeout;
        tracing::info!(
            "[{}] reading {} files (max concurrent: {}, batch size: {})",
            self.job_id,
            files.len(),
            limit,
            self.settings.batch_size
        );

        let shared = Arc::new(ReadShared {
            job_id: self.job_id.clone(),
            settings: self.settings.clone(),
            governor: self.governor.clone(),
            memory: self.memory.clone(),
            progress: self.progress.clone(),
            codec,
            consumer: consumer.clone(),
            total_files: files.len(),
            total_rows: AtomicU64::new(0),
            rows_rejected: AtomicU64::new(0),
            files_completed: AtomicUsize::new(0),
            files_failed: AtomicUsize::new(0),
            open_now: AtomicUsize::new(0),
            peak_open: AtomicUsize::new(0),
        });
        let bar = self.progress.count_bar("Reading files", files.len() as u64);

        for wave in plan_waves(files.len(), limit) {
            if self.governor.is_stopped() {
                return Err(MergeError::aborted(Phase::Read, "error governor stopped the job").into());
            }
            if Instant::now() >= deadline {
                for path in &files[wave.start..] {
                    shared.record_timeout(path, "read deadline passed before file started");
                }
                return Err(MergeError::Timeout { what: "read phase", after: self.settings.read_timeout }.into());
            }

            let indices: Vec<usize> = wave.clone().collect();
            let outcomes = run_wave(&self.pool, wave, deadline, |i| {
                let ctx = shared.clone();
                let path = files[i].clone();
                move || ctx.read_one(i, &path)
            });

            let mut timed_out = false;
            for (i, outcome) in outcomes {
                let path = &files[i];
                match outcome {
                    TaskOutcome::Done(Ok(_)) => {}
                    TaskOutcome::Done(Err(e)) => return Err(e),
                    TaskOutcome::Failed(msg) => {
                        shared.file_failed(path, format!("reader task failed: {}", msg), None)?;
                    }
                    TaskOutcome::Cancelled => {
                        shared.file_failed(path, "reader task was cancelled".to_string(), None)?;
                    }
                    TaskOutcome::TimedOut => {
                        timed_out = true;
                        shared.record_timeout(path, "read did not finish before the deadline");
                    }
                }
                if let Some(b) = &bar {
                    b.inc(1);
                }
            }

            consumer.wave_complete(&indices)?;
            if timed_out {
                return Err(MergeError::Timeout { what: "read phase", after: self.settings.read_timeout }.into());
            }
            self.memory.check_now();
            tracing::debug!("[{}] wave done; {}", self.job_id, self.memory.memory_info());
        }

        let summary = ReadSummary {
            total_rows: shared.total_rows.load(Ordering::Acquire),
            rows_rejected: shared.rows_rejected.load(Ordering::Acquire),
            files_completed: shared.files_completed.load(Ordering::Acquire),
            files_failed: shared.files_failed.load(Ordering::Acquire),
            peak_open_files: shared.peak_open.load(Ordering::Acquire),
        };
        if let Some(b) = bar {
            b.finish(format!("{} files read", summary.files_completed));
        }
        tracing::info!(
            "[{}] read complete: {} rows from {} files ({} failed, {} rows rejected)",
            self.job_id,
            summary.total_rows,
            summary.files_completed,
            summary.files_failed,
            summary.rows_rejected
        );
        Ok(summary)
    }
}
