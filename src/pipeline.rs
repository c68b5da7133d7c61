use crate::codec::RowCodec;
use crate::config::JobConfig;
use crate::dedupe::{DedupStage, FileMaps};
use crate::error::MergeError;
use crate::governor::{ErrorGovernor, ErrorRecord, Phase};
use crate::mem::MemoryGuard;
use crate::pool::{PoolLease, PoolMonitor};
use crate::processor::BatchProcessor;
use crate::progress::{ProgressReporter, Stage};
use crate::reader::{BatchConsumer, BatchReader, FileBatch, ReadSummary, ReaderSettings};
use crate::result::JobResult;
use crate::util::{init_tracing_once, new_job_id, replace_file_atomic_backoff, ScratchDir};
use crate::writer::BatchWriter;
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One merge: many sources -> filter -> optional dedup -> one target.
pub struct MergeJob<T> {
    config: JobConfig<T>,
    codec: Arc<dyn RowCodec<T>>,
}

/// Receives reader batches: filters them, then either streams them to the
/// writer or folds them into per-file dedup maps.
struct MergeSink<T> {
    processor: Arc<BatchProcessor<T>>,
    writer: Arc<Mutex<BatchWriter<T>>>,
    file_maps: Option<FileMaps<T>>,
    sealed: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> BatchConsumer<T> for MergeSink<T> {
    fn accept(&self, batch: FileBatch<T>) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            bail!("batch from {} arrived after the read phase ended", batch.source.display());
        }
        let rows = self.processor.filter(batch.rows)?;
        if rows.is_empty() {
            return Ok(());
        }
        match (&self.file_maps, self.processor.dedup_stage()) {
            (Some(maps), Some(stage)) => maps.fold_batch(stage, batch.file_index, rows),
            _ => self.writer.lock().write(rows),
        }
    }

    fn wave_complete(&self, files: &[usize]) -> Result<()> {
        if let (Some(maps), Some(stage)) = (&self.file_maps, self.processor.dedup_stage()) {
            maps.seal_files(stage, files)?;
        }
        Ok(())
    }
}

struct Completed {
    rows_written: u64,
    read: ReadSummary,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl<T> MergeJob<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: JobConfig<T>, codec: Arc<dyn RowCodec<T>>) -> Self {
        Self { config, codec }
    }

    pub fn config(&self) -> &JobConfig<T> {
        &self.config
    }

    /// Run the job to completion. Never panics on job failure; inspect the result.
    pub fn run(self) -> JobResult<T> {
        init_tracing_once();
        let started = Instant::now();
        let job_id = new_job_id();
        let cfg = &self.config;
        let mut result = JobResult::new(job_id.clone(), cfg.sources.clone());
        tracing::info!("[{}] merge job: {} sources -> {}", job_id, cfg.sources.len(), cfg.target.display());

        let problems = cfg.validate();
        if !problems.is_empty() {
            let err = MergeError::Validation(problems.clone());
            tracing::error!("[{}] {}", job_id, err);
            result.validation_errors = problems;
            result.error_message = Some(err.to_string());
            result.elapsed_ms = elapsed_ms(started);
            return result;
        }

        let governor = Arc::new(
            ErrorGovernor::new(job_id.clone(), !cfg.continue_on_error, cfg.max_errors).with_callback(cfg.error_callback.clone()),
        );
        let progress = Arc::new(ProgressReporter::new(job_id.clone(), cfg.progress.clone(), cfg.progress_bars));

        match self.execute(&job_id, &governor, &progress) {
            Ok(done) => {
                result.success = true;
                result.total_rows = done.rows_written;
                result.output = Some(cfg.target.clone());
                result.rows_read = done.read.total_rows;
                result.rows_rejected = done.read.rows_rejected;
                result.files_read = done.read.files_completed;
                result.files_failed = done.read.files_failed;
                progress.milestone(100, Stage::Done, "merge complete");
            }
            Err(e) => {
                tracing::error!("[{}] merge failed: {:#}", job_id, e);
                result.error_message = Some(format!("{:#}", e));
            }
        }

        result.error_count = governor.error_count();
        if governor.has_errors() {
            let report = governor.report();
            tracing::warn!("[{}] {}", job_id, report);
            result.error_report = Some(report);
        }
        let records = governor.take_records();
        if cfg.export_error_data {
            result.error_data_file = self.export_error_rows(&job_id, &records);
        }
        result.errors = records;
        result.elapsed_ms = elapsed_ms(started);
        tracing::info!("[{}] {}", job_id, result.summary());
        result
    }

    fn execute(&self, job_id: &str, governor: &Arc<ErrorGovernor<T>>, progress: &Arc<ProgressReporter>) -> Result<Completed> {
        let cfg = &self.config;
        progress.milestone(0, Stage::Init, "preparing merge");

        if let Some(parent) = cfg.target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create output dir {}", parent.display()))?;
        }
        let file_name = cfg
            .target
            .file_name()
            .ok_or_else(|| anyhow!("target has no file name: {}", cfg.target.display()))?;

        // Declaration order matters for teardown: monitor stops before the pool, pool before scratch.
        let scratch = ScratchDir::create(&cfg.work_root(), job_id)?;
        let lease = PoolLease::acquire(cfg.executor.clone(), &cfg.pool)?;
        let _monitor = if lease.is_owned() {
            Some(PoolMonitor::spawn(lease.pool().clone(), cfg.pool.monitor_interval)?)
        } else {
            None
        };

        let memory = Arc::new(MemoryGuard::new(job_id, cfg.memory.clone()));
        tracing::info!("[{}] {}", job_id, memory.memory_info());

        let dedup = match (cfg.dedup, &cfg.key_extractor) {
            (true, Some(key)) => Some(DedupStage::new(job_id, key.clone(), cfg.merge.clone(), governor.clone())),
            _ => None,
        };
        let processor = Arc::new(BatchProcessor::new(
            job_id,
            cfg.filter.clone(),
            dedup,
            governor.clone(),
            cfg.skip_invalid_data,
            progress.clone(),
        ));

        let scratch_out = scratch.path().join(file_name);
        let writer = BatchWriter::create(job_id, self.codec.as_ref(), &scratch_out, cfg.write_chunk_size, governor.clone(), progress.clone())?
            .with_memory_guard(memory.clone());
        let writer = Arc::new(Mutex::new(writer));

        let sink = Arc::new(MergeSink {
            processor: processor.clone(),
            writer: writer.clone(),
            file_maps: processor.dedup_stage().map(|_| FileMaps::new()),
            sealed: AtomicBool::new(false),
        });

        let reader = BatchReader::new(
            job_id,
            ReaderSettings {
                batch_size: cfg.batch_size,
                max_concurrent_files: cfg.max_concurrent_files,
                continue_on_error: cfg.continue_on_error,
                skip_invalid_data: cfg.skip_invalid_data,
                read_timeout: cfg.read_timeout,
                progress_every_rows: cfg.progress_every_rows,
            },
            lease.pool().clone(),
            governor.clone(),
            memory.clone(),
            progress.clone(),
        );
        let read = reader.read_files(&cfg.sources, self.codec.clone(), sink.clone());
        sink.sealed.store(true, Ordering::Release);
        let read = read?;
        progress.milestone(30, Stage::Read, &format!("read {} rows from {} files", read.total_rows, read.files_completed));

        let deduped = match (&sink.file_maps, processor.dedup_stage()) {
            (Some(maps), Some(stage)) => {
                let rows = maps.finish(stage)?;
                let s = maps.stats();
                tracing::info!(
                    "[{}] dedup: {} unique rows ({} without key, {} key errors, {} merge errors)",
                    job_id,
                    rows.len(),
                    s.null_keys,
                    s.key_errors,
                    s.merge_errors
                );
                Some(rows)
            }
            _ => None,
        };
        progress.milestone(60, Stage::Process, "processing complete");

        let mut w = writer.lock();
        if let Some(rows) = deduped {
            w.expect_rows(rows.len() as u64);
            w.write(rows)?;
        }
        if governor.is_stopped() {
            return Err(MergeError::aborted(Phase::Write, "error governor stopped the job").into());
        }
        w.commit(&cfg.target)?;
        let rows_written = w.rows_written();
        drop(w);

        tracing::info!("[{}] committed {} rows to {}", job_id, rows_written, cfg.target.display());
        Ok(Completed { rows_written, read })
    }

    fn export_error_rows(&self, job_id: &str, records: &[ErrorRecord<T>]) -> Option<PathBuf> {
        let rows: Vec<T> = records.iter().filter_map(|r| r.record().cloned()).collect();
        if rows.is_empty() {
            return None;
        }
        let path = self.config.error_data_target();
        match export_rows(self.codec.as_ref(), &path, rows) {
            Ok(n) => {
                tracing::info!("[{}] exported {} error rows to {}", job_id, n, path.display());
                Some(path)
            }
            Err(e) => {
                tracing::warn!("[{}] error export to {} failed: {:#}", job_id, path.display(), e);
                None
            }
        }
    }
}

/// Write `rows` to `target` in chunks, replacing it atomically. Any chunk failure fails the export.
pub fn export_rows<T>(codec: &dyn RowCodec<T>, target: &Path, rows: Vec<T>) -> Result<u64>
where
    T: Clone + Send + Sync + 'static,
{
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("export target has no file name: {}", target.display()))?;
    // Keep the extension last so the codec picks the same format for the temp file.
    let tmp = target.with_file_name(format!(".tmp-{}", name));
    let governor = Arc::new(ErrorGovernor::new("export", true, None));
    let mut writer = BatchWriter::create("export", codec, &tmp, 0, governor, Arc::new(ProgressReporter::silent()))?;
    writer.expect_rows(rows.len() as u64);
    let written = writer.write(rows).and_then(|_| writer.finish());
    if let Err(e) = written {
        drop(writer);
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    replace_file_atomic_backoff(&tmp, target)?;
    Ok(writer.rows_written())
}

/// Merge `sources` into `target` with default settings.
pub fn quick_merge<T, P>(sources: impl IntoIterator<Item = P>, target: impl AsRef<Path>, codec: Arc<dyn RowCodec<T>>) -> JobResult<T>
where
    T: Clone + Send + Sync + 'static,
    P: AsRef<Path>,
{
    MergeJob::new(JobConfig::new(sources, target), codec).run()
}

/// Merge with deduplication on `key`; the first record seen for a key wins.
pub fn quick_merge_dedup<T, P, F>(
    sources: impl IntoIterator<Item = P>,
    target: impl AsRef<Path>,
    codec: Arc<dyn RowCodec<T>>,
    key: F,
) -> JobResult<T>
where
    T: Clone + Send + Sync + 'static,
    P: AsRef<Path>,
    F: Fn(&T) -> Result<Option<String>> + Send + Sync + 'static,
{
    MergeJob::new(JobConfig::new(sources, target).with_dedup(key), codec).run()
}
