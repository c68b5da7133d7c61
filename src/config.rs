use crate::filters::RowFilter;
use crate::governor::{ErrorCallback, ErrorRecord, Phase};
use crate::key_extractor::{KeyExtractor, MergeFn};
use crate::mem::MemorySettings;
use crate::pool::{PoolSettings, WorkerPool};
use crate::progress::{ProgressCallback, Stage};
use crate::reader::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENT_FILES, DEFAULT_PROGRESS_EVERY_ROWS, DEFAULT_READ_TIMEOUT};
use crate::writer::DEFAULT_WRITE_CHUNK;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Everything one merge job needs, with sensible defaults and builder chaining.
/// Zero sizes fall back to the defaults.
pub struct JobConfig<T> {
    pub sources: Vec<PathBuf>,
    pub target: PathBuf,

    pub filter: Option<Arc<dyn RowFilter<T>>>,
    pub dedup: bool,
    pub key_extractor: Option<Arc<dyn KeyExtractor<T>>>,
    pub merge: Option<Arc<dyn MergeFn<T>>>,

    pub batch_size: usize,
    pub write_chunk_size: usize,
    pub max_concurrent_files: usize,
    pub pool: PoolSettings,
    pub executor: Option<Arc<WorkerPool>>, // borrowed; never shut down by the job

    pub continue_on_error: bool,
    pub max_errors: Option<usize>, // None = unlimited
    pub skip_invalid_data: bool,
    pub error_callback: Option<Arc<dyn ErrorCallback<T>>>,
    pub export_error_data: bool,
    pub error_data_path: Option<PathBuf>, // default: <target stem>_errors.<ext>

    pub progress: Option<Arc<dyn ProgressCallback>>,
    pub progress_bars: bool,
    pub progress_every_rows: u64,

    pub memory: MemorySettings,
    pub read_timeout: Duration,
    pub work_dir: Option<PathBuf>, // if None, <target dir>/.tabmerge_work/
}

impl<T> Clone for JobConfig<T> {
    fn clone(&self) -> Self {
        Self {
            sources: self.sources.clone(),
            target: self.target.clone(),
            filter: self.filter.clone(),
            dedup: self.dedup,
            key_extractor: self.key_extractor.clone(),
            merge: self.merge.clone(),
            batch_size: self.batch_size,
            write_chunk_size: self.write_chunk_size,
            max_concurrent_files: self.max_concurrent_files,
            pool: self.pool.clone(),
            executor: self.executor.clone(),
            continue_on_error: self.continue_on_error,
            max_errors: self.max_errors,
            skip_invalid_data: self.skip_invalid_data,
            error_callback: self.error_callback.clone(),
            export_error_data: self.export_error_data,
            error_data_path: self.error_data_path.clone(),
            progress: self.progress.clone(),
            progress_bars: self.progress_bars,
            progress_every_rows: self.progress_every_rows,
            memory: self.memory.clone(),
            read_timeout: self.read_timeout,
            work_dir: self.work_dir.clone(),
        }
    }
}

impl<T: 'static> JobConfig<T> {
    pub fn new<P: AsRef<Path>>(sources: impl IntoIterator<Item = P>, target: impl AsRef<Path>) -> Self {
        Self {
            sources: sources.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
            target: target.as_ref().to_path_buf(),
            filter: None,
            dedup: false,
            key_extractor: None,
            merge: None,
            batch_size: DEFAULT_BATCH_SIZE,
            write_chunk_size: DEFAULT_WRITE_CHUNK,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            pool: PoolSettings::default(),
            executor: None,
            continue_on_error: true,
            max_errors: None,
            skip_invalid_data: true,
            error_callback: None,
            export_error_data: false,
            error_data_path: None,
            progress: None,
            progress_bars: false,
            progress_every_rows: DEFAULT_PROGRESS_EVERY_ROWS,
            memory: MemorySettings::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            work_dir: None,
        }
    }

    pub fn with_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Result<bool> + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(f));
        self
    }
    pub fn with_row_filter(mut self, f: impl RowFilter<T> + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Enable deduplication keyed by `key`.
    pub fn with_dedup<F>(mut self, key: F) -> Self
    where
        F: Fn(&T) -> Result<Option<String>> + Send + Sync + 'static,
    {
        self.dedup = true;
        self.key_extractor = Some(Arc::new(key));
        self
    }
    pub fn with_key_extractor(mut self, key: impl KeyExtractor<T> + 'static) -> Self {
        self.dedup = true;
        self.key_extractor = Some(Arc::new(key));
        self
    }
    pub fn with_merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(&T, &T) -> Result<T> + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(merge));
        self
    }
    pub fn with_merge_fn(mut self, merge: impl MergeFn<T> + 'static) -> Self {
        self.merge = Some(Arc::new(merge));
        self
    }
    pub fn with_dedup_enabled(mut self, on: bool) -> Self {
        self.dedup = on;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = if n > 0 { n } else { DEFAULT_BATCH_SIZE };
        self
    }
    pub fn with_write_chunk_size(mut self, n: usize) -> Self {
        self.write_chunk_size = if n > 0 { n } else { DEFAULT_WRITE_CHUNK };
        self
    }
    pub fn with_max_concurrent_files(mut self, n: usize) -> Self {
        self.max_concurrent_files = if n > 0 { n } else { DEFAULT_MAX_CONCURRENT_FILES };
        self
    }
    pub fn with_pool(mut self, settings: PoolSettings) -> Self {
        self.pool = settings;
        self
    }
    pub fn with_executor(mut self, pool: Arc<WorkerPool>) -> Self {
        self.executor = Some(pool);
        self
    }

    pub fn with_continue_on_error(mut self, on: bool) -> Self {
        self.continue_on_error = on;
        self
    }
    /// `0` means unlimited.
    pub fn with_max_errors(mut self, n: usize) -> Self {
        self.max_errors = if n > 0 { Some(n) } else { None };
        self
    }
    pub fn with_skip_invalid_data(mut self, on: bool) -> Self {
        self.skip_invalid_data = on;
        self
    }
    /// `cb(record, error_count, phase)`; returning `false` stops the job.
    pub fn with_error_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn(&ErrorRecord<T>, usize, Phase) -> bool + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(cb));
        self
    }
    pub fn with_error_export(mut self, path: Option<PathBuf>) -> Self {
        self.export_error_data = true;
        self.error_data_path = path;
        self
    }

    pub fn with_progress(mut self, cb: impl ProgressCallback + 'static) -> Self {
        self.progress = Some(Arc::new(cb));
        self
    }
    pub fn with_progress_fn<F>(mut self, cb: F) -> Self
    where
        F: Fn(u64, u64, Stage, Option<&str>) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(cb));
        self
    }
    pub fn with_progress_bars(mut self, on: bool) -> Self {
        self.progress_bars = on;
        self
    }
    pub fn with_progress_every_rows(mut self, n: u64) -> Self {
        self.progress_every_rows = if n > 0 { n } else { DEFAULT_PROGRESS_EVERY_ROWS };
        self
    }

    pub fn with_memory(mut self, settings: MemorySettings) -> Self {
        self.memory = settings;
        self
    }
    pub fn with_read_timeout(mut self, d: Duration) -> Self {
        self.read_timeout = if d.is_zero() { DEFAULT_READ_TIMEOUT } else { d };
        self
    }
    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Error export destination: explicit path, or `<target stem>_errors.<ext>` next to the target.
    pub fn error_data_target(&self) -> PathBuf {
        if let Some(p) = &self.error_data_path {
            return p.clone();
        }
        let name = self.target.file_name().and_then(|n| n.to_str()).unwrap_or("output");
        // Split on the first dot so "merged.jsonl.zst" keeps its full extension.
        let derived = match name.split_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{}_errors.{}", stem, ext),
            _ => format!("{}_errors", name),
        };
        self.target.with_file_name(derived)
    }

    /// Scratch root for this job's work files.
    pub fn work_root(&self) -> PathBuf {
        match &self.work_dir {
            Some(d) => d.join(".tabmerge_work"),
            None => {
                let parent = self.target.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
                parent.join(".tabmerge_work")
            }
        }
    }

    /// Pre-flight checks. Every problem found is returned; no I/O beyond metadata lookups.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.sources.is_empty() {
            errors.push("source file list is empty".to_string());
        }
        for src in &self.sources {
            match std::fs::metadata(src) {
                Err(_) => errors.push(format!("source file not found: {}", src.display())),
                Ok(m) if !m.is_file() => errors.push(format!("source is not a regular file: {}", src.display())),
                Ok(_) => {}
            }
        }
        if self.target.as_os_str().is_empty() {
            errors.push("target path is empty".to_string());
        } else if self.target.is_dir() {
            errors.push(format!("target is a directory: {}", self.target.display()));
        }
        if self.dedup && self.key_extractor.is_none() {
            errors.push("deduplication is enabled but no key extractor is set".to_string());
        }
        if self.merge.is_some() && self.key_extractor.is_none() {
            errors.push("a merge function needs a key extractor".to_string());
        }
        if !(self.memory.threshold > 0.0 && self.memory.threshold <= 1.0) {
            errors.push(format!("memory threshold must be in (0, 1], got {}", self.memory.threshold));
        }
        errors
    }
}
