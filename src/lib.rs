mod error;
mod governor;
mod pool;
mod mem;
mod concurrency;
mod util;
mod paths;

mod codec;
mod ndjson;
mod filters;
mod key_extractor;
mod progress;

mod reader;
mod dedupe;
mod processor;
mod writer;

mod config;
mod result;
mod pipeline;

pub use crate::config::JobConfig;
pub use crate::pipeline::{export_rows, quick_merge, quick_merge_dedup, MergeJob};
pub use crate::result::JobResult;
pub use crate::error::MergeError;

// error governor
pub use crate::governor::{ErrorCallback, ErrorGovernor, ErrorRecord, Phase};

// format seam + JSON Lines implementation
pub use crate::codec::{RowCodec, RowEncoder, RowFault, RowVisitor};
pub use crate::ndjson::{is_zstd, JsonLinesCodec, JsonLinesEncoder};

// row callbacks and JSON helpers
pub use crate::filters::{JsonFilter, NumCmp, RowFilter};
pub use crate::key_extractor::{JsonKey, JsonMerge, KeyExtractor, MergeFn};

// pipeline stages, usable on their own
pub use crate::reader::{BatchConsumer, BatchReader, FileBatch, ReadSummary, ReaderSettings};
pub use crate::processor::{BatchProcessor, PROCESS_CHUNK_ROWS};
pub use crate::dedupe::{DedupStage, FileMaps, FoldStats, UniqueKeyMap};
pub use crate::writer::{tuned_chunk_size, BatchWriter, DEFAULT_WRITE_CHUNK};

// resources
pub use crate::pool::{
    create_pool, monitor_pool, shutdown_pool, PoolLease, PoolMonitor, PoolSettings, PoolStats, Resize, ShutdownOutcome,
    TaskHandle, TaskOutcome, WorkerPool,
};
pub use crate::mem::{MemoryGuard, MemorySample, MemorySettings};
pub use crate::progress::{LogProgress, ProgressCallback, ProgressReporter, ProgressScope, Stage};

// file discovery + robust file ops for binaries
pub use crate::paths::{default_source_pattern, discover_sources, DEFAULT_SOURCE_PATTERN};
pub use crate::util::{init_tracing_once, new_job_id, replace_file_atomic_backoff};
