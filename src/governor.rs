//! Error governor: thread-safe collection of failure records and the single
//! continue-vs-abort verdict for a job.

use parking_lot::Mutex;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// How many records `report()` lists in its sample section.
const REPORT_SAMPLE: usize = 10;

/// Pipeline phase an error was raised in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Read,
    Transform,
    Process,
    Write,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Read, Phase::Transform, Phase::Process, Phase::Write];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Read => "read",
            Phase::Transform => "transform",
            Phase::Process => "process",
            Phase::Write => "write",
        }
    }

    fn index(self) -> usize {
        match self {
            Phase::Read => 0,
            Phase::Transform => 1,
            Phase::Process => 2,
            Phase::Write => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failure, captured where it happened. Never mutated after creation.
#[derive(Debug)]
pub struct ErrorRecord<T> {
    phase: Phase,
    step: &'static str,
    record: Option<T>,
    source: String,
    row_index: i64,
    message: String,
    cause: Option<anyhow::Error>,
    timestamp: OffsetDateTime,
}

impl<T> ErrorRecord<T> {
    fn new(phase: Phase, step: &'static str, message: impl Into<String>) -> Self {
        Self {
            phase,
            step,
            record: None,
            source: String::new(),
            row_index: -1,
            message: message.into(),
            cause: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// File- or row-level read failure. Use `row_index = -1` when unknown.
    pub fn read_error(step: &'static str, source: impl Into<String>, row_index: i64, message: impl Into<String>) -> Self {
        let mut r = Self::new(Phase::Read, step, message);
        r.source = source.into();
        r.row_index = row_index;
        r
    }

    /// A row was decoded but could not be converted into a usable record.
    pub fn transform_error(step: &'static str, source: impl Into<String>, row_index: i64, message: impl Into<String>) -> Self {
        let mut r = Self::new(Phase::Transform, step, message);
        r.source = source.into();
        r.row_index = row_index;
        r
    }

    /// Filter, key extraction or merge failure.
    pub fn process_error(step: &'static str, message: impl Into<String>) -> Self {
        Self::new(Phase::Process, step, message)
    }

    /// Chunk write failure.
    pub fn write_error(step: &'static str, message: impl Into<String>) -> Self {
        Self::new(Phase::Write, step, message)
    }

    pub fn with_record(mut self, record: T) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn phase(&self) -> Phase { self.phase }
    pub fn step(&self) -> &'static str { self.step }
    pub fn record(&self) -> Option<&T> { self.record.as_ref() }
    pub fn source(&self) -> &str { &self.source }
    pub fn row_index(&self) -> i64 { self.row_index }
    pub fn message(&self) -> &str { &self.message }
    pub fn cause(&self) -> Option<&anyhow::Error> { self.cause.as_ref() }
    pub fn timestamp(&self) -> OffsetDateTime { self.timestamp }

    pub fn into_record(self) -> Option<T> { self.record }

    /// One-line summary used in logs and reports.
    pub fn short_description(&self) -> String {
        let mut s = format!("phase: {}-{}", self.phase, self.step);
        if !self.source.is_empty() {
            let _ = write!(s, ", source: {}", self.source);
        }
        if self.row_index >= 0 {
            let _ = write!(s, ", row: {}", self.row_index);
        }
        let _ = write!(s, ", message: {}", self.message);
        if let Some(c) = &self.cause {
            let _ = write!(s, " ({:#})", c);
        }
        s
    }
}

/// Optional observer consulted after every recorded error.
/// Returning `false` asks the job to stop.
pub trait ErrorCallback<T>: Send + Sync {
    fn on_error(&self, record: &ErrorRecord<T>, error_count: usize, phase: Phase) -> bool;
}

impl<T, F> ErrorCallback<T> for F
where
    F: Fn(&ErrorRecord<T>, usize, Phase) -> bool + Send + Sync,
{
    fn on_error(&self, record: &ErrorRecord<T>, error_count: usize, phase: Phase) -> bool {
        self(record, error_count, phase)
    }
}

/// Thread-safe, append-only error collector shared by every stage of a job.
pub struct ErrorGovernor<T> {
    job_id: String,
    fail_fast: bool,
    max_errors: usize,
    records: Mutex<Vec<ErrorRecord<T>>>,
    total: AtomicUsize,
    phase_counts: [AtomicUsize; 4],
    stopped: AtomicBool,
    callback: Option<Arc<dyn ErrorCallback<T>>>,
}

impl<T> ErrorGovernor<T> {
    /// `max_errors = None` means no ceiling.
    pub fn new(job_id: impl Into<String>, fail_fast: bool, max_errors: Option<usize>) -> Self {
        Self {
            job_id: job_id.into(),
            fail_fast,
            max_errors: max_errors.filter(|&n| n > 0).unwrap_or(usize::MAX),
            records: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            phase_counts: Default::default(),
            stopped: AtomicBool::new(false),
            callback: None,
        }
    }

    pub fn with_callback(mut self, cb: Option<Arc<dyn ErrorCallback<T>>>) -> Self {
        self.callback = cb;
        self
    }

    /// Append `rec` and return whether the job should stop.
    pub fn record(&self, rec: ErrorRecord<T>) -> bool {
        let phase = rec.phase();
        let desc = rec.short_description();

        let count = self.total.fetch_add(1, Ordering::AcqRel) + 1;
        self.phase_counts[phase.index()].fetch_add(1, Ordering::Relaxed);

        let mut stop = self.fail_fast || count >= self.max_errors || self.is_stopped();

        // Not under the records lock: callbacks may call back into the governor.
        if let Some(cb) = &self.callback {
            if !cb.on_error(&rec, count, phase) {
                stop = true;
            }
        }

        self.records.lock().push(rec);

        if stop {
            self.stopped.store(true, Ordering::Release);
            if self.max_errors == usize::MAX {
                tracing::error!("[{}] stopping after error #{}: {}", self.job_id, count, desc);
            } else {
                tracing::error!("[{}] error limit reached ({}/{}): {}", self.job_id, count, self.max_errors, desc);
            }
        } else {
            tracing::warn!("[{}] recorded error #{}: {}", self.job_id, count, desc);
        }
        stop
    }

    /// Latched once any `record` call returned `true`.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn phase_count(&self, phase: Phase) -> usize {
        self.phase_counts[phase.index()].load(Ordering::Relaxed)
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Human-readable summary: totals, per-phase buckets, first few samples.
    pub fn report(&self) -> String {
        let guard = self.records.lock();
        if guard.is_empty() {
            return "no errors".to_string();
        }

        let mut out = String::new();
        let _ = writeln!(out, "error report [job: {}]", self.job_id);
        let _ = writeln!(out, "total errors: {}", self.error_count());
        let _ = writeln!(out);
        let _ = writeln!(out, "errors by phase:");
        for phase in Phase::ALL {
            let n = self.phase_count(phase);
            if n > 0 {
                let _ = writeln!(out, "- {}: {}", phase, n);
            }
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "sample (first {}):", REPORT_SAMPLE);
        for (i, rec) in guard.iter().take(REPORT_SAMPLE).enumerate() {
            let ts = rec.timestamp().format(&Rfc3339).unwrap_or_default();
            let row = if rec.row_index() >= 0 { rec.row_index().to_string() } else { "unknown".to_string() };
            let _ = writeln!(
                out,
                "{}. [{}] phase: {}-{}, source: {}, row: {}\n   message: {}",
                i + 1,
                ts,
                rec.phase(),
                rec.step(),
                if rec.source().is_empty() { "-" } else { rec.source() },
                row,
                rec.message()
            );
        }
        if guard.len() > REPORT_SAMPLE {
            let _ = writeln!(out, "... {} more not shown ...", guard.len() - REPORT_SAMPLE);
        }
        out
    }

    /// Move the collected records out, leaving the counters untouched.
    pub fn take_records(&self) -> Vec<ErrorRecord<T>> {
        std::mem::take(&mut *self.records.lock())
    }
}
