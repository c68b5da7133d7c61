//! Progress reporting: a callback seam for callers plus optional terminal bars.

use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where in the job a progress event comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    /// Files completed out of files total.
    Read,
    /// Rows read so far within one file; total is unknown (0).
    ReadRows,
    Filter,
    Dedup,
    Process,
    Write,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Read => "read",
            Stage::ReadRows => "read-rows",
            Stage::Filter => "filter",
            Stage::Dedup => "dedup",
            Stage::Process => "process",
            Stage::Write => "write",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives progress events. Called from worker threads; keep it cheap.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, current: u64, total: u64, stage: Stage, message: Option<&str>);
}

impl<F> ProgressCallback for F
where
    F: Fn(u64, u64, Stage, Option<&str>) + Send + Sync,
{
    fn on_progress(&self, current: u64, total: u64, stage: Stage, message: Option<&str>) {
        self(current, total, stage, message)
    }
}

/// Logs every event at info level.
pub struct LogProgress;

impl ProgressCallback for LogProgress {
    fn on_progress(&self, current: u64, total: u64, stage: Stage, message: Option<&str>) {
        match (total, message) {
            (0, Some(m)) => tracing::info!("[{}] {} {}", stage, current, m),
            (0, None) => tracing::info!("[{}] {}", stage, current),
            (t, Some(m)) => tracing::info!("[{}] {}/{} {}", stage, current, t, m),
            (t, None) => tracing::info!("[{}] {}/{}", stage, current, t),
        }
    }
}

/// Fans events out to the configured callback; hands out terminal bars when enabled.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    callback: Option<Arc<dyn ProgressCallback>>,
    bars: bool,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, callback: Option<Arc<dyn ProgressCallback>>, bars: bool) -> Self {
        Self { job_id: job_id.into(), callback, bars }
    }

    pub fn silent() -> Self {
        Self { job_id: String::new(), callback: None, bars: false }
    }

    #[inline]
    pub fn report(&self, current: u64, total: u64, stage: Stage, message: Option<&str>) {
        if let Some(cb) = &self.callback {
            cb.on_progress(current, total, stage, message);
        }
    }

    /// Coarse job milestone expressed as a percentage.
    pub fn milestone(&self, percent: u64, stage: Stage, message: &str) {
        tracing::info!("[{}] {:>3}% {}: {}", self.job_id, percent, stage, message);
        self.report(percent, 100, stage, Some(message));
    }

    pub fn count_bar(&self, label: &str, total: u64) -> Option<ProgressScope> {
        if self.bars {
            Some(ProgressScope::count(label, total))
        } else {
            None
        }
    }
}

fn count_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} {msg} {pos}/{len} [{bar:.cyan/blue}] {percent:>3}%  \
         it/s: {per_sec}  elapsed: {elapsed_precise}  eta: {eta_precise}",
    )
    .map(|s| s.progress_chars("█▉▊▋▌▍▎▏  "))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Thin wrapper around an `indicatif` count bar.
pub struct ProgressScope {
    pb: ProgressBar,
}

impl ProgressScope {
    pub fn count<T: Into<String>>(label: T, total: u64) -> Self {
        let pb = ProgressBar::new(total);
        pb.set_style(count_style());
        pb.enable_steady_tick(Duration::from_millis(100));
        let label = label.into();
        if !label.is_empty() {
            pb.set_message(label);
        }
        Self { pb }
    }

    #[inline]
    pub fn inc(&self, delta: u64) {
        self.pb.inc(delta);
    }

    pub fn finish<T: Into<String>>(&self, msg: T) {
        self.pb.finish_with_message(msg.into());
    }
}
