use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessExt, System, SystemExt};

pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.7;
pub const DEFAULT_CHECK_EVERY_ROWS: u64 = 50_000;
pub const DEFAULT_RECLAIM_COOLDOWN: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_PAUSE: Duration = Duration::from_secs(2);

const REFRESH_EVERY: Duration = Duration::from_millis(500);
const PAUSE_STEP: Duration = Duration::from_millis(25);

#[derive(Clone, Debug)]
pub struct MemorySettings {
    /// Usage ratio above which ingestion is paused.
    pub threshold: f64,
    pub check_every_rows: u64,
    /// Measure process RSS against this budget instead of system RAM.
    pub budget_bytes: Option<u64>,
    pub cooldown: Duration,
    pub max_pause: Duration,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MEMORY_THRESHOLD,
            check_every_rows: DEFAULT_CHECK_EVERY_ROWS,
            budget_bytes: None,
            cooldown: DEFAULT_RECLAIM_COOLDOWN,
            max_pause: DEFAULT_MAX_PAUSE,
        }
    }
}

/// Used vs. available bytes, in whichever scope the guard measures.
#[derive(Clone, Copy, Debug)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }
}

struct MemState {
    sys: System,
    pid: Option<Pid>,
    last_check: Instant,
    last: MemorySample,
    last_reclaim: Option<Instant>,
}

/// Per-job memory watcher.
/// - Refreshes at most every `REFRESH_EVERY`.
/// - Above the threshold, raises a pressure flag that makes readers back off
///   until usage drops or `max_pause` elapses; reclaim rounds respect a cooldown.
pub struct MemoryGuard {
    job_id: String,
    settings: MemorySettings,
    state: Mutex<MemState>,
    rows_since_check: AtomicU64,
    pressure: AtomicBool,
    reclaims: AtomicU64,
}

impl MemoryGuard {
    pub fn new(job_id: impl Into<String>, settings: MemorySettings) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let pid = sysinfo::get_current_pid().ok();
        Self {
            job_id: job_id.into(),
            settings,
            state: Mutex::new(MemState {
                sys,
                pid,
                last_check: Instant::now() - REFRESH_EVERY * 2,
                last: MemorySample { used_bytes: 0, total_bytes: 0 },
                last_reclaim: None,
            }),
            rows_since_check: AtomicU64::new(0),
            pressure: AtomicBool::new(false),
            reclaims: AtomicU64::new(0),
        }
    }

    fn sample_with(&self, force: bool) -> MemorySample {
        let mut st = self.state.lock();
        let now = Instant::now();
        if force || now.duration_since(st.last_check) >= REFRESH_EVERY {
            st.last = match (self.settings.budget_bytes, st.pid) {
                (Some(budget), Some(pid)) => {
                    st.sys.refresh_process(pid);
                    match st.sys.process(pid) {
                        Some(p) => MemorySample { used_bytes: p.memory(), total_bytes: budget.max(1) },
                        None => system_sample(&mut st.sys),
                    }
                }
                _ => system_sample(&mut st.sys),
            };
            st.last_check = now;
        }
        st.last
    }

    /// A recent (possibly cached) sample.
    pub fn sample(&self) -> MemorySample {
        self.sample_with(false)
    }

    pub fn usage_ratio(&self) -> f64 {
        self.sample().ratio()
    }

    pub fn under_pressure(&self) -> bool {
        self.pressure.load(Ordering::Acquire)
    }

    pub fn reclaim_count(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    /// If usage exceeds `threshold` and no reclaim ran within the cooldown,
    /// raise backpressure, wait for headroom and log usage before/after.
    /// Returns whether a reclaim round ran.
    pub fn check_and_reclaim(&self, threshold: f64) -> bool {
        let before = self.sample_with(true);
        if before.ratio() <= threshold {
            self.pressure.store(false, Ordering::Release);
            return false;
        }
        {
            let mut st = self.state.lock();
            if let Some(t) = st.last_reclaim {
                if t.elapsed() < self.settings.cooldown {
                    return false;
                }
            }
            st.last_reclaim = Some(Instant::now());
        }

        tracing::info!(
            "[{}] memory usage {:.1}% above {:.1}%; pausing ingestion",
            self.job_id,
            before.ratio() * 100.0,
            threshold * 100.0
        );
        self.pressure.store(true, Ordering::Release);
        self.wait_for_headroom();
        let after = self.sample_with(true);
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "[{}] memory reclaim: {:.1}% -> {:.1}% ({} MB -> {} MB)",
            self.job_id,
            before.ratio() * 100.0,
            after.ratio() * 100.0,
            before.used_bytes / (1024 * 1024),
            after.used_bytes / (1024 * 1024)
        );
        true
    }

    /// `check_and_reclaim` at the configured threshold.
    pub fn check_now(&self) -> bool {
        self.check_and_reclaim(self.settings.threshold)
    }

    /// Count `rows` toward the periodic check and run it when due.
    /// Between checks, honors a pressure flag raised by another thread.
    pub fn maybe_check(&self, rows: u64) -> bool {
        let every = self.settings.check_every_rows.max(1);
        let seen = self.rows_since_check.fetch_add(rows, Ordering::AcqRel) + rows;
        if seen >= every {
            self.rows_since_check.store(0, Ordering::Release);
            return self.check_now();
        }
        if self.under_pressure() {
            self.wait_for_headroom();
        }
        false
    }

    /// Cooperative backoff: sleeps in short steps while the pressure flag is
    /// set and usage stays above the threshold, for at most `max_pause`.
    pub fn wait_for_headroom(&self) {
        if !self.under_pressure() {
            return;
        }
        let started = Instant::now();
        while started.elapsed() < self.settings.max_pause {
            if self.usage_ratio() <= self.settings.threshold {
                break;
            }
            std::thread::sleep(PAUSE_STEP);
        }
        self.pressure.store(false, Ordering::Release);
    }

    /// One-line usage summary for logs.
    pub fn memory_info(&self) -> String {
        let s = self.sample();
        format!(
            "memory: {} MB used / {} MB ({:.1}%)",
            s.used_bytes / (1024 * 1024),
            s.total_bytes / (1024 * 1024),
            s.ratio() * 100.0
        )
    }
}

fn system_sample(sys: &mut System) -> MemorySample {
    sys.refresh_memory();
    MemorySample { used_bytes: sys.used_memory(), total_bytes: sys.total_memory() }
}
