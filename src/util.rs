use ahash::RandomState;
use anyhow::{Context, Result};
use std::fs;
use std::fs::File;
use std::hash::{BuildHasher, Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static INIT_ONCE: std::sync::Once = std::sync::Once::new();
pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Short, process-unique job identifier (8 hex chars) used to tag logs.
pub fn new_job_id() -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    let mut h = RandomState::new().build_hasher();
    (nanos, std::process::id(), JOB_SEQ.fetch_add(1, Ordering::Relaxed)).hash(&mut h);
    format!("{:08x}", h.finish() as u32)
}

/// Per-job scratch directory, removed (best effort) on drop.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(root: &Path, job_id: &str) -> Result<Self> {
        let path = root.join(job_id);
        fs::create_dir_all(&path).with_context(|| format!("create scratch dir {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("could not remove scratch dir {}: {}", self.path.display(), e);
            }
        }
        // The shared parent is removed only once the last job using it is gone.
        if let Some(parent) = self.path.parent() {
            let _ = fs::remove_dir(parent);
        }
    }
}

/// OS error codes worth retrying: sharing/lock violations and flaky devices,
/// mostly raised by Windows scanners and network volumes holding a handle.
const RETRIABLE_OS_ERRORS: [i32; 9] = [5, 21, 32, 33, 225, 433, 1006, 1117, 1224];

fn is_retriable_io_error(e: &io::Error) -> bool {
    e.raw_os_error().map(|c| RETRIABLE_OS_ERRORS.contains(&c)).unwrap_or(false)
}

/// Run `op` up to `tries` times, sleeping a linearly growing delay between
/// attempts that failed with a retriable error.
fn with_backoff<R>(tries: usize, delay_ms: u64, mut op: impl FnMut() -> io::Result<R>) -> io::Result<R> {
    let mut attempt = 0u64;
    loop {
        attempt += 1;
        match op() {
            Err(e) if is_retriable_io_error(&e) && attempt < tries.max(1) as u64 => {
                sleep(Duration::from_millis(delay_ms.saturating_mul(attempt)));
            }
            done => return done,
        }
    }
}

pub fn open_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> io::Result<File> {
    with_backoff(tries, delay_ms, || File::open(path))
}

pub fn create_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> io::Result<File> {
    with_backoff(tries, delay_ms, || File::create(path))
}

/// Succeeds if the file doesn't exist.
pub fn remove_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> Result<()> {
    with_backoff(tries, delay_ms, || match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
    .with_context(|| format!("remove {}", path.display()))
}

const REPLACE_TRIES: usize = 20;
const REPLACE_DELAY_MS: u64 = 50;

/// Move `src` onto `dest`, replacing it. A plain rename is atomic where the
/// platform allows replacing an existing file; otherwise `dest` is removed
/// first, and as a last resort the bytes are copied.
pub fn replace_file_atomic_backoff(src: &Path, dest: &Path) -> Result<()> {
    if with_backoff(REPLACE_TRIES, REPLACE_DELAY_MS, || fs::rename(src, dest)).is_ok() {
        return Ok(());
    }
    if dest.exists() {
        remove_with_backoff(dest, REPLACE_TRIES, REPLACE_DELAY_MS)?;
        if with_backoff(REPLACE_TRIES, REPLACE_DELAY_MS, || fs::rename(src, dest)).is_ok() {
            return Ok(());
        }
    }
    tracing::debug!("rename {} -> {} failed; copying", src.display(), dest.display());
    with_backoff(REPLACE_TRIES, REPLACE_DELAY_MS, || fs::copy(src, dest))
        .with_context(|| format!("copy {} -> {}", src.display(), dest.display()))?;
    remove_with_backoff(src, REPLACE_TRIES, REPLACE_DELAY_MS)
}
