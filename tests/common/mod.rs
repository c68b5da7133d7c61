#![allow(dead_code)]

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabmerge::{JsonLinesCodec, RowCodec, RowEncoder, RowFault, RowVisitor};

/// Write raw lines (one per row) to `path`, creating parent dirs.
pub fn write_lines(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut f = File::create(path).unwrap();
    for l in lines {
        writeln!(f, "{}", l).unwrap();
    }
}

pub fn write_jsonl(path: &Path, rows: &[Value]) {
    let lines: Vec<String> = rows.iter().map(|v| v.to_string()).collect();
    write_lines(path, &lines);
}

/// Write a compressed `.zst` file containing the provided JSONL lines.
pub fn write_zst_lines(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = File::create(path).unwrap();
    let mut enc = zstd::stream::write::Encoder::new(f, 3).unwrap();
    for l in lines {
        writeln!(&mut enc, "{}", l).unwrap();
    }
    enc.finish().unwrap();
}

/// Read a JSONL file into a vector of `serde_json::Value` (skips empty lines).
pub fn read_jsonl_values(path: &Path) -> Vec<Value> {
    let f = File::open(path).unwrap();
    let r = BufReader::new(f);
    r.lines()
        .map(|l| l.unwrap())
        .filter(|s| !s.is_empty())
        .map(|s| serde_json::from_str(&s).unwrap())
        .collect()
}

pub fn read_zst_values(path: &Path) -> Vec<Value> {
    let f = File::open(path).unwrap();
    let dec = zstd::stream::read::Decoder::new(f).unwrap();
    BufReader::new(dec)
        .lines()
        .map(|l| l.unwrap())
        .filter(|s| !s.is_empty())
        .map(|s| serde_json::from_str(&s).unwrap())
        .collect()
}

pub fn pt(id: &str, pts: i64) -> Value {
    json!({ "id": id, "pts": pts })
}

/// `id -> pts` view of a set of output rows, sorted by id.
pub fn pts_by_id(rows: &[Value]) -> Vec<(String, i64)> {
    let mut v: Vec<(String, i64)> = rows
        .iter()
        .map(|r| (r["id"].as_str().unwrap().to_string(), r["pts"].as_i64().unwrap()))
        .collect();
    v.sort();
    v
}

/// The two-file fixture: A = P1:5, P2:-1, P3:3, P4:0 and B = P1:9, P5:2.
pub fn write_points_fixture(dir: &Path) -> Vec<PathBuf> {
    let a = dir.join("in").join("a.jsonl");
    let b = dir.join("in").join("b.jsonl");
    write_jsonl(&a, &[pt("P1", 5), pt("P2", -1), pt("P3", 3), pt("P4", 0)]);
    write_jsonl(&b, &[pt("P1", 9), pt("P5", 2)]);
    vec![a, b]
}

/// Wraps the JSON Lines codec and records what the pipeline does with it:
/// how many files are being decoded at once, rows delivered, chunk sizes
/// written. Can also inject whole-file and chunk failures.
pub struct InstrumentedCodec {
    inner: JsonLinesCodec<Value>,
    pub open_now: Arc<AtomicUsize>,
    pub peak_open: Arc<AtomicUsize>,
    pub rows_delivered: Arc<AtomicU64>,
    pub chunk_sizes: Arc<Mutex<Vec<usize>>>,
    pub decode_delay: Duration,
    pub fail_paths: Vec<PathBuf>,
    /// Chunks containing a row with `"fail_write": true` fail to encode.
    pub fail_write_marker: bool,
}

impl InstrumentedCodec {
    pub fn new() -> Self {
        Self {
            inner: JsonLinesCodec::new(),
            open_now: Arc::new(AtomicUsize::new(0)),
            peak_open: Arc::new(AtomicUsize::new(0)),
            rows_delivered: Arc::new(AtomicU64::new(0)),
            chunk_sizes: Arc::new(Mutex::new(Vec::new())),
            decode_delay: Duration::ZERO,
            fail_paths: Vec::new(),
            fail_write_marker: false,
        }
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.decode_delay = d;
        self
    }

    pub fn failing_on(mut self, path: &Path) -> Self {
        self.fail_paths.push(path.to_path_buf());
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_write_marker = true;
        self
    }
}

struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct CountingVisitor<'a> {
    inner: &'a mut dyn RowVisitor<Value>,
    rows: &'a AtomicU64,
}

impl RowVisitor<Value> for CountingVisitor<'_> {
    fn record(&mut self, row_index: u64, record: Value) -> Result<()> {
        self.rows.fetch_add(1, Ordering::SeqCst);
        self.inner.record(row_index, record)
    }
    fn row_error(&mut self, row_index: u64, fault: RowFault, error: anyhow::Error) -> bool {
        self.inner.row_error(row_index, fault, error)
    }
    fn complete(&mut self) -> Result<()> {
        self.inner.complete()
    }
}

impl RowCodec<Value> for InstrumentedCodec {
    fn decode(&self, path: &Path, visitor: &mut dyn RowVisitor<Value>) -> Result<()> {
        let n = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open.fetch_max(n, Ordering::SeqCst);
        let _open = OpenGuard(self.open_now.clone());
        if !self.decode_delay.is_zero() {
            std::thread::sleep(self.decode_delay);
        }
        if self.fail_paths.iter().any(|p| p == path) {
            bail!("simulated unreadable file: {}", path.display());
        }
        let mut counting = CountingVisitor { inner: visitor, rows: &self.rows_delivered };
        self.inner.decode(path, &mut counting)
    }

    fn create_encoder(&self, path: &Path) -> Result<Box<dyn RowEncoder<Value>>> {
        Ok(Box::new(FlakyEncoder {
            inner: self.inner.create_encoder(path)?,
            chunk_sizes: self.chunk_sizes.clone(),
            fail_marked: self.fail_write_marker,
        }))
    }
}

struct FlakyEncoder {
    inner: Box<dyn RowEncoder<Value>>,
    chunk_sizes: Arc<Mutex<Vec<usize>>>,
    fail_marked: bool,
}

impl RowEncoder<Value> for FlakyEncoder {
    fn encode(&mut self, records: &[Value]) -> Result<()> {
        if self.fail_marked && records.iter().any(|r| r["fail_write"] == json!(true)) {
            bail!("simulated disk error");
        }
        self.chunk_sizes.lock().unwrap().push(records.len());
        self.inner.encode(records)
    }
    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }
}
