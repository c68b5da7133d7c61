use crate::codec::{RowCodec, RowEncoder, RowFault, RowVisitor};
use crate::util::{create_with_backoff, open_with_backoff};
use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::error::Category;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use zstd::stream::read::Decoder;
use zstd::stream::write::Encoder;

pub const DEFAULT_READ_BUF_BYTES: usize = 256 * 1024;
pub const DEFAULT_WRITE_BUF_BYTES: usize = 256 * 1024;
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// True for `*.zst` paths (case-insensitive).
pub fn is_zstd(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zst"))
        .unwrap_or(false)
}

/// JSON Lines codec: one serde record per line, plain or zstd-compressed
/// depending on the file extension.
pub struct JsonLinesCodec<T> {
    read_buf_bytes: usize,
    write_buf_bytes: usize,
    zstd_level: i32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self {
            read_buf_bytes: DEFAULT_READ_BUF_BYTES,
            write_buf_bytes: DEFAULT_WRITE_BUF_BYTES,
            zstd_level: DEFAULT_ZSTD_LEVEL,
            _marker: PhantomData,
        }
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_buf_bytes(mut self, n: usize) -> Self {
        self.read_buf_bytes = n;
        self
    }

    pub fn with_write_buf_bytes(mut self, n: usize) -> Self {
        self.write_buf_bytes = n;
        self
    }

    pub fn with_zstd_level(mut self, level: i32) -> Self {
        self.zstd_level = level;
        self
    }
}

/// Blank lines are skipped but still count toward row indices.
fn decode_lines<T, R>(mut reader: R, path: &Path, visitor: &mut dyn RowVisitor<T>) -> Result<()>
where
    T: DeserializeOwned,
    R: BufRead,
{
    let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut next_row: u64 = 0;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("read {} near row {}", path.display(), next_row))?;
        if n == 0 {
            break;
        }
        let row = next_row;
        next_row += 1;

        let line = match std::str::from_utf8(&buf) {
            Ok(text) => text.trim_end_matches(&['\r', '\n'][..]),
            Err(e) => {
                let err = anyhow::Error::new(e).context("line is not valid UTF-8");
                if !visitor.row_error(row, RowFault::Unreadable, err) {
                    bail!("decoding {} stopped at row {}", path.display(), row);
                }
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "null" {
            if !visitor.row_error(row, RowFault::Invalid, anyhow!("null row")) {
                bail!("decoding {} stopped at row {}", path.display(), row);
            }
            continue;
        }

        match serde_json::from_str::<T>(line) {
            Ok(rec) => visitor.record(row, rec)?,
            Err(e) => {
                let fault = match e.classify() {
                    Category::Data => RowFault::Invalid,
                    _ => RowFault::Unreadable,
                };
                if !visitor.row_error(row, fault, anyhow::Error::new(e)) {
                    bail!("decoding {} stopped at row {}", path.display(), row);
                }
            }
        }
    }
    visitor.complete()
}

impl<T> RowCodec<T> for JsonLinesCodec<T>
where
    T: DeserializeOwned + Serialize + 'static,
{
    fn decode(&self, path: &Path, visitor: &mut dyn RowVisitor<T>) -> Result<()> {
        let file = open_with_backoff(path, 16, 50).with_context(|| format!("open {}", path.display()))?;
        let cap = self.read_buf_bytes.max(8 * 1024);
        if is_zstd(path) {
            // window_log_max(31) avoids "Frame requires too much memory" on long-window frames.
            let mut decoder = Decoder::new(file).with_context(|| format!("zstd decoder for {}", path.display()))?;
            decoder.window_log_max(31)?;
            decode_lines(BufReader::with_capacity(cap, decoder), path, visitor)
        } else {
            decode_lines(BufReader::with_capacity(cap, file), path, visitor)
        }
    }

    fn create_encoder(&self, path: &Path) -> Result<Box<dyn RowEncoder<T>>> {
        let f = create_with_backoff(path, 16, 50).with_context(|| format!("create {}", path.display()))?;
        let w = BufWriter::with_capacity(self.write_buf_bytes.max(8 * 1024), f);
        let sink = if is_zstd(path) {
            let enc = Encoder::new(w, self.zstd_level).with_context(|| format!("zstd encoder for {}", path.display()))?;
            Sink::Zstd(enc)
        } else {
            Sink::Plain(w)
        };
        Ok(Box::new(JsonLinesEncoder { path: path.to_path_buf(), sink: Some(sink), scratch: Vec::new(), _marker: PhantomData }))
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Zstd(Encoder<'static, BufWriter<File>>),
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Sink::Plain(w) => w,
            Sink::Zstd(w) => w,
        }
    }
}

/// Buffered NDJSON writer; `finish` writes the zstd frame epilogue when compressed.
pub struct JsonLinesEncoder<T> {
    path: PathBuf,
    sink: Option<Sink>,
    scratch: Vec<u8>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Serialize> RowEncoder<T> for JsonLinesEncoder<T> {
    fn encode(&mut self, records: &[T]) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            bail!("encoder for {} already finished", self.path.display());
        };
        // Nothing reaches the sink unless the whole chunk serializes.
        let path = &self.path;
        let scratch = &mut self.scratch;
        scratch.clear();
        for rec in records {
            serde_json::to_writer(&mut *scratch, rec).with_context(|| format!("serialize row for {}", path.display()))?;
            scratch.push(b'\n');
        }
        sink.writer().write_all(scratch).with_context(|| format!("write {}", path.display()))
    }

    fn finish(&mut self) -> Result<()> {
        match self.sink.take() {
            None => Ok(()),
            Some(Sink::Plain(mut w)) => w.flush().with_context(|| format!("flush {}", self.path.display())),
            Some(Sink::Zstd(enc)) => {
                let mut w = enc.finish().with_context(|| format!("finish zstd {}", self.path.display()))?;
                w.flush().with_context(|| format!("flush {}", self.path.display()))
            }
        }
    }
}
