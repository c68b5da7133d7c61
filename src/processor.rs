//! Batch processor: filter, then deduplicate.
//!
//! Inputs above `PROCESS_CHUNK_ROWS` are handled chunk by chunk with a
//! progress event after each chunk.

use crate::dedupe::{DedupStage, UniqueKeyMap};
use crate::error::MergeError;
use crate::filters::RowFilter;
use crate::governor::{ErrorGovernor, ErrorRecord, Phase};
use crate::progress::{ProgressReporter, Stage};
use anyhow::Result;
use rayon::prelude::*;
use std::sync::Arc;

pub const PROCESS_CHUNK_ROWS: usize = 100_000;

/// Below this many rows the predicate runs on the calling thread.
const PAR_FILTER_MIN_ROWS: usize = 1024;

pub struct BatchProcessor<T> {
    job_id: String,
    filter: Option<Arc<dyn RowFilter<T>>>,
    dedup: Option<DedupStage<T>>,
    governor: Arc<ErrorGovernor<T>>,
    skip_invalid_data: bool,
    progress: Arc<ProgressReporter>,
    chunk_rows: usize,
}

impl<T: Clone + Send + Sync> BatchProcessor<T> {
    pub fn new(
        job_id: impl Into<String>,
        filter: Option<Arc<dyn RowFilter<T>>>,
        dedup: Option<DedupStage<T>>,
        governor: Arc<ErrorGovernor<T>>,
        skip_invalid_data: bool,
        progress: Arc<ProgressReporter>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            filter,
            dedup,
            governor,
            skip_invalid_data,
            progress,
            chunk_rows: PROCESS_CHUNK_ROWS,
        }
    }

    pub fn with_chunk_rows(mut self, n: usize) -> Self {
        self.chunk_rows = n.max(1);
        self
    }

    pub fn dedup_stage(&self) -> Option<&DedupStage<T>> {
        self.dedup.as_ref()
    }

    fn abort(&self, step: &str) -> anyhow::Error {
        MergeError::aborted(Phase::Process, format!("error governor stopped the job during {}", step)).into()
    }

    /// Keep the rows the predicate accepts, in input order.
    ///
    /// A predicate error is recorded; the row is then dropped when
    /// `skip_invalid_data` is set and kept otherwise.
    pub fn filter(&self, rows: Vec<T>) -> Result<Vec<T>> {
        let Some(filter) = &self.filter else {
            return Ok(rows);
        };
        if rows.len() <= self.chunk_rows {
            return self.filter_chunk(filter.as_ref(), rows);
        }

        let total = rows.len() as u64;
        let mut out = Vec::with_capacity(rows.len());
        let mut done = 0u64;
        let mut it = rows.into_iter();
        loop {
            let chunk: Vec<T> = it.by_ref().take(self.chunk_rows).collect();
            if chunk.is_empty() {
                break;
            }
            done += chunk.len() as u64;
            out.extend(self.filter_chunk(filter.as_ref(), chunk)?);
            self.progress.report(done, total, Stage::Filter, None);
        }
        tracing::debug!("[{}] filter kept {}/{} rows", self.job_id, out.len(), total);
        Ok(out)
    }

    fn filter_chunk(&self, filter: &dyn RowFilter<T>, rows: Vec<T>) -> Result<Vec<T>> {
        if self.governor.is_stopped() {
            return Err(self.abort("filtering"));
        }
        let verdicts: Vec<Result<bool>> = if rows.len() >= PAR_FILTER_MIN_ROWS {
            rows.par_iter().map(|r| filter.keep(r)).collect()
        } else {
            rows.iter().map(|r| filter.keep(r)).collect()
        };

        let mut kept = Vec::with_capacity(rows.len());
        for (row, verdict) in rows.into_iter().zip(verdicts) {
            match verdict {
                Ok(true) => kept.push(row),
                Ok(false) => {}
                Err(e) => {
                    let rec = ErrorRecord::process_error("filter", "filter predicate failed")
                        .with_record(row.clone())
                        .with_cause(e);
                    if self.governor.record(rec) {
                        return Err(self.abort("filtering"));
                    }
                    if !self.skip_invalid_data {
                        kept.push(row);
                    }
                }
            }
        }
        Ok(kept)
    }

    /// Collapse rows sharing a key. Without a dedup stage the input is returned as is.
    pub fn deduplicate(&self, rows: Vec<T>) -> Result<Vec<T>> {
        let Some(stage) = &self.dedup else {
            return Ok(rows);
        };
        let total = rows.len() as u64;
        let mut map = UniqueKeyMap::with_capacity(rows.len().min(self.chunk_rows));
        let mut done = 0u64;
        let mut it = rows.into_iter();
        loop {
            let chunk: Vec<T> = it.by_ref().take(self.chunk_rows).collect();
            if chunk.is_empty() {
                break;
            }
            done += chunk.len() as u64;
            stage.fold_rows(&mut map, chunk)?;
            if total > self.chunk_rows as u64 {
                self.progress.report(done, total, Stage::Dedup, None);
            }
        }
        tracing::debug!("[{}] dedup: {} rows -> {} unique", self.job_id, total, map.len());
        Ok(map.into_records())
    }

    /// `deduplicate(filter(rows))`.
    pub fn process(&self, rows: Vec<T>) -> Result<Vec<T>> {
        let filtered = self.filter(rows)?;
        self.deduplicate(filtered)
    }
}
