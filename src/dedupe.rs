use crate::error::MergeError;
use crate::governor::{ErrorGovernor, ErrorRecord, Phase};
use crate::key_extractor::{KeyExtractor, MergeFn};
use ahash::AHashMap;
use anyhow::Result;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Below this many rows keys are extracted on the calling thread.
const PAR_KEY_MIN_ROWS: usize = 1024;

/// Key -> record map that remembers first-seen order.
pub struct UniqueKeyMap<T> {
    index: AHashMap<String, usize>,
    entries: Vec<(String, T)>,
}

impl<T> Default for UniqueKeyMap<T> {
    fn default() -> Self {
        Self { index: AHashMap::new(), entries: Vec::new() }
    }
}

impl<T> UniqueKeyMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self { index: AHashMap::with_capacity(n), entries: Vec::with_capacity(n) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    /// Insert `incoming` under `key`, or combine it with the record already
    /// there via `merge`. On merge failure the stored record is left as is
    /// and `incoming` is handed back with the error.
    pub fn fold_with<E>(
        &mut self,
        key: String,
        incoming: T,
        merge: impl FnOnce(&T, &T) -> Result<T, E>,
    ) -> Result<(), (T, E)> {
        match self.index.get(&key) {
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, incoming));
                Ok(())
            }
            Some(&i) => match merge(&self.entries[i].1, &incoming) {
                Ok(merged) => {
                    self.entries[i].1 = merged;
                    Ok(())
                }
                Err(e) => Err((incoming, e)),
            },
        }
    }

    /// Keep the existing record if `key` is already present.
    pub fn insert_if_absent(&mut self, key: String, record: T) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, record));
        true
    }

    /// Records in first-seen order.
    pub fn into_records(self) -> Vec<T> {
        self.entries.into_iter().map(|(_, v)| v).collect()
    }

    pub fn into_entries(self) -> Vec<(String, T)> {
        self.entries
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub rows_in: u64,
    pub null_keys: u64,
    pub key_errors: u64,
    pub folded: u64,
    /// Per-file entries folded into the job map when files are sealed.
    pub sealed: u64,
    pub merge_errors: u64,
}

impl FoldStats {
    fn absorb(&mut self, o: FoldStats) {
        self.rows_in += o.rows_in;
        self.null_keys += o.null_keys;
        self.key_errors += o.key_errors;
        self.folded += o.folded;
        self.sealed += o.sealed;
        self.merge_errors += o.merge_errors;
    }
}

/// Key extraction + merge, with failures routed through the error governor.
///
/// - a record without a key is dropped silently.
/// - a key-extraction error is recorded and the record dropped.
/// - a merge error is recorded and the existing record kept.
/// - without a merge function the first-seen record wins.
pub struct DedupStage<T> {
    job_id: String,
    key: Arc<dyn KeyExtractor<T>>,
    merge: Option<Arc<dyn MergeFn<T>>>,
    governor: Arc<ErrorGovernor<T>>,
}

impl<T: Clone + Send + Sync> DedupStage<T> {
    pub fn new(
        job_id: impl Into<String>,
        key: Arc<dyn KeyExtractor<T>>,
        merge: Option<Arc<dyn MergeFn<T>>>,
        governor: Arc<ErrorGovernor<T>>,
    ) -> Self {
        Self { job_id: job_id.into(), key, merge, governor }
    }

    fn abort(&self) -> anyhow::Error {
        MergeError::aborted(Phase::Process, "error governor stopped deduplication").into()
    }

    /// Fold `rows` into `map` in input order. Keys are extracted in parallel
    /// for larger inputs; folding is always sequential.
    pub fn fold_rows(&self, map: &mut UniqueKeyMap<T>, rows: Vec<T>) -> Result<FoldStats> {
        let mut stats = FoldStats { rows_in: rows.len() as u64, ..Default::default() };
        if self.governor.is_stopped() {
            return Err(self.abort());
        }

        let keys: Vec<Result<Option<String>>> = if rows.len() >= PAR_KEY_MIN_ROWS {
            rows.par_iter().map(|r| self.key.key(r)).collect()
        } else {
            rows.iter().map(|r| self.key.key(r)).collect()
        };

        for (row, key) in rows.into_iter().zip(keys) {
            match key {
                Ok(Some(k)) => self.fold_one(map, k, row, &mut stats)?,
                Ok(None) => stats.null_keys += 1,
                Err(e) => {
                    stats.key_errors += 1;
                    let rec = ErrorRecord::process_error("key", "failed to extract dedup key")
                        .with_record(row)
                        .with_cause(e);
                    if self.governor.record(rec) {
                        return Err(self.abort());
                    }
                }
            }
        }
        Ok(stats)
    }

    fn fold_one(&self, map: &mut UniqueKeyMap<T>, key: String, row: T, stats: &mut FoldStats) -> Result<()> {
        let Some(m) = &self.merge else {
            map.insert_if_absent(key, row);
            stats.folded += 1;
            return Ok(());
        };
        match map.fold_with(key, row, |a, b| m.merge(a, b)) {
            Ok(()) => {
                stats.folded += 1;
                Ok(())
            }
            Err((incoming, e)) => {
                stats.merge_errors += 1;
                let rec = ErrorRecord::process_error("merge", "failed to merge records sharing a key")
                    .with_record(incoming)
                    .with_cause(e);
                if self.governor.record(rec) {
                    return Err(self.abort());
                }
                Ok(())
            }
        }
    }

    /// Fold every entry of `from` into `into`, preserving `from`'s order.
    pub fn merge_maps(&self, into: &mut UniqueKeyMap<T>, from: UniqueKeyMap<T>) -> Result<FoldStats> {
        let mut stats = FoldStats::default();
        for (k, v) in from.into_entries() {
            stats.rows_in += 1;
            self.fold_one(into, k, v, &mut stats)?;
        }
        Ok(stats)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// Cross-file deduplication for concurrent readers.
///
/// Each file folds into its own map; sealed files are folded into the job map
/// in ascending file index, so the result does not depend on thread timing.
pub struct FileMaps<T> {
    per_file: Mutex<BTreeMap<usize, Arc<Mutex<UniqueKeyMap<T>>>>>,
    merged: Mutex<UniqueKeyMap<T>>,
    stats: Mutex<FoldStats>,
}

impl<T> Default for FileMaps<T> {
    fn default() -> Self {
        Self { per_file: Mutex::new(BTreeMap::new()), merged: Mutex::new(UniqueKeyMap::new()), stats: Mutex::new(FoldStats::default()) }
    }
}

impl<T: Clone + Send + Sync> FileMaps<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, file_index: usize) -> Arc<Mutex<UniqueKeyMap<T>>> {
        self.per_file.lock().entry(file_index).or_default().clone()
    }

    pub fn fold_batch(&self, stage: &DedupStage<T>, file_index: usize, rows: Vec<T>) -> Result<()> {
        let slot = self.slot(file_index);
        let mut map = slot.lock();
        let s = stage.fold_rows(&mut map, rows)?;
        self.stats.lock().absorb(s);
        Ok(())
    }

    /// Fold the maps of `files` into the job map, lowest index first.
    pub fn seal_files(&self, stage: &DedupStage<T>, files: &[usize]) -> Result<()> {
        let mut order = files.to_vec();
        order.sort_unstable();
        for i in order {
            let slot = self.per_file.lock().remove(&i);
            if let Some(slot) = slot {
                let map = std::mem::take(&mut *slot.lock());
                let mut merged = self.merged.lock();
                let s = stage.merge_maps(&mut merged, map)?;
                tracing::debug!(
                    "[{}] folded file #{} into job map ({} keys so far)",
                    stage.job_id(),
                    i,
                    merged.len()
                );
                let mut stats = self.stats.lock();
                stats.sealed += s.folded;
                stats.merge_errors += s.merge_errors;
            }
        }
        Ok(())
    }

    /// Seal whatever is left and return the deduplicated records.
    pub fn finish(&self, stage: &DedupStage<T>) -> Result<Vec<T>> {
        let pending: Vec<usize> = self.per_file.lock().keys().copied().collect();
        self.seal_files(stage, &pending)?;
        let map = std::mem::take(&mut *self.merged.lock());
        Ok(map.into_records())
    }

    pub fn stats(&self) -> FoldStats {
        *self.stats.lock()
    }
}
