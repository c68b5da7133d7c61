#[path = "common/mod.rs"]
mod common;

use common::{pt, read_jsonl_values, write_jsonl};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabmerge::{
    BatchProcessor, DedupStage, ErrorGovernor, FileMaps, JobConfig, JsonFilter, JsonKey, JsonLinesCodec, JsonMerge,
    MergeFn, MergeJob, NumCmp, Phase, ProgressReporter, UniqueKeyMap,
};

/// Six files whose ids overlap heavily; `v` records file and row so a
/// surviving record can be traced back to where it came from.
fn overlapping_corpus(dir: &Path) -> Vec<PathBuf> {
    (0..6)
        .map(|f| {
            let rows: Vec<Value> = (0..40)
                .map(|r| json!({ "id": format!("k{}", (r * 7 + f * 3) % 25), "pts": r, "v": format!("{}-{}", f, r) }))
                .collect();
            let p = dir.join(format!("part-{}.jsonl", f));
            write_jsonl(&p, &rows);
            p
        })
        .collect()
}

fn run(sources: &[PathBuf], target: &Path, merge: JsonMerge, concurrency: usize) -> Vec<Value> {
    let config = JobConfig::<Value>::new(sources, target)
        .with_key_extractor(JsonKey::field("id"))
        .with_merge_fn(merge)
        .with_batch_size(7)
        .with_max_concurrent_files(concurrency);
    let result = MergeJob::new(config, Arc::new(JsonLinesCodec::<Value>::new())).run();
    assert!(result.success, "{:?}", result.error_message);
    read_jsonl_values(target)
}

fn merge_fn(m: JsonMerge) -> Option<Arc<dyn MergeFn<Value>>> {
    Some(Arc::new(m))
}

fn governor() -> Arc<ErrorGovernor<Value>> {
    Arc::new(ErrorGovernor::new("test", false, None))
}

/// Demonstrates key uniqueness across concurrently read files:
/// every key appears exactly once and every key from the input survives.
#[test]
fn every_key_appears_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    let sources = overlapping_corpus(tmp.path());
    let out = run(&sources, &tmp.path().join("out.jsonl"), JsonMerge::KeepFirst, 3);

    let ids: Vec<&str> = out.iter().map(|v| v["id"].as_str().unwrap()).collect();
    let unique: HashSet<&str> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len(), "duplicate keys in output");
    assert_eq!(unique.len(), 25);
}

/// Demonstrates merge determinism: the same inputs and the same merge
/// function give byte-identical output regardless of how many files are read
/// at once. With KeepLast the winner is the last occurrence in file order.
#[test]
fn merge_result_does_not_depend_on_concurrency() {
    let tmp = tempfile::tempdir().unwrap();
    let sources = overlapping_corpus(tmp.path());

    let serial = run(&sources, &tmp.path().join("a.jsonl"), JsonMerge::KeepLast, 1);
    let parallel = run(&sources, &tmp.path().join("b.jsonl"), JsonMerge::KeepLast, 4);
    let again = run(&sources, &tmp.path().join("c.jsonl"), JsonMerge::KeepLast, 4);
    assert_eq!(serial, parallel);
    assert_eq!(parallel, again);

    // last occurrence of k0 in (file, row) order
    let mut last_for_k0 = None;
    for f in 0..6 {
        for r in 0..40 {
            if (r * 7 + f * 3) % 25 == 0 {
                last_for_k0 = Some(format!("{}-{}", f, r));
            }
        }
    }
    let k0 = serial.iter().find(|v| v["id"] == "k0").unwrap();
    assert_eq!(k0["v"].as_str(), last_for_k0.as_deref());
}

/// Demonstrates idempotence: deduplicating an already deduplicated output
/// changes nothing.
#[test]
fn dedup_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let sources = overlapping_corpus(tmp.path());
    let once_path = tmp.path().join("once.jsonl");
    let once = run(&sources, &once_path, JsonMerge::max_by("pts"), 2);
    let twice = run(&[once_path], &tmp.path().join("twice.jsonl"), JsonMerge::max_by("pts"), 2);
    assert_eq!(once, twice);
}

/// Demonstrates key edge cases in the dedup stage:
/// - rows without a key (missing or null) are dropped silently
/// - a key that is not a scalar is recorded as a process error and dropped
#[test]
fn null_keys_dropped_and_bad_keys_recorded() {
    let gov = governor();
    let stage = DedupStage::new("t", JsonKey::field("id").into_shared(), None, gov.clone());
    let mut map = UniqueKeyMap::new();
    let rows = vec![
        pt("a", 1),
        json!({ "pts": 2 }),
        json!({ "id": null, "pts": 3 }),
        json!({ "id": ["x"], "pts": 4 }),
        pt("a", 5),
    ];
    let stats = stage.fold_rows(&mut map, rows).unwrap();

    assert_eq!(stats.rows_in, 5);
    assert_eq!(stats.null_keys, 2);
    assert_eq!(stats.key_errors, 1);
    assert_eq!(map.len(), 1);
    assert_eq!(map.get("a"), Some(&pt("a", 1)), "first-seen wins without a merge function");
    assert_eq!(gov.error_count(), 1);
    assert_eq!(gov.phase_count(Phase::Process), 1);
}

/// Demonstrates merge failure handling: when the merge function errors, the
/// stored record stays and the incoming one is kept in the error record.
#[test]
fn merge_error_keeps_existing_record() {
    let gov = governor();
    let stage = DedupStage::new(
        "t",
        JsonKey::field("id").into_shared(),
        merge_fn(JsonMerge::max_by("pts")),
        gov.clone(),
    );
    let mut map = UniqueKeyMap::new();
    let bad = json!({ "id": "a", "pts": "many" });
    let stats = stage.fold_rows(&mut map, vec![pt("a", 1), bad.clone(), pt("a", 4)]).unwrap();

    assert_eq!(stats.merge_errors, 1);
    assert_eq!(map.get("a"), Some(&pt("a", 4)));
    let records = gov.take_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].step(), "merge");
    assert_eq!(records[0].record(), Some(&bad));
}

/// Demonstrates the per-file fold: batches of different files arrive
/// interleaved, but sealing folds files in index order, so file 0's record
/// for a shared key is seen first by the merge function.
#[test]
fn file_maps_fold_in_file_order() {
    let gov = governor();
    let stage = DedupStage::new("t", JsonKey::field("id").into_shared(), merge_fn(JsonMerge::KeepFirst), gov);
    let maps = FileMaps::new();

    maps.fold_batch(&stage, 2, vec![pt("a", 30), pt("c", 31)]).unwrap();
    maps.fold_batch(&stage, 0, vec![pt("a", 1)]).unwrap();
    maps.fold_batch(&stage, 1, vec![pt("b", 10), pt("a", 11)]).unwrap();
    maps.seal_files(&stage, &[2, 1, 0]).unwrap();
    let out = maps.finish(&stage).unwrap();

    assert_eq!(out, vec![pt("a", 1), pt("b", 10), pt("c", 31)]);
    let stats = maps.stats();
    assert_eq!(stats.rows_in, 5);
    assert_eq!(stats.folded, 5);
    assert_eq!(stats.sealed, 5);
}

/// Demonstrates the processor on its own: filter then dedup, processed in
/// small chunks so the chunked path is exercised.
#[test]
fn processor_filters_then_deduplicates_in_chunks() {
    let gov = governor();
    let stage = DedupStage::new("t", JsonKey::field("id").into_shared(), merge_fn(JsonMerge::max_by("pts")), gov.clone());
    let processor = BatchProcessor::new(
        "t",
        Some(JsonFilter::number("pts", NumCmp::Ge(0.0)).into_shared()),
        Some(stage),
        gov.clone(),
        true,
        Arc::new(ProgressReporter::silent()),
    )
    .with_chunk_rows(3);

    let rows: Vec<Value> = (0..20).map(|i| pt(&format!("k{}", i % 4), if i % 5 == 0 { -1 } else { i })).collect();
    let out = processor.process(rows).unwrap();

    assert_eq!(
        out,
        vec![pt("k1", 17), pt("k2", 18), pt("k3", 19), pt("k0", 16)]
    );
    assert_eq!(gov.error_count(), 0);
}

/// Demonstrates that without a dedup stage the processor only filters and
/// keeps input order.
#[test]
fn processor_without_dedup_keeps_order() {
    let processor = BatchProcessor::new(
        "t",
        Some(JsonFilter::not(JsonFilter::present("skip")).into_shared()),
        None,
        governor(),
        true,
        Arc::new(ProgressReporter::silent()),
    );
    let rows = vec![pt("a", 1), json!({ "id": "b", "skip": true }), pt("c", 3), pt("a", 4)];
    assert_eq!(processor.process(rows).unwrap(), vec![pt("a", 1), pt("c", 3), pt("a", 4)]);
}
