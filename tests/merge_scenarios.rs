#[path = "common/mod.rs"]
mod common;

use common::{pt, pts_by_id, read_jsonl_values, read_zst_values, write_jsonl, write_points_fixture, write_zst_lines};
use serde_json::{json, Value};
use std::fs;
use std::sync::{Arc, Mutex};
use tabmerge::{
    quick_merge, quick_merge_dedup, JobConfig, JobResult, JsonFilter, JsonKey, JsonLinesCodec, JsonMerge, MergeJob, NumCmp, Phase,
    Stage,
};

fn codec() -> Arc<JsonLinesCodec<Value>> {
    Arc::new(JsonLinesCodec::new())
}

/// Demonstrates the canonical two-file merge:
/// - A = P1:5, P2:-1, P3:3, P4:0 and B = P1:9, P5:2
/// - keep rows with pts > 0, dedup on `id`, keep the higher `pts` on collision
/// Outcome: exactly {P1:9, P3:3, P5:2} and a successful result.
#[test]
fn filter_dedup_and_merge_two_files() {
    let tmp = tempfile::tempdir().unwrap();
    let sources = write_points_fixture(tmp.path());
    let target = tmp.path().join("out").join("merged.jsonl");

    let config = JobConfig::<Value>::new(&sources, &target)
        .with_row_filter(JsonFilter::number("pts", NumCmp::Gt(0.0)))
        .with_key_extractor(JsonKey::field("id"))
        .with_merge_fn(JsonMerge::max_by("pts"))
        .with_max_concurrent_files(2);
    let result = MergeJob::new(config, codec()).run();

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.total_rows, 3);
    assert_eq!(result.rows_read, 6);
    assert_eq!(result.files_read, 2);
    assert_eq!(result.error_count, 0);
    assert_eq!(result.output.as_deref(), Some(target.as_path()));

    let out = read_jsonl_values(&target);
    assert_eq!(
        pts_by_id(&out),
        vec![("P1".to_string(), 9), ("P3".to_string(), 3), ("P5".to_string(), 2)]
    );
}

/// Demonstrates row conservation when dedup is off:
/// every row that passes the filter is written exactly once.
#[test]
fn without_dedup_every_passing_row_is_written() {
    let tmp = tempfile::tempdir().unwrap();
    let sources = write_points_fixture(tmp.path());
    let target = tmp.path().join("out.jsonl");

    let config = JobConfig::<Value>::new(&sources, &target)
        .with_filter(|v: &Value| Ok(v["pts"].as_i64().unwrap_or(0) > 0))
        .with_batch_size(1)
        .with_write_chunk_size(2);
    let result = MergeJob::new(config, codec()).run();

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.total_rows, 4);
    let mut got = pts_by_id(&read_jsonl_values(&target));
    got.sort();
    assert_eq!(
        got,
        vec![
            ("P1".to_string(), 5),
            ("P1".to_string(), 9),
            ("P3".to_string(), 3),
            ("P5".to_string(), 2)
        ]
    );
}

/// Demonstrates the convenience entry points:
/// - `quick_merge` copies every row
/// - `quick_merge_dedup` keeps the first row seen per key (file order)
#[test]
fn quick_merge_helpers() {
    let tmp = tempfile::tempdir().unwrap();
    let sources = write_points_fixture(tmp.path());

    let all = tmp.path().join("all.jsonl");
    let r: JobResult<Value> = quick_merge(&sources, &all, codec());
    assert!(r.success);
    assert_eq!(r.total_rows, 6);
    assert_eq!(read_jsonl_values(&all).len(), 6);

    let uniq = tmp.path().join("uniq.jsonl");
    let r = quick_merge_dedup(&sources, &uniq, codec(), |v: &Value| {
        Ok(v["id"].as_str().map(str::to_string))
    });
    assert!(r.success);
    let got = pts_by_id(&read_jsonl_values(&uniq));
    assert_eq!(got.len(), 5);
    assert!(got.contains(&("P1".to_string(), 5)), "first-seen P1 from file A must win");
}

/// Demonstrates zstd handling on both sides: `.jsonl.zst` sources are
/// decoded transparently and a `.zst` target is written compressed.
#[test]
fn compressed_inputs_and_output() {
    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a.jsonl.zst");
    let b = tmp.path().join("b.jsonl");
    write_zst_lines(&a, &[pt("x", 1).to_string(), pt("y", 2).to_string()]);
    write_jsonl(&b, &[pt("y", 7), pt("z", 3)]);
    let target = tmp.path().join("merged.jsonl.zst");

    let config = JobConfig::<Value>::new([&a, &b], &target)
        .with_key_extractor(JsonKey::field("id"))
        .with_merge_fn(JsonMerge::KeepLast);
    let result = MergeJob::new(config, codec()).run();

    assert!(result.success, "{:?}", result.error_message);
    let out = read_zst_values(&target);
    assert_eq!(
        pts_by_id(&out),
        vec![("x".to_string(), 1), ("y".to_string(), 7), ("z".to_string(), 3)]
    );
}

/// Demonstrates typed records through the same pipeline:
/// a serde struct instead of `serde_json::Value`, with closure callbacks.
#[test]
fn typed_records_with_closures() {
    #[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
    struct Score {
        user: String,
        score: u32,
    }

    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a.jsonl");
    let b = tmp.path().join("b.jsonl");
    write_jsonl(&a, &[json!({"user": "Ann", "score": 3}), json!({"user": "bob", "score": 8})]);
    write_jsonl(&b, &[json!({"user": "ann", "score": 5}), json!({"user": "cy", "score": 0})]);
    let target = tmp.path().join("scores.jsonl");

    let config = JobConfig::<Score>::new([&a, &b], &target)
        .with_filter(|s: &Score| Ok(s.score > 0))
        .with_dedup(|s: &Score| Ok(Some(s.user.to_lowercase())))
        .with_merge(|a: &Score, b: &Score| Ok(Score { user: a.user.clone(), score: a.score + b.score }));
    let result = MergeJob::new(config, Arc::new(JsonLinesCodec::<Score>::new())).run();

    assert!(result.success, "{:?}", result.error_message);
    let out = read_jsonl_values(&target);
    assert_eq!(out, vec![json!({"user": "Ann", "score": 8}), json!({"user": "bob", "score": 8})]);
}

/// Demonstrates milestone progress events: the callback sees 0%, 30%, 60%
/// and 100% with their stages, in that order.
#[test]
fn progress_milestones_are_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let sources = write_points_fixture(tmp.path());
    let target = tmp.path().join("out.jsonl");

    let seen: Arc<Mutex<Vec<(u64, Stage)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let config = JobConfig::<Value>::new(&sources, &target)
        .with_key_extractor(JsonKey::field("id"))
        .with_progress_fn(move |cur, total, stage, _msg| {
            if total == 100 {
                sink.lock().unwrap().push((cur, stage));
            }
        });
    let result = MergeJob::new(config, codec()).run();
    assert!(result.success);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![(0, Stage::Init), (30, Stage::Read), (60, Stage::Process), (100, Stage::Done)]
    );
}

/// Demonstrates output replacement and scratch cleanup:
/// - an existing target is replaced, not appended to
/// - the per-job work dir is gone after the run
#[test]
fn replaces_existing_target_and_cleans_scratch() {
    let tmp = tempfile::tempdir().unwrap();
    let sources = write_points_fixture(tmp.path());
    let out_dir = tmp.path().join("out");
    let target = out_dir.join("merged.jsonl");
    write_jsonl(&target, &[json!({"stale": true})]);

    let result: JobResult<Value> = quick_merge(&sources, &target, codec());
    assert!(result.success);

    let out = read_jsonl_values(&target);
    assert_eq!(out.len(), 6);
    assert!(out.iter().all(|v| v.get("stale").is_none()));
    assert!(!out_dir.join(".tabmerge_work").exists());
    let leftovers: Vec<_> = fs::read_dir(&out_dir).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(leftovers.len(), 1, "unexpected files: {:?}", leftovers);
}

/// Demonstrates error-row export:
/// - a row whose `pts` is not numeric makes the filter fail
/// - with skip_invalid_data the row is dropped from the output
/// - the row itself lands in `<stem>_errors.jsonl` next to the target
#[test]
fn filter_failures_are_exported_as_error_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("in.jsonl");
    write_jsonl(&src, &[pt("a", 1), json!({"id": "b", "pts": "lots"}), pt("c", 2)]);
    let target = tmp.path().join("merged.jsonl");

    let config = JobConfig::<Value>::new([&src], &target)
        .with_row_filter(JsonFilter::number("pts", NumCmp::Gt(0.0)))
        .with_error_export(None);
    let result = MergeJob::new(config, codec()).run();

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.total_rows, 2);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.errors[0].phase(), Phase::Process);
    assert_eq!(result.errors[0].step(), "filter");

    let errors_path = tmp.path().join("merged_errors.jsonl");
    assert_eq!(result.error_data_file.as_deref(), Some(errors_path.as_path()));
    assert_eq!(read_jsonl_values(&errors_path), vec![json!({"id": "b", "pts": "lots"})]);
    assert!(result.error_report.as_deref().unwrap().contains("process: 1"));
}

/// Demonstrates keeping invalid rows: with skip_invalid_data off, a row the
/// filter cannot judge is recorded but still written.
#[test]
fn filter_failures_keep_row_when_not_skipping() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("in.jsonl");
    write_jsonl(&src, &[pt("a", 1), json!({"id": "b", "pts": "lots"})]);
    let target = tmp.path().join("merged.jsonl");

    let config = JobConfig::<Value>::new([&src], &target)
        .with_row_filter(JsonFilter::number("pts", NumCmp::Gt(0.0)))
        .with_skip_invalid_data(false);
    let result = MergeJob::new(config, codec()).run();

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.error_count, 1);
    assert_eq!(read_jsonl_values(&target).len(), 2);
}
