use anyhow::{bail, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tabmerge::{
    default_source_pattern, discover_sources, init_tracing_once, JobConfig, JsonKey, JsonLinesCodec, JsonMerge,
    MergeJob,
};

const DATA_ROOT: &str = "./data";
const OUTPUT: &str = "./merged/merged.jsonl";
const KEY_FIELD: &str = "id";

fn main() -> Result<()> {
    init_tracing_once();

    let data_root = PathBuf::from(DATA_ROOT);
    let sources = discover_sources(&data_root, &default_source_pattern()?, 1);
    if sources.is_empty() {
        bail!("no .jsonl/.ndjson(.zst) files under {}", data_root.display());
    }
    println!("Merging {} files into {}", sources.len(), OUTPUT);

    let hw = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    let config = JobConfig::<Value>::new(&sources, OUTPUT)
        .with_key_extractor(JsonKey::field(KEY_FIELD))
        .with_merge_fn(JsonMerge::Overlay)
        .with_max_concurrent_files(hw.min(4))
        .with_max_errors(1000)
        .with_error_export(None)
        .with_progress_bars(true);

    let result = MergeJob::new(config, Arc::new(JsonLinesCodec::<Value>::new())).run();
    println!("{}", result.summary());
    if let Some(report) = &result.error_report {
        println!("{}", report);
    }
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
