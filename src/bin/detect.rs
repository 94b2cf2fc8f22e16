use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use std::time::Duration;
use synthscope::services::config_store::{AppConfig, ConfigStore};
use synthscope::services::intake::classify_upload;
use synthscope::services::supervisor::{resolve_worker_binary, Supervisor};
use tracing::info;

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn open_store(args: &[String]) -> Option<ConfigStore> {
    match parse_arg_value(args, "--config-dir") {
        Some(dir) => Some(ConfigStore::new(PathBuf::from(dir))),
        None => ConfigStore::from_env(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage:\n  detect <image_path> [--timeout <secs>] [--content-type <mime>] [--worker <path>] [--config-dir <dir>] [--out <json_path>]\n  detect --write-default-config [--config-dir <dir>]\n\nNotes:\n  - Without --content-type the file is sniffed for a known image format.\n  - SYNTHSCOPE_WORKER_BIN selects the worker when --worker is absent."
        );
        return Ok(());
    }

    synthscope::init_logging();
    let store = open_store(&args);

    if has_flag(&args, "--write-default-config") {
        let Some(store) = store else {
            bail!("no configuration directory available");
        };
        store
            .save(&AppConfig::default())
            .map_err(anyhow::Error::msg)?;
        println!("Wrote {}", store.config_dir().join("config.json").display());
        return Ok(());
    }

    let config = match &store {
        Some(store) => store.load().map_err(anyhow::Error::msg)?,
        None => AppConfig::default(),
    };

    let path = args[1].clone();
    let timeout_secs: u64 = parse_arg_value(&args, "--timeout")
        .and_then(|s| s.parse().ok())
        .unwrap_or(config.detection.timeout_secs);
    let content_type = parse_arg_value(&args, "--content-type");
    let out_path = parse_arg_value(&args, "--out");

    let bytes = std::fs::read(&path).with_context(|| format!("read file failed: {}", path))?;
    let blob = classify_upload(content_type.as_deref(), bytes)?;

    let mut supervisor = match parse_arg_value(&args, "--worker") {
        Some(worker) => Supervisor::new(resolve_worker_binary(Some(Path::new(&worker)))),
        None => Supervisor::from_config(&config),
    };
    if let Some(store) = &store {
        supervisor = supervisor.with_config_dir(store.config_dir());
    }
    info!("Worker: {}", supervisor.program().display());

    let result = supervisor
        .submit(&blob, Duration::from_secs(timeout_secs))
        .await?;

    let json = serde_json::to_string_pretty(&result)?;
    println!("{}", json);
    println!();
    println!("Verdict: {} ({:.1}%)", result.verdict, result.confidence * 100.0);

    if let Some(out) = out_path {
        std::fs::write(&out, &json).with_context(|| format!("write output failed: {}", out))?;
        println!("Saved: {}", out);
    }

    Ok(())
}
