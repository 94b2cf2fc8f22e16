// Detector worker process: `detector_worker <input> <output>`
// Exit 0 with a final record; 2 (input), 3 (write) or 4 (policy) otherwise.

use std::path::PathBuf;
use std::process::ExitCode;
use synthscope::services::config_store::{AppConfig, ConfigStore};
use synthscope::services::detection::DetectionEngine;
use synthscope::services::worker::run_worker;
use tracing::{error, warn};

const EXIT_USAGE: u8 = 64;

fn load_config() -> AppConfig {
    let Some(store) = ConfigStore::from_env() else {
        return AppConfig::default();
    };
    match store.load() {
        Ok(config) => config,
        Err(e) => {
            warn!("[WORKER] {}; using defaults", e);
            AppConfig::default()
        }
    }
}

fn main() -> ExitCode {
    synthscope::init_worker_logging();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage:\n  detector_worker <input_path> <output_path>");
        return ExitCode::from(EXIT_USAGE);
    }
    let (input, output) = (PathBuf::from(&args[1]), PathBuf::from(&args[2]));

    // config is only read once the Started record is on disk
    match run_worker(&input, &output, || DetectionEngine::from_config(&load_config())) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[WORKER] {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
