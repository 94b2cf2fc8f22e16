// Detector Worker
// One detection run for exactly one input: Started record, extraction, fusion, final record.
// Everything between the two writes sits behind a single failure boundary.

use crate::models::{FusionResult, MediaBlob, RunStatus};
use crate::services::detection::{DetectionEngine, PolicyError};
use crate::services::extractors::panic_message;
use crate::services::result_writer::{ResultSink, ResultWriteError};
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

/// Exit code when the input could not be read.
pub const EXIT_INPUT: i32 = 2;
/// Exit code when the result record could not be written.
pub const EXIT_WRITE: i32 = 3;
/// Exit code when the configured detection policy is invalid.
pub const EXIT_POLICY: i32 = 4;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to read input {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid detection policy: {0}")]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Write(#[from] ResultWriteError),
}

impl WorkerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Input { .. } => EXIT_INPUT,
            WorkerError::Policy(_) => EXIT_POLICY,
            WorkerError::Write(_) => EXIT_WRITE,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WorkerPhase {
    Spawned,
    Extracting,
    Fusing,
    Writing,
    Exited,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerPhase::Spawned => "spawned",
            WorkerPhase::Extracting => "extracting",
            WorkerPhase::Fusing => "fusing",
            WorkerPhase::Writing => "writing",
            WorkerPhase::Exited => "exited",
        };
        f.write_str(name)
    }
}

struct PhaseLog {
    current: WorkerPhase,
}

impl PhaseLog {
    fn new() -> Self {
        info!("[WORKER] phase {}", WorkerPhase::Spawned);
        Self {
            current: WorkerPhase::Spawned,
        }
    }

    fn enter(&mut self, next: WorkerPhase) {
        info!("[WORKER] phase {} -> {}", self.current, next);
        self.current = next;
    }
}

// Extracting then Fusing. Errors and panics both come back as a Failed record.
fn detect(blob: &MediaBlob, engine: &DetectionEngine, phases: &mut PhaseLog) -> FusionResult {
    phases.enter(WorkerPhase::Extracting);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.extract(blob)));
    let outcomes = match outcome {
        Ok(Ok(outcomes)) => outcomes,
        Ok(Err(e)) => return FusionResult::failed(e.to_string()),
        Err(payload) => return FusionResult::failed(format!("extraction panicked: {}", panic_message(&*payload))),
    };

    phases.enter(WorkerPhase::Fusing);
    match panic::catch_unwind(AssertUnwindSafe(|| engine.fuse(&outcomes))) {
        Ok(result) => result,
        Err(payload) => FusionResult::failed(format!("fusion panicked: {}", panic_message(&*payload))),
    }
}

/// Run one detection from `input` into `output`.
///
/// The Started record is on disk before `build_engine` runs. Returns the status of the final
/// record. `Err` when the engine could not be built or the input could not be read (a Failed
/// record is still written in both cases), or when the sink itself could not be written.
pub fn run_worker<F>(input: &Path, output: &Path, build_engine: F) -> Result<RunStatus, WorkerError>
where
    F: FnOnce() -> Result<DetectionEngine, PolicyError>,
{
    let mut phases = PhaseLog::new();
    let sink = ResultSink::new(output);
    sink.begin()?;

    let engine = match build_engine() {
        Ok(engine) => engine,
        Err(e) => return abandon(&sink, &mut phases, WorkerError::Policy(e)),
    };

    let bytes = match fs::read(input) {
        Ok(bytes) => bytes,
        Err(source) => {
            let err = WorkerError::Input {
                path: input.to_path_buf(),
                source,
            };
            return abandon(&sink, &mut phases, err);
        }
    };

    let blob = MediaBlob::image(bytes);
    let result = detect(&blob, &engine, &mut phases);
    if let Some(reason) = &result.error {
        error!("[WORKER] detection failed: {}", reason);
    }

    phases.enter(WorkerPhase::Writing);
    sink.finish(&result)?;
    phases.enter(WorkerPhase::Exited);
    info!(
        "[WORKER] {} verdict={} confidence={:.3}",
        output.display(),
        result.verdict,
        result.confidence
    );
    Ok(result.status)
}

// Replace the Started record with a Failed one before giving up.
fn abandon(sink: &ResultSink, phases: &mut PhaseLog, err: WorkerError) -> Result<RunStatus, WorkerError> {
    error!("[WORKER] {}", err);
    phases.enter(WorkerPhase::Writing);
    sink.finish(&FusionResult::failed(err.to_string()))?;
    phases.enter(WorkerPhase::Exited);
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SignalRole, Verdict};
    use crate::services::config_store::AppConfig;
    use crate::services::detection::FusionPolicy;
    use crate::services::extractors::{
        ExtractionInput, ExtractorError, ExtractorSet, SignalExtractor, StochasticConfig,
    };
    use crate::services::preprocessing::{test_support::encoded_image, LumaPlane};
    use crate::services::result_writer::read_record;
    use image::ImageFormat;

    fn engine() -> Result<DetectionEngine, PolicyError> {
        let mut config = AppConfig::default();
        config.detection.stochastic = StochasticConfig {
            runs: 2,
            seed: Some(7),
            ..StochasticConfig::default()
        };
        config.detection.max_side = 64;
        DetectionEngine::from_config(&config)
    }

    #[test]
    fn test_completed_run_writes_final_record() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("result.json");
        fs::write(&input, encoded_image(40, 32, ImageFormat::Png)).unwrap();

        let status = run_worker(&input, &output, engine).unwrap();
        assert_eq!(status, RunStatus::Completed);
        let record = read_record(&output).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.signals.contains_key("frequency"));
    }

    #[test]
    fn test_undecodable_input_is_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("result.json");
        fs::write(&input, b"definitely not pixels").unwrap();

        let status = run_worker(&input, &output, engine).unwrap();
        assert_eq!(status, RunStatus::Failed);
        let record = read_record(&output).unwrap();
        assert_eq!(record.verdict, Verdict::Uncertain);
        assert_eq!(record.confidence, 0.0);
        assert!(record.error.is_some());
    }

    #[test]
    fn test_missing_input_still_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("result.json");

        let err = run_worker(&dir.path().join("absent"), &output, engine).unwrap_err();
        assert_eq!(err.exit_code(), EXIT_INPUT);
        let record = read_record(&output).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
    }

    #[test]
    fn test_unwritable_sink_is_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("missing").join("result.json");
        let err = run_worker(&dir.path().join("input"), &output, engine).unwrap_err();
        assert_eq!(err.exit_code(), EXIT_WRITE);
    }

    struct Exploding;

    impl SignalExtractor for Exploding {
        fn name(&self) -> &'static str {
            "frequency"
        }
        fn role(&self) -> SignalRole {
            SignalRole::Evidence
        }
        fn fallback_value(&self) -> f64 {
            0.0
        }
        fn measure(&self, _input: &ExtractionInput<'_>, _plane: &LumaPlane) -> Result<f64, ExtractorError> {
            Err(ExtractorError::Backbone("weights missing".to_string()))
        }
    }

    #[test]
    fn test_extractor_failure_degrades_to_completed() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("result.json");
        fs::write(&input, encoded_image(16, 16, ImageFormat::Png)).unwrap();

        let engine = || {
            DetectionEngine::new(
                ExtractorSet::new(vec![Box::new(Exploding)]),
                FusionPolicy::default(),
                StochasticConfig::single_pass(),
                64,
            )
        };
        assert_eq!(run_worker(&input, &output, engine).unwrap(), RunStatus::Completed);
        let record = read_record(&output).unwrap();
        assert_eq!(record.signals["frequency"], 0.0);
        assert_eq!(record.verdict, Verdict::LikelyNatural);
    }

    #[test]
    fn test_started_record_precedes_engine_build() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("result.json");
        fs::write(&input, encoded_image(16, 16, ImageFormat::Png)).unwrap();

        let status = run_worker(&input, &output, || {
            let record = read_record(&output).unwrap();
            assert_eq!(record.status, RunStatus::Started);
            engine()
        })
        .unwrap();
        assert_eq!(status, RunStatus::Completed);
    }

    #[test]
    fn test_invalid_policy_is_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("result.json");
        fs::write(&input, encoded_image(16, 16, ImageFormat::Png)).unwrap();

        let mut config = AppConfig::default();
        config.policy.evidence[0].weight = 0.9;
        let err = run_worker(&input, &output, || DetectionEngine::from_config(&config)).unwrap_err();
        assert_eq!(err.exit_code(), EXIT_POLICY);
        let record = read_record(&output).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.error.unwrap().contains("invalid detection policy"));
    }
}
