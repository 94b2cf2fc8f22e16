// Result Writer
// Two-phase, crash-safe persistence of result records. Every write goes to a temporary
// sibling file that is fsynced and atomically renamed over the sink, so after the first
// phase the sink always holds a complete record.

use crate::models::{FusionResult, RunStatus, Verdict, RECORD_TYPE};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ResultWriteError {
    #[error("sink {} has no parent directory", path.display())]
    NoParent { path: PathBuf },
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to persist record to {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("failed to read record {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("record is not valid JSON for the result schema: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("record violates schema: {0}")]
    Schema(String),
}

/// Output location of one worker run.
#[derive(Debug, Clone)]
pub struct ResultSink {
    path: PathBuf,
}

impl ResultSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Phase one: durable `Started` placeholder.
    pub fn begin(&self) -> Result<(), ResultWriteError> {
        self.write(&FusionResult::started())
    }

    /// Phase two: overwrite with the final record.
    pub fn finish(&self, record: &FusionResult) -> Result<(), ResultWriteError> {
        self.write(record)
    }

    fn write(&self, record: &FusionResult) -> Result<(), ResultWriteError> {
        let io_err = |source: std::io::Error| ResultWriteError::Io {
            path: self.path.clone(),
            source,
        };
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            Some(_) => PathBuf::from("."),
            None => return Err(ResultWriteError::NoParent { path: self.path.clone() }),
        };

        let content = serde_json::to_vec_pretty(record)?;
        let mut tmp = NamedTempFile::new_in(&parent).map_err(io_err)?;
        tmp.write_all(&content).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        sync_dir(&parent);

        debug!(path = %self.path.display(), status = ?record.status, "result.persisted");
        Ok(())
    }
}

// Makes the rename itself durable. Not supported on every platform, so best-effort.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Read a record and check the parts of the schema serde cannot express.
pub fn read_record(path: &Path) -> Result<FusionResult, RecordError> {
    let content = fs::read(path).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let record: FusionResult = serde_json::from_slice(&content)?;
    validate_record(&record)?;
    Ok(record)
}

pub fn validate_record(record: &FusionResult) -> Result<(), RecordError> {
    if record.record_type != RECORD_TYPE {
        return Err(RecordError::Schema(format!("unexpected type '{}'", record.record_type)));
    }
    if !record.confidence.is_finite() || !(0.0..=1.0).contains(&record.confidence) {
        return Err(RecordError::Schema(format!("confidence {} outside [0, 1]", record.confidence)));
    }
    if let Some((name, _)) = record.signals.iter().find(|(_, v)| !v.is_finite()) {
        return Err(RecordError::Schema(format!("signal '{}' is not finite", name)));
    }
    // only a completed record may carry a decision
    let undecided = record.confidence == 0.0 && record.verdict == Verdict::Uncertain;
    if record.status != RunStatus::Completed && !undecided {
        return Err(RecordError::Schema(format!(
            "{:?} record must have confidence 0 and verdict uncertain, found {} / {:?}",
            record.status, record.confidence, record.verdict
        )));
    }
    match (record.status, record.error.is_some()) {
        (RunStatus::Failed, false) => Err(RecordError::Schema("failed record without error".to_string())),
        (RunStatus::Started | RunStatus::Completed, true) => {
            Err(RecordError::Schema("error present on a non-failed record".to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_begin_writes_started_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(dir.path().join("result.json"));
        sink.begin().unwrap();
        let record = read_record(sink.path()).unwrap();
        assert_eq!(record.status, RunStatus::Started);
        assert_eq!(record.verdict, Verdict::Uncertain);
        assert_eq!(record.confidence, 0.0);
    }

    #[test]
    fn test_finish_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(dir.path().join("result.json"));
        sink.begin().unwrap();
        let mut signals = BTreeMap::new();
        signals.insert("frequency".to_string(), 0.5);
        sink.finish(&FusionResult::completed(0.61, Verdict::PossibleAi, signals)).unwrap();

        let record = read_record(sink.path()).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.confidence, 0.61);
        // no temporary siblings are left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_failed_record_carries_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(dir.path().join("result.json"));
        sink.finish(&FusionResult::failed("decode failure")).unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&fs::read(sink.path()).unwrap()).unwrap();
        assert_eq!(raw["status"], "failed");
        assert_eq!(raw["error"], "decode failure");
        assert_eq!(raw["verdict"], "uncertain");
    }

    #[test]
    fn test_sink_is_valid_after_every_phase() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(dir.path().join("result.json"));
        sink.begin().unwrap();
        for i in 0..20 {
            let record = if i % 2 == 0 {
                FusionResult::completed(i as f64 / 20.0, Verdict::Uncertain, BTreeMap::new())
            } else {
                FusionResult::failed(format!("attempt {}", i))
            };
            sink.finish(&record).unwrap();
            assert!(read_record(sink.path()).is_ok());
        }
    }

    #[test]
    fn test_missing_directory_is_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(dir.path().join("absent").join("result.json"));
        assert!(matches!(sink.begin(), Err(ResultWriteError::Io { .. })));
    }

    #[test]
    fn test_schema_violations_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");

        fs::write(&path, "{\"type\":\"image\",\"verdict\":\"uncertain\"").unwrap();
        assert!(matches!(read_record(&path), Err(RecordError::Parse(_))));

        fs::write(
            &path,
            r#"{"type":"image","verdict":"uncertain","confidence":0.0,"signals":{},"status":"failed"}"#,
        )
        .unwrap();
        assert!(matches!(read_record(&path), Err(RecordError::Schema(_))));

        fs::write(
            &path,
            r#"{"type":"video","verdict":"uncertain","confidence":0.0,"signals":{},"status":"started"}"#,
        )
        .unwrap();
        assert!(matches!(read_record(&path), Err(RecordError::Schema(_))));

        fs::write(
            &path,
            r#"{"type":"image","verdict":"possible_ai","confidence":1.5,"signals":{},"status":"completed"}"#,
        )
        .unwrap();
        assert!(matches!(read_record(&path), Err(RecordError::Schema(_))));
    }

    #[test]
    fn test_failed_record_must_be_undecided() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");

        fs::write(
            &path,
            r#"{"type":"image","verdict":"high_confidence_ai","confidence":0.9,"signals":{},"status":"failed","error":"x"}"#,
        )
        .unwrap();
        assert!(matches!(read_record(&path), Err(RecordError::Schema(_))));

        fs::write(
            &path,
            r#"{"type":"image","verdict":"possible_ai","confidence":0.0,"signals":{},"status":"failed","error":"x"}"#,
        )
        .unwrap();
        assert!(matches!(read_record(&path), Err(RecordError::Schema(_))));

        fs::write(
            &path,
            r#"{"type":"image","verdict":"uncertain","confidence":0.4,"signals":{},"status":"started"}"#,
        )
        .unwrap();
        assert!(matches!(read_record(&path), Err(RecordError::Schema(_))));

        let record = FusionResult::failed("decode failure");
        assert!(validate_record(&record).is_ok());
    }
}
