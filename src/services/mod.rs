// SynthScope Core Services
// Extraction, fusion, persistence and process supervision

pub mod config_store;
pub mod detection;
pub mod extractors;
pub mod intake;
pub mod preprocessing;
pub mod result_writer;
pub mod supervisor;
pub mod worker;

pub use config_store::*;
pub use intake::{classify_upload, IntakeError};
pub use result_writer::{read_record, validate_record, RecordError, ResultSink, ResultWriteError};
pub use supervisor::{resolve_worker_binary, Supervisor, SupervisorError};
pub use worker::{run_worker, WorkerError, WorkerPhase};

// Re-export detection module types
pub use detection::{
    fuse,
    fuse_detailed,
    DetectionEngine,
    DetectionError,
    DetectionSensitivity,
    FusionPolicy,
    VerdictBands,
};
