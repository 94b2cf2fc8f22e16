// Detection Supervisor
// Runs every detection in its own worker process under a hard wall-clock timeout.
// Worker crashes, hangs and garbage output all come back as a Failed record; only
// problems on this side of the process boundary surface as `SupervisorError`.

use crate::models::{FusionResult, MediaBlob, MediaKind, RunStatus};
use crate::services::config_store::{AppConfig, CONFIG_DIR_ENV};
use crate::services::result_writer::read_record;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variable naming the worker executable.
pub const WORKER_BIN_ENV: &str = "SYNTHSCOPE_WORKER_BIN";
pub const WORKER_BIN_NAME: &str = "detector_worker";

/// How long a killed worker gets to be reaped before its scratch space is removed anyway.
const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("timeout must be positive, got {0:?}")]
    InvalidTimeout(Duration),
    #[error("unsupported media kind: {0}")]
    UnsupportedMediaKind(&'static str),
    #[error("failed to prepare work item storage: {0}")]
    Storage(#[source] std::io::Error),
    #[error("failed to spawn worker {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve the worker executable.
///
/// Uses the override if provided, otherwise `SYNTHSCOPE_WORKER_BIN`, then a
/// `detector_worker` next to the running executable, then the bare name on `PATH`.
pub fn resolve_worker_binary(binary_override: Option<&Path>) -> PathBuf {
    binary_override
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(WORKER_BIN_ENV).filter(|v| !v.is_empty()).map(PathBuf::from))
        .or_else(sibling_worker)
        .unwrap_or_else(|| PathBuf::from(worker_file_name()))
}

fn worker_file_name() -> String {
    format!("{}{}", WORKER_BIN_NAME, env::consts::EXE_SUFFIX)
}

fn sibling_worker() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let candidate = exe.parent()?.join(worker_file_name());
    candidate.is_file().then_some(candidate)
}

// ============ Work Item ============

/// Private scratch space of one request. Dropping it removes the directory.
struct WorkItem {
    id: Uuid,
    dir: TempDir,
    input: PathBuf,
    output: PathBuf,
}

impl WorkItem {
    async fn allocate(scratch_root: Option<&Path>, bytes: &[u8]) -> std::io::Result<Self> {
        let id = Uuid::new_v4();
        let prefix = format!("synthscope-{}-", id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let input = dir.path().join("input.bin");
        let output = dir.path().join("result.json");
        tokio::fs::write(&input, bytes).await?;
        Ok(Self { id, dir, input, output })
    }
}

// ============ Supervisor ============

#[derive(Debug, Clone)]
pub struct Supervisor {
    program: PathBuf,
    leading_args: Vec<OsString>,
    config_dir: Option<PathBuf>,
    scratch_root: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            config_dir: None,
            scratch_root: None,
        }
    }

    /// Worker taken from `config.worker.binary` or the usual resolution chain.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(resolve_worker_binary(config.worker.binary.as_deref()))
    }

    /// Arguments placed before the input and output paths, for wrapping the worker.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Configuration directory handed to the worker through `SYNTHSCOPE_CONFIG_DIR`.
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Parent directory for per-request scratch space; the system temp dir otherwise.
    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run one detection in a fresh worker, waiting at most `timeout` for it.
    pub async fn submit(&self, blob: &MediaBlob, timeout: Duration) -> Result<FusionResult, SupervisorError> {
        if timeout.is_zero() {
            return Err(SupervisorError::InvalidTimeout(timeout));
        }
        if blob.kind() != MediaKind::Image {
            return Err(SupervisorError::UnsupportedMediaKind(blob.kind().as_str()));
        }

        let item = WorkItem::allocate(self.scratch_root.as_deref(), blob.bytes())
            .await
            .map_err(SupervisorError::Storage)?;
        let started = Instant::now();
        info!(
            "[SUPERVISOR] {} submitted ({} bytes, timeout {:?})",
            item.id,
            blob.size(),
            timeout
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg(&item.input)
            .arg(&item.output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.config_dir {
            command.env(CONFIG_DIR_ENV, dir);
        }
        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let result = match waited {
            Ok(Ok(status)) => collect(&item, status),
            Ok(Err(e)) => {
                warn!("[SUPERVISOR] {} lost track of worker: {}", item.id, e);
                terminate(&mut child, item.id).await;
                FusionResult::failed(format!("failed to wait for worker: {}", e))
            }
            Err(_) => {
                warn!("[SUPERVISOR] {} timed out after {:?}, killing worker", item.id, timeout);
                terminate(&mut child, item.id).await;
                FusionResult::failed(format!("timed out after {} ms", timeout.as_millis()))
            }
        };

        info!(
            "[SUPERVISOR] {} finished status={:?} verdict={} in {} ms",
            item.id,
            result.status,
            result.verdict,
            started.elapsed().as_millis()
        );
        // the worker goes before its scratch directory
        drop(child);
        let scratch = item.dir.path().to_path_buf();
        drop(item);
        debug!("[SUPERVISOR] removed {}", scratch.display());
        Ok(result)
    }
}

// Kill a worker that is still running and reap it.
async fn terminate(child: &mut Child, id: Uuid) {
    if let Err(e) = child.start_kill() {
        debug!("[SUPERVISOR] {} kill skipped: {}", id, e);
    }
    match tokio::time::timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!("[SUPERVISOR] {} worker reaped: {}", id, status),
        Ok(Err(e)) => warn!("[SUPERVISOR] {} reap failed: {}", id, e),
        Err(_) => warn!("[SUPERVISOR] {} worker still running after {:?}", id, REAP_GRACE),
    }
}

// Interpret a worker that exited on its own.
fn collect(item: &WorkItem, status: ExitStatus) -> FusionResult {
    if !status.success() {
        warn!("[SUPERVISOR] {} worker crashed: {}", item.id, status);
        return FusionResult::failed(format!("worker exited abnormally ({})", status));
    }
    match read_record(&item.output) {
        Ok(record) if record.status == RunStatus::Started => {
            warn!("[SUPERVISOR] {} worker exited before its final write", item.id);
            FusionResult::failed("worker exited without a final record")
        }
        Ok(record) => record,
        Err(e) => {
            warn!("[SUPERVISOR] {} unusable record: {}", item.id, e);
            FusionResult::failed(format!("unusable result record: {}", e))
        }
    }
}
