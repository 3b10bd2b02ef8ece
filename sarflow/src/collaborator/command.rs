//! Collaborators backed by external programs.
//!
//! Each program receives its job as JSON on stdin and runs with the unit's
//! working directory as its current directory. The acquisition program must
//! print an [`AcquiredInputs`] document on stdout. The processing program
//! may print a [`ProcessingOutput`] document; if it prints nothing the
//! products are discovered by name (`*VV*.tif`, `*VH*.tif`).
//!
//! Batch-queue submission is supported through [`Completion::Marker`]: the
//! program only submits the job and exits, and completion is signalled by a
//! marker file appearing in the output directory.
//!
//! Processing programs also get `SARFLOW_SLOT` and, when GPUs are
//! configured, `CUDA_VISIBLE_DEVICES` for the slot they were admitted to.
//! A program that outlives its timeout is killed.

use super::{
    AcquiredInputs, AcquisitionError, AcquisitionRequest, Acquirer, ProcessingError,
    ProcessingJob, ProcessingOutput, ProcessingStatus, Processor,
};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bytes of stderr kept in error messages.
const STDERR_TAIL: usize = 2048;

/// Unit id of the job, for both programs.
pub const UNIT_ID_ENV: &str = "SARFLOW_UNIT_ID";

/// Admission slot of a processing job.
pub const SLOT_ENV: &str = "SARFLOW_SLOT";

/// GPU assigned to a processing job's slot; unset when none is configured.
pub const GPU_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// How a processing program signals completion.
#[derive(Debug, Clone)]
pub enum Completion {
    /// The program runs the job to completion before exiting.
    Exit,
    /// The program submits the job; completion is the marker file.
    Marker(MarkerPolling),
}

/// Marker-file polling parameters.
#[derive(Debug, Clone)]
pub struct MarkerPolling {
    pub file_name: String,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for MarkerPolling {
    fn default() -> Self {
        Self {
            file_name: "DONE".to_string(),
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(120),
        }
    }
}

/// Runs an acquisition program.
#[derive(Debug, Clone)]
pub struct CommandAcquirer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandAcquirer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Acquirer for CommandAcquirer {
    fn acquire<'a>(
        &'a self,
        request: &'a AcquisitionRequest,
    ) -> BoxFuture<'a, Result<AcquiredInputs, AcquisitionError>> {
        Box::pin(async move {
            let input = serde_json::to_vec(request)
                .map_err(|e| AcquisitionError::Failed(e.to_string()))?;
            tokio::fs::create_dir_all(&request.scratch_dir).await?;

            let envs = [(UNIT_ID_ENV, request.unit_id.clone())];
            let run = run_program(
                &self.program,
                &self.args,
                &envs,
                &request.scratch_dir,
                &input,
                self.timeout,
            )
            .await?;
            let output = match run {
                ProgramRun::Exited(output) => output,
                ProgramRun::TimedOut(limit) => return Err(AcquisitionError::Timeout(limit)),
            };

            if !output.status.success() {
                return Err(AcquisitionError::Failed(failure_message(&output)));
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.trim().is_empty() {
                return Err(AcquisitionError::NoScene(stderr_tail(&output)));
            }
            serde_json::from_str(stdout.trim())
                .map_err(|e| AcquisitionError::InvalidOutput(e.to_string()))
        })
    }
}

/// Runs a processing program.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
    completion: Completion,
}

impl CommandProcessor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
            completion: Completion::Exit,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    /// Environment describing the job's slot to the program.
    fn job_env(job: &ProcessingJob) -> Vec<(&'static str, String)> {
        let mut envs = vec![
            (UNIT_ID_ENV, job.unit_id.clone()),
            (SLOT_ENV, job.slot.to_string()),
        ];
        if let Some(gpu) = job.gpu_id {
            envs.push((GPU_ENV, gpu.to_string()));
        }
        envs
    }
}

impl Processor for CommandProcessor {
    fn process<'a>(
        &'a self,
        job: &'a ProcessingJob,
    ) -> BoxFuture<'a, Result<ProcessingOutput, ProcessingError>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&job.output_dir).await?;
            let deadline = self.timeout.map(|limit| (Instant::now() + limit, limit));
            let input = serde_json::to_vec(job).map_err(|e| ProcessingError::Failed(e.to_string()))?;

            let run = run_program(
                &self.program,
                &self.args,
                &Self::job_env(job),
                &job.output_dir,
                &input,
                self.timeout,
            )
            .await?;
            let output = match run {
                ProgramRun::Exited(output) => output,
                ProgramRun::TimedOut(limit) => return Err(ProcessingError::Timeout(limit)),
            };

            if !output.status.success() {
                return Err(ProcessingError::Failed(failure_message(&output)));
            }

            match &self.completion {
                Completion::Exit => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    report_or_discover(stdout.trim(), &job.output_dir)
                }
                Completion::Marker(polling) => {
                    let marker = job.output_dir.join(&polling.file_name);
                    info!(unit_id = %job.unit_id, marker = %marker.display(), "Processing submitted, waiting for marker");
                    let wait = wait_for_marker(&marker, polling);
                    match deadline {
                        Some((at, limit)) => tokio::time::timeout_at(at, wait)
                            .await
                            .map_err(|_| ProcessingError::Timeout(limit))?,
                        None => wait.await,
                    }
                    let content = tokio::fs::read_to_string(&marker).await?;
                    report_or_discover(content.trim(), &job.output_dir)
                }
            }
        })
    }
}

/// How a collaborator program run ended.
#[derive(Debug)]
enum ProgramRun {
    Exited(Output),
    /// Killed after exceeding its limit. The process has been reaped.
    TimedOut(Duration),
}

/// Runs `program` with `input` on stdin and collects its output.
///
/// A program still running after `limit` is killed and waited for before
/// this returns, so nothing it started writing outlives the call.
async fn run_program(
    program: &Path,
    args: &[String],
    envs: &[(&str, String)],
    working_dir: &Path,
    input: &[u8],
    limit: Option<Duration>,
) -> io::Result<ProgramRun> {
    debug!(program = %program.display(), dir = %working_dir.display(), "Spawning collaborator");
    let mut child = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(key, value)| (*key, value.as_str())))
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A program that ignores its input may close stdin early.
                match stdin.write_all(input).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        };
        let (_, stdout, stderr, status) =
            tokio::try_join!(feed, read_pipe(stdout), read_pipe(stderr), child.wait())?;
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    };

    let Some(limit) = limit else {
        return run.await.map(ProgramRun::Exited);
    };
    let finished = tokio::time::timeout(limit, run).await;
    match finished {
        Ok(result) => result.map(ProgramRun::Exited),
        Err(_) => {
            warn!(
                program = %program.display(),
                limit_secs = limit.as_secs_f64(),
                "Collaborator exceeded its time limit, killing it"
            );
            child.kill().await?;
            Ok(ProgramRun::TimedOut(limit))
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Polls for `marker` with exponential backoff.
async fn wait_for_marker(marker: &Path, polling: &MarkerPolling) {
    let mut interval = polling.initial_interval;
    while tokio::fs::metadata(marker).await.is_err() {
        tokio::time::sleep(interval).await;
        interval = (interval * 2).min(polling.max_interval);
    }
}

fn report_or_discover(report: &str, output_dir: &Path) -> Result<ProcessingOutput, ProcessingError> {
    if let Ok(output) = serde_json::from_str::<ProcessingOutput>(report) {
        return Ok(output);
    }
    if report.starts_with("FAILED") {
        return Ok(ProcessingOutput {
            status: ProcessingStatus::Failed,
            message: Some(report.to_string()),
            manifest: BTreeMap::new(),
            footprint: None,
        });
    }
    Ok(ProcessingOutput::completed(discover_manifest(output_dir)?))
}

/// Finds products named like `*VV*.tif` and `*VH*.tif` in `dir`.
pub(crate) fn discover_manifest(dir: &Path) -> io::Result<BTreeMap<String, PathBuf>> {
    let mut names: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    names.sort();

    let mut manifest = BTreeMap::new();
    for path in names {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let lower = name.to_lowercase();
        if !(lower.ends_with(".tif") || lower.ends_with(".tiff")) {
            continue;
        }
        for band in ["VV", "VH"] {
            if name.contains(band) {
                manifest.entry(band.to_string()).or_insert_with(|| path.clone());
            }
        }
    }
    Ok(manifest)
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    let start = trimmed.len().saturating_sub(STDERR_TAIL);
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}

fn failure_message(output: &Output) -> String {
    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let tail = stderr_tail(output);
    if tail.is_empty() {
        format!("exit status {}", code)
    } else {
        format!("exit status {}: {}", code, tail)
    }
}
