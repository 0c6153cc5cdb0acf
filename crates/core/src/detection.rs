//! Supervision of the external detection worker.
//!
//! One worker process is spawned per [`DetectionJob`] as
//! `program [args...] <input> <output>`. Its stdout is relayed to the job's
//! notification session as it is written; stderr is only logged. Exit code 0
//! means the output file was written.

use std::collections::VecDeque;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DetectorConfig;
use crate::logging::{DETECTOR_STDERR_TARGET, DETECTOR_STDOUT_TARGET};
use crate::notify::{NotificationEvent, NotificationHub};
use crate::storage::{Storage, UploadedAsset};

const STDERR_TAIL_LINES: usize = 20;
/// Upper bound on one relayed stdout segment.
pub const MAX_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("failed to start detection worker '{program}': {source}")]
    Spawn { program: String, source: io::Error },
    #[error("failed to read detection worker output: {0}")]
    Io(#[from] io::Error),
    #[error("detection worker exited with {}{}", describe_code(.code), describe_stderr(.stderr))]
    Exited { code: Option<i32>, stderr: String },
    #[error("detection was cancelled")]
    Cancelled,
    #[error("detection timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl DetectionError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code, .. } => *code,
            _ => None,
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn describe_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// One invocation's worth of inputs. Not `Clone`: handing it to
/// [`DetectionInvoker::invoke`] consumes it, so a job runs at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct DetectionJob {
    pub filename: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub session_id: Option<String>,
}

impl DetectionJob {
    /// Both paths share the asset's generated name, under the uploads and
    /// detected roots respectively.
    pub fn for_asset(storage: &Storage, asset: &UploadedAsset, session_id: Option<String>) -> Self {
        Self {
            filename: asset.generated_name.clone(),
            input_path: asset.storage_path.clone(),
            output_path: storage.detected_path(asset),
            session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Running { pid: Option<u32> },
    Exited(WorkerExit),
}

/// A live worker process.
///
/// Output is pulled with [`next_chunk`] until it returns `None`; [`wait`] then
/// yields the single terminal result. The process is killed if the run is
/// dropped early.
///
/// [`next_chunk`]: DetectionRun::next_chunk
/// [`wait`]: DetectionRun::wait
pub struct DetectionRun {
    child: Child,
    stdout: Option<BufReader<ChildStdout>>,
    stderr_tail: Option<JoinHandle<String>>,
    state: WorkerState,
    filename: String,
}

impl DetectionRun {
    pub fn spawn(detector: &DetectorConfig, job: &DetectionJob) -> Result<Self, DetectionError> {
        let mut state = WorkerState::Spawning;
        debug!(filename = %job.filename, ?state, "Starting detection worker");

        let mut command = Command::new(&detector.program);
        command
            .args(&detector.args)
            .arg(&job.input_path)
            .arg(&job.output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = detector.working_dir.as_deref() {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| DetectionError::Spawn {
            program: detector.program.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().map(BufReader::new);
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, job.filename.clone())));

        state = WorkerState::Running { pid: child.id() };
        info!(
            filename = %job.filename,
            program = %detector.program.display(),
            ?state,
            "Detection worker started"
        );

        Ok(Self {
            child,
            stdout,
            stderr_tail,
            state,
            filename: job.filename.clone(),
        })
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Next stdout segment, available as soon as the worker writes it.
    ///
    /// Buffered output is split after each newline; output without a newline
    /// is returned as-is rather than held back. Segments never exceed
    /// [`MAX_CHUNK_BYTES`].
    pub async fn next_chunk(&mut self) -> Result<Option<String>, DetectionError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let available = stdout.fill_buf().await?;
        if available.is_empty() {
            self.stdout = None;
            return Ok(None);
        }
        let take = segment_len(available);
        let chunk = String::from_utf8_lossy(&available[..take]).into_owned();
        stdout.consume(take);

        debug!(target: DETECTOR_STDOUT_TARGET, filename = %self.filename, "{}", chunk.trim_end());
        Ok(Some(chunk))
    }

    pub async fn wait(&mut self) -> Result<WorkerExit, DetectionError> {
        if let WorkerState::Exited(exit) = self.state {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        Ok(self.mark_exited(status))
    }

    /// Kill the worker and reap it.
    pub async fn kill(&mut self) -> Result<WorkerExit, DetectionError> {
        if let WorkerState::Exited(exit) = self.state {
            return Ok(exit);
        }
        if let Err(error) = self.child.start_kill() {
            warn!(filename = %self.filename, error = %error, "Failed to signal detection worker");
        }
        let status = self.child.wait().await?;
        Ok(self.mark_exited(status))
    }

    /// Collected stderr lines, once the worker has exited.
    pub async fn stderr_tail(&mut self) -> String {
        match self.stderr_tail.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        }
    }

    fn mark_exited(&mut self, status: ExitStatus) -> WorkerExit {
        let exit = WorkerExit {
            code: status.code(),
        };
        self.state = WorkerState::Exited(exit);
        exit
    }
}

/// Bytes of `available` that form the next segment: through the first
/// newline if there is one, otherwise everything up to [`MAX_CHUNK_BYTES`],
/// stopping short of a UTF-8 sequence cut off at the end of the buffer.
fn segment_len(available: &[u8]) -> usize {
    let window = &available[..available.len().min(MAX_CHUNK_BYTES)];
    if let Some(newline) = window.iter().position(|&b| b == b'\n') {
        return newline + 1;
    }

    match std::str::from_utf8(window) {
        Err(error) if error.error_len().is_none() && error.valid_up_to() > 0 => {
            error.valid_up_to()
        }
        _ => window.len(),
    }
}

async fn drain_stderr<R>(stderr: R, filename: String) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: DETECTOR_STDERR_TARGET, filename = %filename, "{}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(target: DETECTOR_STDERR_TARGET, filename = %filename, "read error: {}", e);
                break;
            }
        }
    }
    Vec::from(tail).join("\n")
}

/// Runs detection jobs and relays their output to the notification hub.
#[derive(Clone)]
pub struct DetectionInvoker {
    detector: DetectorConfig,
    notifications: Arc<NotificationHub>,
}

impl DetectionInvoker {
    pub fn new(detector: DetectorConfig, notifications: Arc<NotificationHub>) -> Self {
        Self {
            detector,
            notifications,
        }
    }

    /// Run `job` to completion. The worker is killed if `cancel` fires or
    /// the returned future is dropped.
    pub async fn invoke(
        &self,
        job: DetectionJob,
        cancel: &CancellationToken,
    ) -> Result<WorkerExit, DetectionError> {
        let mut run = DetectionRun::spawn(&self.detector, &job)?;

        let mut chunks = 0usize;
        let cancelled = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = run.next_chunk() => Some(chunk),
            };
            match step {
                None => break true,
                Some(Ok(Some(data))) => {
                    chunks += 1;
                    self.notify(
                        &job,
                        NotificationEvent::DetectionData {
                            filename: job.filename.clone(),
                            data,
                        },
                    );
                }
                Some(Ok(None)) => break false,
                Some(Err(error)) => return Err(error),
            }
        };

        let exit = if cancelled {
            None
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                exit = run.wait() => Some(exit?),
            }
        };

        let Some(exit) = exit else {
            let killed = run.kill().await?;
            warn!(filename = %job.filename, code = ?killed.code, "Detection worker killed on cancellation");
            self.notify_complete(&job, killed);
            return Err(DetectionError::Cancelled);
        };

        let stderr = run.stderr_tail().await;
        self.notify_complete(&job, exit);

        if exit.success() {
            info!(filename = %job.filename, chunks, "Detection worker finished");
            Ok(exit)
        } else {
            error!(filename = %job.filename, code = ?exit.code, "Detection worker failed");
            Err(DetectionError::Exited {
                code: exit.code,
                stderr,
            })
        }
    }

    fn notify(&self, job: &DetectionJob, event: NotificationEvent) {
        if let Some(session_id) = job.session_id.as_deref() {
            self.notifications.send(session_id, event);
        }
    }

    fn notify_complete(&self, job: &DetectionJob, exit: WorkerExit) {
        self.notify(
            job,
            NotificationEvent::DetectionComplete {
                filename: job.filename.clone(),
                success: exit.success(),
                exit_code: exit.code,
            },
        );
    }
}

/// Locate the worker executable. Paths with a directory component must point
/// at a file; bare names are looked up on `PATH`.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }

    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .flat_map(|dir| candidate_binary_names(program).into_iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn candidate_binary_names(program: &Path) -> Vec<PathBuf> {
    vec![program.to_path_buf()]
}

#[cfg(windows)]
fn candidate_binary_names(program: &Path) -> Vec<PathBuf> {
    if program.extension().is_some() {
        return vec![program.to_path_buf()];
    }
    ["exe", "cmd", "bat"]
        .iter()
        .map(|ext| program.with_extension(ext))
        .chain(std::iter::once(program.to_path_buf()))
        .collect()
}
