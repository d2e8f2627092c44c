//! Process launcher: spawns an agent child process, streams its structured
//! output into a log file, and produces a completion handle.
//!
//! The log file is created and its header written **before** `launch`
//! returns, so a tailer can open the file immediately. Every line is
//! written under a mutex and flushed so tailers observe it promptly.

pub mod protocol;

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use protocol::{AgentEvent, ParseOutcome, extract_legacy_tokens, format_event, parse_line};

/// Grace period between SIGTERM and SIGKILL when cancelling a child.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to start one agent attempt.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub work_dir: PathBuf,
    pub prompt_path: PathBuf,
    pub log_path: PathBuf,
    pub attempt: i32,
}

/// Terminal result of one agent attempt.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// `None` when the process was killed before exiting normally.
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
    pub tokens_used: i64,
    pub duration: Duration,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none()
    }
}

/// Completion handle for a launched agent.
///
/// `wait()` blocks until the child terminates and is idempotent across
/// calls: the first caller drives the join, later callers observe the
/// cached outcome.
pub struct RunHandle {
    outcome: tokio::sync::OnceCell<RunOutcome>,
    driver: tokio::sync::Mutex<Option<tokio::task::JoinHandle<RunOutcome>>>,
    log_path: PathBuf,
}

impl RunHandle {
    /// Wrap a driver task. The task's return value becomes the outcome of
    /// every `wait()` call.
    pub fn new(driver: tokio::task::JoinHandle<RunOutcome>, log_path: PathBuf) -> Self {
        Self {
            outcome: tokio::sync::OnceCell::new(),
            driver: tokio::sync::Mutex::new(Some(driver)),
            log_path,
        }
    }

    pub async fn wait(&self) -> RunOutcome {
        self.outcome
            .get_or_init(|| async {
                let handle = self
                    .driver
                    .lock()
                    .await
                    .take()
                    .expect("driver task present on first wait");
                handle.await.unwrap_or_else(|join_err| RunOutcome {
                    exit_code: None,
                    log_path: self.log_path.clone(),
                    tokens_used: 0,
                    duration: Duration::ZERO,
                    error: Some(format!("driver task panicked: {join_err}")),
                })
            })
            .await
            .clone()
    }
}

/// Adapter interface for the agent runtime.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start an agent attempt. The log header must be on disk when this
    /// returns. Cancelling `cancel` delivers SIGTERM (then SIGKILL) to the
    /// child; `wait()` then returns with an undefined exit code.
    async fn launch(&self, request: LaunchRequest, cancel: CancellationToken)
    -> Result<RunHandle>;
}

// ---------------------------------------------------------------------------
// Log writer
// ---------------------------------------------------------------------------

/// Append-only log writer. Holds the mutex between a write and its flush.
struct LogWriter {
    file: Mutex<std::fs::File>,
}

impl LogWriter {
    fn create(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Write one timestamped line and flush it to disk.
    fn line(&self, text: &str) {
        let stamp = Utc::now().format("%H:%M:%S");
        let mut file = self.file.lock().expect("log writer lock poisoned");
        if let Err(e) = writeln!(file, "[{stamp}] {text}").and_then(|()| file.flush()) {
            warn!(error = %e, "failed to write agent log line");
        }
    }

    /// Write raw header text (no timestamp) and flush.
    fn header(&self, text: &str) {
        let mut file = self.file.lock().expect("log writer lock poisoned");
        if let Err(e) = write!(file, "{text}").and_then(|()| file.flush()) {
            warn!(error = %e, "failed to write agent log header");
        }
    }
}

// ---------------------------------------------------------------------------
// Agent CLI launcher
// ---------------------------------------------------------------------------

/// Launches the agent CLI with its structured stream-JSON output mode and
/// feeds the rendered prompt over stdin.
#[derive(Debug, Clone)]
pub struct AgentCliLauncher {
    binary: String,
    extra_args: Vec<String>,
}

impl AgentCliLauncher {
    /// Create a launcher that finds the agent binary on `$PATH`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    /// Additional arguments appended to every invocation.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

#[async_trait]
impl ProcessLauncher for AgentCliLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<RunHandle> {
        let writer = Arc::new(LogWriter::create(&request.log_path)?);

        // Fixed header, on disk before we return.
        writer.header(&format!(
            "=== Agent Run ===\n\
             Attempt: {}\n\
             Started: {}\n\
             Workdir: {}\n\
             Prompt:  {}\n\
             =================\n",
            request.attempt,
            Utc::now().to_rfc3339(),
            request.work_dir.display(),
            request.prompt_path.display(),
        ));

        let prompt = tokio::fs::read_to_string(&request.prompt_path)
            .await
            .with_context(|| {
                format!("failed to read prompt at {}", request.prompt_path.display())
            })?;

        let mut command = Command::new(&self.binary);
        command
            .args(&self.extra_args)
            .current_dir(&request.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().with_context(|| {
            format!(
                "failed to spawn agent binary '{}' -- is it installed and on PATH?",
                self.binary
            )
        })?;

        // Feed the prompt and close stdin so the agent starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(error = %e, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        }

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        let log_path = request.log_path.clone();
        let started = Instant::now();

        // Raw timestamped sink for stderr, independent of the stdout parser.
        let stderr_writer = Arc::clone(&writer);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_writer.line(&line);
            }
        });

        let driver = tokio::spawn(drive_child(
            child,
            stdout,
            stderr_task,
            Arc::clone(&writer),
            log_path.clone(),
            started,
            cancel,
        ));

        Ok(RunHandle::new(driver, log_path))
    }
}

/// Consume stdout, wait for exit, and assemble the outcome.
async fn drive_child(
    mut child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    stderr_task: tokio::task::JoinHandle<()>,
    writer: Arc<LogWriter>,
    log_path: PathBuf,
    started: Instant,
    cancel: CancellationToken,
) -> RunOutcome {
    let mut lines = BufReader::new(stdout).lines();
    let mut tokens: Option<i64> = None;
    let mut legacy_tokens: Option<i64> = None;
    let mut saw_result = false;
    let mut result_error = false;
    let mut cancelled = false;

    loop {
        tokio::select! {
            next = lines.next_line() => {
                match next {
                    Ok(Some(line)) => {
                        let trimmed = line.trim_end();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_line(trimmed) {
                            ParseOutcome::Structured(events) => {
                                for event in events {
                                    if let AgentEvent::Completed { success, tokens: t } = &event {
                                        saw_result = true;
                                        result_error = !success;
                                        if t.is_some() {
                                            tokens = *t;
                                        }
                                    }
                                    writer.line(&format_event(&event));
                                }
                            }
                            ParseOutcome::Raw => {
                                if legacy_tokens.is_none() {
                                    legacy_tokens = extract_legacy_tokens(trimmed);
                                }
                                writer.line(trimmed);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading agent stdout");
                        break;
                    }
                }
            }
            () = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                terminate(&mut child).await;
                // Keep draining stdout until the pipe closes.
            }
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "failed to wait for agent child");
            None
        }
    };

    let _ = stderr_task.await;

    // The sentinel must appear exactly once, even when the agent crashed
    // before emitting its result event.
    if !saw_result {
        match exit_code {
            Some(code) => writer.line(&format!("=== Run Complete === (exit code {code})")),
            None => writer.line("=== Run Complete === (killed)"),
        }
    }

    let error = if cancelled {
        Some("cancelled".to_string())
    } else if result_error {
        Some("agent reported an error result".to_string())
    } else {
        match exit_code {
            Some(0) => None,
            Some(code) => Some(format!("exit code {code}")),
            None => Some("killed by signal".to_string()),
        }
    };

    RunOutcome {
        exit_code,
        log_path,
        tokens_used: tokens.or(legacy_tokens).unwrap_or(0),
        duration: started.elapsed(),
        error,
    }
}

/// SIGTERM, a short grace period, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => debug!("agent child exited after SIGTERM"),
        Err(_) => {
            debug!("agent child did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
