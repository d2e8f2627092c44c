//! Log tailer: watches a growing log file and emits line-level events to
//! the event hub.
//!
//! One tailer per run id. The tailer never blocks on subscribers -- the
//! event hub absorbs back-pressure by dropping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{Event, EventHub};

/// Completion sentinel written by the launcher; observing it ends the tail.
const SENTINEL: &str = "=== Run Complete ===";

/// Lines longer than this are truncated.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// How long to wait for the log file to appear.
const DEFAULT_FILE_WAIT: Duration = Duration::from_secs(5);

/// Registry of active tails, keyed by run id.
pub struct LogTailer {
    hub: std::sync::Arc<EventHub>,
    poll: Duration,
    file_wait: Duration,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl LogTailer {
    pub fn new(hub: std::sync::Arc<EventHub>, poll: Duration) -> Self {
        Self {
            hub,
            poll,
            file_wait: DEFAULT_FILE_WAIT,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Shorten the file-appearance wait (tests).
    pub fn with_file_wait(mut self, wait: Duration) -> Self {
        self.file_wait = wait;
        self
    }

    /// Tail a run's log file until completion.
    ///
    /// Blocks until the tail terminates: context cancellation, an I/O
    /// error, or the completion sentinel. If a tail is already active for
    /// this run id the call returns immediately. Waits up to five seconds
    /// for the file to appear; if it never does, returns an error without
    /// publishing any events.
    pub async fn start_tailing(
        &self,
        ctx: CancellationToken,
        project_id: Uuid,
        run_id: Uuid,
        log_path: &Path,
    ) -> Result<()> {
        let token = ctx.child_token();
        {
            let mut active = self.active.lock().expect("tailer registry lock poisoned");
            if active.contains_key(&run_id) {
                debug!(%run_id, "tail already active, skipping");
                return Ok(());
            }
            active.insert(run_id, token.clone());
        }

        let result = self
            .tail_inner(token, project_id, run_id, log_path)
            .await;

        self.active
            .lock()
            .expect("tailer registry lock poisoned")
            .remove(&run_id);

        result
    }

    /// Cancel an active tail cooperatively. Unknown run ids are a no-op.
    pub fn stop_tailing(&self, run_id: Uuid) {
        let active = self.active.lock().expect("tailer registry lock poisoned");
        if let Some(token) = active.get(&run_id) {
            token.cancel();
        }
    }

    /// Whether a tail is currently registered for the run.
    pub fn is_tailing(&self, run_id: Uuid) -> bool {
        self.active
            .lock()
            .expect("tailer registry lock poisoned")
            .contains_key(&run_id)
    }

    async fn tail_inner(
        &self,
        token: CancellationToken,
        project_id: Uuid,
        run_id: Uuid,
        log_path: &Path,
    ) -> Result<()> {
        let file = self.wait_for_file(&token, log_path).await?;
        let mut reader = BufReader::new(file);
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let mut chunk: Vec<u8> = Vec::new();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut chunk) => read,
                () = token.cancelled() => {
                    debug!(%run_id, "tail cancelled");
                    return Ok(());
                }
            };

            let n = read.context("error reading log file")?;

            if n == 0 {
                // EOF: the file may still be growing.
                tokio::select! {
                    () = tokio::time::sleep(self.poll) => continue,
                    () = token.cancelled() => {
                        debug!(%run_id, "tail cancelled at EOF");
                        return Ok(());
                    }
                }
            }

            if chunk.last() != Some(&b'\n') {
                // Partial line at EOF; stash and wait for the rest.
                pending.extend_from_slice(&chunk);
                continue;
            }

            chunk.pop();
            if chunk.last() == Some(&b'\r') {
                chunk.pop();
            }

            let mut line_bytes = std::mem::take(&mut pending);
            line_bytes.extend_from_slice(&chunk);
            if line_bytes.len() > MAX_LINE_BYTES {
                line_bytes.truncate(MAX_LINE_BYTES);
                warn!(%run_id, "truncated oversized log line");
            }

            let line = String::from_utf8_lossy(&line_bytes).into_owned();
            let done = line.contains(SENTINEL);

            let (timestamp, rest) = split_timestamp(&line);
            self.hub.publish(
                project_id,
                &Event::AgentLog {
                    run_id,
                    line: rest.to_string(),
                    timestamp: timestamp.map(str::to_string),
                },
            );

            if done {
                debug!(%run_id, "completion sentinel observed, ending tail");
                return Ok(());
            }
        }
    }

    /// Poll for the log file to exist, bounded by `file_wait`.
    async fn wait_for_file(
        &self,
        token: &CancellationToken,
        log_path: &Path,
    ) -> Result<tokio::fs::File> {
        let deadline = tokio::time::Instant::now() + self.file_wait;
        loop {
            match tokio::fs::File::open(log_path).await {
                Ok(file) => return Ok(file),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::select! {
                        () = tokio::time::sleep(self.poll) => {}
                        () = token.cancelled() => bail!("tail cancelled while waiting for log file"),
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("log file {} did not appear", log_path.display())
                    });
                }
            }
        }
    }
}

/// Split a leading `[HH:MM:SS]` stamp off a log line.
fn split_timestamp(line: &str) -> (Option<&str>, &str) {
    let bytes = line.as_bytes();
    if bytes.len() >= 10 && bytes[0] == b'[' && bytes[9] == b']' {
        let stamp = &line[1..9];
        let valid = stamp.bytes().enumerate().all(|(i, b)| match i {
            2 | 5 => b == b':',
            _ => b.is_ascii_digit(),
        });
        if valid {
            let rest = line[10..].strip_prefix(' ').unwrap_or(&line[10..]);
            return (Some(stamp), rest);
        }
    }
    (None, line)
}
