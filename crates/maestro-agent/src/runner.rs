use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use maestro_core::config::{KILL_GRACE_SECS, STDERR_REPORT_CHARS, STDERR_TAIL_BYTES};

use crate::attachments::{self, AttachmentFile};
use crate::decoder::EventDecoder;
use crate::events::AgentEvent;
use crate::toolconfig::PluginConfigHandle;

/// Everything needed to launch one assistant invocation.
pub struct AgentRequest {
    /// The assistant CLI binary.
    pub command: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub resume_token: Option<String>,
    pub allowed_tools: Vec<String>,
    /// Content-addressed plugin config; kept alive for the child's lifetime.
    pub plugin_config: Option<PluginConfigHandle>,
    pub workdir: Option<String>,
    pub attachments: Vec<AttachmentFile>,
    /// Extra environment for the child (loopback secret/port for plugins).
    pub env: Vec<(String, String)>,
    /// Global timeout; the graceful→forced kill ladder runs when it fires.
    pub timeout: Duration,
}

/// Events delivered to the consumer. `Done` is the sole invariant: it fires
/// exactly once per invocation, on every path.
#[derive(Debug)]
pub enum RunnerEvent {
    /// The child process spawned; pid reported for crash-recovery tracking.
    ChildPid(u32),
    Event(AgentEvent),
    Error { message: String },
    Done { resume_token: Option<String> },
}

/// Spawn the assistant and stream its decoded events.
///
/// The returned receiver yields zero or more `ChildPid`/`Event`/`Error`
/// items and then exactly one `Done`, whatever happens: spawn failure,
/// clean exit, non-zero exit, timeout, or cancellation.
pub fn spawn_agent(req: AgentRequest, cancel: CancellationToken) -> mpsc::Receiver<RunnerEvent> {
    let (tx, rx) = mpsc::channel::<RunnerEvent>(256);

    tokio::spawn(async move {
        let mut resume_token = req.resume_token.clone();
        if let Err(message) = run(req, cancel, &tx, &mut resume_token).await {
            // Receiver may already be gone on teardown; Done below still
            // completes the contract for live consumers.
            let _ = tx.send(RunnerEvent::Error { message }).await;
        }
        let _ = tx.send(RunnerEvent::Done { resume_token }).await;
    });

    rx
}

async fn run(
    req: AgentRequest,
    cancel: CancellationToken,
    tx: &mpsc::Sender<RunnerEvent>,
    resume_token: &mut Option<String>,
) -> Result<(), String> {
    // Attachments live in a per-invocation temp dir; dropping the stage at
    // the end of this function removes them on success and error alike.
    let stage = attachments::stage(&req.attachments)
        .map_err(|e| format!("attachment staging failed: {e}"))?;

    let mut prompt = req.prompt.clone();
    if let Some(ref stage) = stage {
        prompt.push_str(&stage.prompt_suffix());
    }

    let mut cmd = Command::new(&req.command);
    cmd.arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--include-partial-messages")
        .arg("--dangerously-skip-permissions");
    if let Some(ref model) = req.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(max_turns) = req.max_turns {
        cmd.arg("--max-turns").arg(max_turns.to_string());
    }
    if let Some(ref token) = req.resume_token {
        cmd.arg("--resume").arg(token);
    }
    if let Some(ref system) = req.system_prompt {
        cmd.arg("--append-system-prompt").arg(system);
    }
    for tool in &req.allowed_tools {
        cmd.arg("--allowedTools").arg(tool);
    }
    if let Some(ref config) = req.plugin_config {
        cmd.arg("--mcp-config").arg(config.path());
    }
    cmd.arg("-p").arg(&prompt);

    if let Some(ref dir) = req.workdir {
        cmd.current_dir(dir);
    }
    // The child refuses to run nested inside another assistant session, and
    // an inherited API key triggers its interactive configuration prompt.
    cmd.env_remove("CLAUDECODE")
        .env_remove("CLAUDE_CODE_ENTRYPOINT")
        .env_remove("ANTHROPIC_API_KEY");
    for (k, v) in &req.env {
        cmd.env(k, v);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            format!(
                "assistant not found at '{}' (install it or set assistant.command)",
                req.command
            )
        } else {
            format!("failed to spawn assistant: {e}")
        }
    })?;

    let pid = child.id();
    if let Some(pid) = pid {
        debug!(pid, "assistant spawned");
        let _ = tx.send(RunnerEvent::ChildPid(pid)).await;
    }

    // stderr tail ring for error reporting.
    let stderr_tail = Arc::new(Mutex::new(Vec::<u8>::new()));
    if let Some(stderr) = child.stderr.take() {
        let tail = Arc::clone(&stderr_tail);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = [0u8; 1024];
            while let Ok(n) = reader.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                let mut guard = tail.lock().unwrap();
                guard.extend_from_slice(&buf[..n]);
                if guard.len() > STDERR_TAIL_BYTES {
                    let excess = guard.len() - STDERR_TAIL_BYTES;
                    guard.drain(..excess);
                }
            }
        });
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| "assistant stdout not captured".to_string())?;

    let mut decoder = EventDecoder::new();
    let deadline = tokio::time::Instant::now() + req.timeout;
    let mut buf = [0u8; 8192];

    let outcome = 'stream: loop {
        tokio::select! {
            read = stdout.read(&mut buf) => {
                match read {
                    Ok(0) => break StreamEnd::Eof,
                    Ok(n) => {
                        for event in decoder.feed(&buf[..n]) {
                            note_token(&event, resume_token);
                            if tx.send(RunnerEvent::Event(event)).await.is_err() {
                                break 'stream StreamEnd::ConsumerGone;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("assistant stdout read error: {e}");
                        break StreamEnd::Eof;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => break StreamEnd::TimedOut,
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
        }
    };

    match outcome {
        StreamEnd::Eof => {
            for event in decoder.finish() {
                note_token(&event, resume_token);
                let _ = tx.send(RunnerEvent::Event(event)).await;
            }
            let status = child
                .wait()
                .await
                .map_err(|e| format!("assistant wait failed: {e}"))?;
            if !status.success() {
                let stderr = report_stderr(&stderr_tail);
                return Err(format!(
                    "assistant exited with {}: {}",
                    status.code().unwrap_or(-1),
                    stderr
                ));
            }
            Ok(())
        }
        StreamEnd::TimedOut => {
            info!(timeout_ms = req.timeout.as_millis() as u64, "assistant timed out");
            escalate_kill(&mut child, pid).await;
            Err(format!(
                "assistant timed out after {}ms",
                req.timeout.as_millis()
            ))
        }
        StreamEnd::Cancelled => {
            debug!("assistant invocation cancelled");
            escalate_kill(&mut child, pid).await;
            // Cancellation is not an error surface; the caller asked.
            Ok(())
        }
        StreamEnd::ConsumerGone => {
            escalate_kill(&mut child, pid).await;
            Ok(())
        }
    }
}

enum StreamEnd {
    Eof,
    TimedOut,
    Cancelled,
    ConsumerGone,
}

fn note_token(event: &AgentEvent, resume_token: &mut Option<String>) {
    if let AgentEvent::SessionAssigned { token } = event {
        *resume_token = Some(token.clone());
    }
}

/// Polite termination, then SIGKILL after the grace window.
async fn escalate_kill(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        #[cfg(unix)]
        // Safety: pid is our direct child and we still hold its handle.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }
    match tokio::time::timeout(Duration::from_secs(KILL_GRACE_SECS), child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(?pid, "assistant ignored termination, force-killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// Filtered, truncated stderr tail for error surfaces.
fn report_stderr(tail: &Arc<Mutex<Vec<u8>>>) -> String {
    let bytes = tail.lock().unwrap().clone();
    let text = String::from_utf8_lossy(&bytes);
    let filtered: String = text
        .lines()
        .filter(|line| !line.contains("Loaded MCP") && !line.contains("Starting MCP"))
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = filtered.trim();
    if trimmed.len() <= STDERR_REPORT_CHARS {
        return trimmed.to_string();
    }
    // Keep the tail; the interesting part of a crash dump is at the end.
    let start = trimmed.len() - STDERR_REPORT_CHARS;
    let start = trimmed
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= start)
        .unwrap_or(0);
    trimmed[start..].to_string()
}
