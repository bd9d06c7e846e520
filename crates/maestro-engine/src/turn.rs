use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maestro_agent::attachments::AttachmentFile;
use maestro_agent::events::AgentEvent;
use maestro_agent::runner::{spawn_agent, AgentRequest, RunnerEvent};
use maestro_core::config::{
    CONTINUE_PROMPT, MAX_AUTO_CONTINUES, PARTIAL_TEXT_FLUSH_EVERY,
};
use maestro_protocol::server::ServerEvent;
use maestro_store::{NewMessage, NewSession, SessionRecord};

use crate::ask::ANSWER_SESSION_ENDED;
use crate::error::{EngineError, Result};
use crate::orchestrator::{ActiveTurn, ClientSink, Orchestrator};
use crate::proxy::ClientProxy;

/// Everything a single conversation turn needs.
#[derive(Clone)]
pub struct TurnRequest {
    pub session_id: Option<String>,
    pub text: String,
    pub attachments: Vec<AttachmentFile>,
    pub skills: Vec<String>,
    pub plugins: Vec<String>,
    pub mode: Option<String>,
    pub agent_mode: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub workdir: Option<String>,
    pub reply_to: Option<i64>,
    /// Internal retry of the previous prompt: bumps the retry counter
    /// instead of appending a duplicate user message.
    pub retry: bool,
    pub auto_skill: bool,
    pub tab_id: Option<String>,
    /// Set when the turn is driven by the task scheduler. Changes buffer
    /// routing (task buffer, watcher broadcast) and records the subprocess
    /// pid on the task row.
    pub kanban_task: Option<String>,
}

impl TurnRequest {
    pub fn chat(text: &str) -> Self {
        Self {
            session_id: None,
            text: text.to_string(),
            attachments: Vec::new(),
            skills: Vec::new(),
            plugins: Vec::new(),
            mode: None,
            agent_mode: None,
            model: None,
            max_turns: None,
            workdir: None,
            reply_to: None,
            retry: false,
            auto_skill: false,
            tab_id: None,
            kanban_task: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Success,
    Incomplete,
    BudgetExceeded,
    Cancelled,
    Failed,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub session_id: String,
    pub resume_token: Option<String>,
    pub rate_limited: bool,
    pub final_subtype: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Drive one turn end to end: resolve the session, persist the user
/// message, stream the subprocess, auto-continue when the assistant stops
/// early, and leave the session row clean whatever happens.
pub fn run_turn(
    orch: Arc<Orchestrator>,
    req: TurnRequest,
    sink: Option<ClientSink>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<TurnOutcome>> + Send>> {
    Box::pin(run_turn_with_cancel(orch, req, sink, CancellationToken::new()))
}

/// Same as [`run_turn`], with a caller-supplied cancellation handle; the
/// task scheduler holds these so manual board edits can abort a run.
pub async fn run_turn_with_cancel(
    orch: Arc<Orchestrator>,
    req: TurnRequest,
    sink: Option<ClientSink>,
    cancel: CancellationToken,
) -> Result<TurnOutcome> {
    let started = Instant::now();
    let (session, created) = resolve_session(&orch, &req)?;
    let session_id = session.id.clone();
    let kanban = req.kanban_task.is_some();

    if !kanban && orch.active_turns.contains_key(&session_id) {
        return Err(EngineError::TurnActive { id: session_id });
    }

    let proxy = Arc::new(ClientProxy::new(sink));
    if created {
        send(&orch, &proxy, kanban, &session_id, &ServerEvent::SessionStarted {
            session_id: session_id.clone(),
            tab_id: req.tab_id.clone(),
        });
        let title = derive_title(&req.text);
        if let Err(e) = orch.store.set_session_title(&session_id, &title) {
            warn!(session_id, "title write failed: {e}");
        }
        send(&orch, &proxy, kanban, &session_id, &ServerEvent::SessionTitle {
            session_id: session_id.clone(),
            title,
            tab_id: req.tab_id.clone(),
        });
    }

    // Re-running the prompt the session already holds is a retry even when
    // the caller did not flag it (task re-dispatch takes this path).
    let is_retry = req.retry
        || (!created
            && orch.store.last_user_message(&session_id)?.as_deref() == Some(req.text.as_str()));
    if is_retry {
        orch.store.bump_session_retry(&session_id)?;
    } else {
        orch.store.append_message(NewMessage {
            reply_to: req.reply_to,
            attachments: attachment_meta(&req.attachments),
            ..NewMessage::user_text(&session_id, &req.text)
        })?;
    }

    let mut skills = req.skills.clone();
    if skills.is_empty() && req.auto_skill {
        skills = orch.library.auto_select(&req.text);
        if !skills.is_empty() {
            debug!(session_id, ?skills, "skills auto-selected");
        }
    }
    orch.store.set_session_profile(
        &session_id,
        req.model.as_deref(),
        req.mode.as_deref(),
        req.agent_mode.as_deref(),
        &skills,
        &req.plugins,
    )?;
    let system_prompt = orch.library.compose_prompt(&skills);

    orch.store.set_last_user_msg(&session_id, Some(&req.text))?;
    if !kanban {
        orch.active_turns.insert(
            session_id.clone(),
            Arc::new(ActiveTurn::new(
                Arc::clone(&proxy),
                cancel.clone(),
                req.tab_id.clone(),
            )),
        );
    }
    send(&orch, &proxy, kanban, &session_id, &ServerEvent::Status {
        status: "thinking".to_string(),
        tab_id: req.tab_id.clone(),
    });

    // From here on, teardown must run whatever the drive loop does.
    let drive = drive_turn(
        &orch,
        &session,
        &req,
        system_prompt,
        &proxy,
        cancel.clone(),
    )
    .await;

    let success = drive.status == TurnStatus::Success;
    if success {
        let final_text = buffer_text(&orch, kanban, &session_id);
        if !final_text.trim().is_empty() {
            if let Err(e) = orch
                .store
                .append_message(NewMessage::assistant_text(&session_id, &final_text))
            {
                error!(session_id, "final message write failed: {e}");
            }
        }
    }
    // A cancelled turn keeps its prompt so a later subscriber gets
    // task_interrupted and can retry; every other ending clears it.
    let bookkeeping = if drive.status == TurnStatus::Cancelled {
        orch.store.suspend_turn(&session_id)
    } else {
        orch.store.finish_turn(&session_id, success)
    };
    if let Err(e) = bookkeeping {
        error!(session_id, "turn bookkeeping failed: {e}");
    }
    if kanban {
        orch.task_buffers.remove(&session_id);
    } else {
        orch.chat_buffers.remove(&session_id);
    }
    orch.ask.resolve_session(&session_id, ANSWER_SESSION_ENDED);
    if !kanban {
        orch.active_turns.remove(&session_id);
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    send(&orch, &proxy, kanban, &session_id, &ServerEvent::Done {
        tab_id: req.tab_id.clone(),
        duration: duration_ms.max(1),
    });
    info!(
        session_id,
        status = ?drive.status,
        duration_ms,
        "turn finished"
    );

    // Auto-run the next parked chat for this session, reusing the client
    // connection the proxy currently holds.
    if !kanban {
        if let Some(next) = orch.dequeue_chat(&session_id) {
            let next_sink = proxy.sink();
            let orch_next = Arc::clone(&orch);
            let mut next_req = next.request;
            next_req.session_id = Some(session_id.clone());
            tokio::spawn(async move {
                if let Err(e) = run_turn(orch_next, next_req, next_sink).await {
                    warn!("queued chat failed: {e}");
                }
            });
        }
    }

    Ok(TurnOutcome {
        status: drive.status,
        session_id,
        resume_token: drive.resume_token,
        rate_limited: drive.rate_limited,
        final_subtype: drive.final_subtype,
        error: drive.error,
        duration_ms,
    })
}

struct DriveResult {
    status: TurnStatus,
    resume_token: Option<String>,
    rate_limited: bool,
    final_subtype: Option<String>,
    error: Option<String>,
}

async fn drive_turn(
    orch: &Arc<Orchestrator>,
    session: &SessionRecord,
    req: &TurnRequest,
    system_prompt: String,
    proxy: &Arc<ClientProxy>,
    cancel: CancellationToken,
) -> DriveResult {
    let session_id = session.id.clone();
    let kanban = req.kanban_task.is_some();
    let workdir = req.workdir.clone().or_else(|| session.workdir.clone());

    let mut launches = orch.library.builtin_plugins();
    launches.extend(orch.library.plugin_launches(&req.plugins));
    for launch in launches.values_mut() {
        launch.env.insert(
            "MAESTRO_PLUGIN_TOKEN".to_string(),
            orch.plugin_secret.clone(),
        );
        launch.env.insert(
            "MAESTRO_PLUGIN_PORT".to_string(),
            orch.config.gateway.port.to_string(),
        );
        launch
            .env
            .insert("MAESTRO_SESSION_ID".to_string(), session_id.clone());
    }

    let mut resume_token = session.resume_token.clone();
    let mut prompt = req.text.clone();
    let mut attachments = req.attachments.clone();
    let mut continues = 0u32;
    let mut chunk_count = 0u32;
    let mut rate_limited = false;
    let mut final_subtype: Option<String> = None;
    let mut last_error: Option<String> = None;

    let status = 'turn: loop {
        let plugin_config = if launches.is_empty() {
            None
        } else {
            match orch.plugin_configs.acquire(&launches) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(session_id, "plugin config unavailable: {e}");
                    None
                }
            }
        };

        let agent_req = AgentRequest {
            command: orch.config.assistant.command.clone(),
            prompt: prompt.clone(),
            system_prompt: Some(system_prompt.clone()),
            model: req
                .model
                .clone()
                .or_else(|| session.model.clone())
                .or_else(|| Some(orch.config.assistant.default_model.clone())),
            max_turns: req.max_turns,
            resume_token: resume_token.clone(),
            allowed_tools: orch.library.allowed_tools().to_vec(),
            plugin_config,
            workdir: workdir.clone(),
            attachments: std::mem::take(&mut attachments),
            env: vec![
                (
                    "MAESTRO_PLUGIN_TOKEN".to_string(),
                    orch.plugin_secret.clone(),
                ),
                (
                    "MAESTRO_PLUGIN_PORT".to_string(),
                    orch.config.gateway.port.to_string(),
                ),
            ],
            timeout: Duration::from_millis(orch.config.limits.max_subprocess_ms),
        };

        let mut rx = spawn_agent(agent_req, cancel.child_token());
        let mut result: Option<String> = None;

        while let Some(event) = rx.recv().await {
            match event {
                RunnerEvent::ChildPid(pid) => {
                    if let Some(ref task_id) = req.kanban_task {
                        if let Err(e) = orch.store.set_task_worker_pid(task_id, Some(pid)) {
                            warn!(task_id = %task_id, "worker pid write failed: {e}");
                        }
                    }
                }
                RunnerEvent::Event(AgentEvent::SessionAssigned { token }) => {
                    resume_token = Some(token.clone());
                    if let Err(e) = orch.store.set_resume_token(&session_id, &token) {
                        warn!(session_id, "resume token write failed: {e}");
                    }
                }
                RunnerEvent::Event(AgentEvent::TextDelta { text, .. }) => {
                    push_text(
                        orch,
                        proxy,
                        kanban,
                        &session_id,
                        &req.tab_id,
                        &text,
                        &mut chunk_count,
                    );
                }
                RunnerEvent::Event(AgentEvent::ThinkingDelta { text, .. }) => {
                    send(orch, proxy, kanban, &session_id, &ServerEvent::Thinking {
                        text,
                        tab_id: req.tab_id.clone(),
                    });
                }
                RunnerEvent::Event(AgentEvent::AssistantMessage { blocks }) => {
                    let joined = blocks
                        .iter()
                        .map(|b| b.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    if !joined.is_empty() {
                        let text = with_separator(orch, kanban, &session_id, joined);
                        push_text(
                            orch,
                            proxy,
                            kanban,
                            &session_id,
                            &req.tab_id,
                            &text,
                            &mut chunk_count,
                        );
                    }
                }
                RunnerEvent::Event(AgentEvent::ToolUse { name, input }) => {
                    let input_json = input.to_string();
                    send(orch, proxy, kanban, &session_id, &ServerEvent::Tool {
                        tool: name.clone(),
                        input: input_json.clone(),
                        tab_id: req.tab_id.clone(),
                    });
                    if !internal_tool(&name) {
                        if let Err(e) = orch
                            .store
                            .append_message(NewMessage::tool_call(&session_id, &name, &input_json))
                        {
                            warn!(session_id, "tool message write failed: {e}");
                        }
                    }
                }
                RunnerEvent::Event(AgentEvent::RateLimit { info }) => {
                    rate_limited = true;
                    send(orch, proxy, kanban, &session_id, &ServerEvent::RateLimit {
                        info,
                    });
                }
                RunnerEvent::Event(AgentEvent::TurnResult { subtype, .. }) => {
                    final_subtype = Some(subtype.clone());
                    result = Some(subtype);
                }
                RunnerEvent::Event(AgentEvent::MessageStart)
                | RunnerEvent::Event(AgentEvent::BlockStart { .. }) => {}
                RunnerEvent::Event(AgentEvent::Unknown { raw }) => {
                    debug!(len = raw.len(), "unhandled stream line");
                }
                RunnerEvent::Error { message } => {
                    warn!(session_id, "assistant error: {message}");
                    last_error = Some(message.clone());
                    send(orch, proxy, kanban, &session_id, &ServerEvent::Error {
                        error: message,
                        tab_id: req.tab_id.clone(),
                    });
                }
                RunnerEvent::Done {
                    resume_token: token,
                } => {
                    if let Some(token) = token {
                        if resume_token.as_deref() != Some(token.as_str()) {
                            if let Err(e) = orch.store.set_resume_token(&session_id, &token) {
                                warn!(session_id, "resume token write failed: {e}");
                            }
                        }
                        resume_token = Some(token);
                    }
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            break TurnStatus::Cancelled;
        }

        match result.as_deref() {
            Some("success") => break TurnStatus::Success,
            Some("error_max_budget_usd") => {
                push_text(
                    orch,
                    proxy,
                    kanban,
                    &session_id,
                    &req.tab_id,
                    "\n\n[Budget reached. Stopping here.]",
                    &mut chunk_count,
                );
                break TurnStatus::BudgetExceeded;
            }
            Some("error_max_turns") => {
                if continues >= MAX_AUTO_CONTINUES {
                    push_text(
                        orch,
                        proxy,
                        kanban,
                        &session_id,
                        &req.tab_id,
                        "\n\n[The assistant did not complete the request.]",
                        &mut chunk_count,
                    );
                    break TurnStatus::Incomplete;
                }
                continues += 1;
                push_text(
                    orch,
                    proxy,
                    kanban,
                    &session_id,
                    &req.tab_id,
                    &format!("\n\n[Auto-continuing {continues}/{MAX_AUTO_CONTINUES}]"),
                    &mut chunk_count,
                );
                prompt = CONTINUE_PROMPT.to_string();
                continue 'turn;
            }
            _ => {
                // Any other non-success (including a stream that died without
                // a result line) silently retries the same prompt.
                if continues >= MAX_AUTO_CONTINUES {
                    push_text(
                        orch,
                        proxy,
                        kanban,
                        &session_id,
                        &req.tab_id,
                        "\n\n[The assistant did not complete the request.]",
                        &mut chunk_count,
                    );
                    break TurnStatus::Incomplete;
                }
                continues += 1;
                debug!(session_id, continues, "silent auto-continue");
                continue 'turn;
            }
        }
    };

    let status = if status == TurnStatus::Incomplete && last_error.is_some() {
        TurnStatus::Failed
    } else {
        status
    };

    DriveResult {
        status,
        resume_token,
        rate_limited,
        final_subtype,
        error: last_error,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resolve_session(
    orch: &Arc<Orchestrator>,
    req: &TurnRequest,
) -> Result<(SessionRecord, bool)> {
    if let Some(ref id) = req.session_id {
        if let Some(session) = orch.store.get_session(id)? {
            let workdir_conflict = matches!(
                (&req.workdir, &session.workdir),
                (Some(requested), Some(existing)) if requested != existing
            );
            if !workdir_conflict {
                return Ok((session, false));
            }
            info!(
                session_id = %id,
                "workdir changed, allocating a fresh session"
            );
        }
    }
    let session = orch.store.create_session(NewSession {
        title: None,
        tools: req.plugins.clone(),
        skills: req.skills.clone(),
        mode: req.mode.clone(),
        agent_mode: req.agent_mode.clone(),
        model: req.model.clone(),
        workdir: req.workdir.clone(),
    })?;
    Ok((session, true))
}

/// Route one event: interactive turns go through the proxy, kanban turns
/// broadcast to the session's subscribers.
fn send(
    orch: &Arc<Orchestrator>,
    proxy: &Arc<ClientProxy>,
    kanban: bool,
    session_id: &str,
    event: &ServerEvent,
) {
    if kanban {
        orch.broadcast(session_id, event);
    } else {
        proxy.send(event);
    }
}

/// Append text to the turn's replay buffer, forward it live, and batch the
/// `partial_text` column write.
#[allow(clippy::too_many_arguments)]
fn push_text(
    orch: &Arc<Orchestrator>,
    proxy: &Arc<ClientProxy>,
    kanban: bool,
    session_id: &str,
    tab_id: &Option<String>,
    text: &str,
    chunk_count: &mut u32,
) {
    let buffers = if kanban {
        &orch.task_buffers
    } else {
        &orch.chat_buffers
    };
    let accumulated = {
        let mut entry = buffers.entry(session_id.to_string()).or_default();
        entry.push_str(text);
        *chunk_count += 1;
        if *chunk_count % PARTIAL_TEXT_FLUSH_EVERY == 0 {
            Some(entry.clone())
        } else {
            None
        }
    };
    if let Some(full) = accumulated {
        if let Err(e) = orch.store.set_partial_text(session_id, Some(&full)) {
            warn!(session_id, "partial text write failed: {e}");
        }
    }
    send(orch, proxy, kanban, session_id, &ServerEvent::Text {
        text: text.to_string(),
        tab_id: tab_id.clone(),
        catch_up: false,
    });
}

/// Prefix a block with a paragraph break when the buffer already holds
/// prose that does not end in one.
fn with_separator(orch: &Arc<Orchestrator>, kanban: bool, session_id: &str, text: String) -> String {
    let buffers = if kanban {
        &orch.task_buffers
    } else {
        &orch.chat_buffers
    };
    let needs_gap = buffers
        .get(session_id)
        .is_some_and(|b| !b.is_empty() && !b.ends_with("\n\n"));
    if needs_gap {
        format!("\n\n{text}")
    } else {
        text
    }
}

fn buffer_text(orch: &Arc<Orchestrator>, kanban: bool, session_id: &str) -> String {
    let buffers = if kanban {
        &orch.task_buffers
    } else {
        &orch.chat_buffers
    };
    buffers
        .get(session_id)
        .map(|b| b.clone())
        .unwrap_or_default()
}

/// The loopback plugins report through their own endpoints; their tool
/// calls are not part of the conversation log.
fn internal_tool(name: &str) -> bool {
    name.ends_with("ask_user") || name.ends_with("notify_user")
}

fn derive_title(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    let mut title: String = line.chars().take(80).collect();
    if title.is_empty() {
        title = "New session".to_string();
    }
    title
}

fn attachment_meta(attachments: &[AttachmentFile]) -> Option<serde_json::Value> {
    if attachments.is_empty() {
        return None;
    }
    Some(serde_json::json!(attachments
        .iter()
        .map(|a| a.name.clone())
        .collect::<Vec<_>>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_truncates_first_line() {
        assert_eq!(derive_title("hello\nworld"), "hello");
        let long = "x".repeat(200);
        assert_eq!(derive_title(&long).len(), 80);
        assert_eq!(derive_title("   "), "New session");
    }

    #[test]
    fn internal_tools_are_not_persisted() {
        assert!(internal_tool("mcp__maestro__ask_user"));
        assert!(internal_tool("mcp__maestro__notify_user"));
        assert!(!internal_tool("Bash"));
        assert!(!internal_tool("Read"));
    }

    #[test]
    fn attachment_meta_lists_names() {
        let meta = attachment_meta(&[AttachmentFile {
            name: "a.txt".into(),
            data: String::new(),
        }])
        .unwrap();
        assert_eq!(meta[0], "a.txt");
        assert!(attachment_meta(&[]).is_none());
    }
}
