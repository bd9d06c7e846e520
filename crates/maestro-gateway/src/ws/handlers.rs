//! Concrete WS command handlers.
//!
//! Each arm extracts its parameters, calls the matching engine subsystem,
//! and answers over the connection's outbound sink. Keep this module free
//! of I/O beyond those calls.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};

use maestro_agent::attachments::AttachmentFile;
use maestro_engine::ask::ANSWER_SKIPPED;
use maestro_engine::{run_turn, ClientSink, QueuedChat, TurnRequest};
use maestro_protocol::client::{Attachment, ClientCommand};
use maestro_protocol::server::ServerEvent;
use maestro_store::{NewTask, TaskPatch, TaskStatus};

use crate::app::AppState;

pub async fn dispatch(
    state: &Arc<AppState>,
    sink: &ClientSink,
    subscribed: &mut HashSet<String>,
    command: ClientCommand,
) {
    match command {
        ClientCommand::Chat {
            tab_id,
            session_id,
            text,
            attachments,
            skills,
            mcp_servers,
            mode,
            agent_mode,
            model,
            max_turns,
            workdir,
            reply_to,
            retry,
            auto_skill,
        } => {
            let request = TurnRequest {
                session_id: session_id.clone(),
                text,
                attachments: convert_attachments(attachments),
                skills,
                plugins: mcp_servers,
                mode,
                agent_mode,
                model,
                max_turns,
                workdir,
                reply_to,
                retry,
                auto_skill,
                tab_id,
                kanban_task: None,
            };

            // A second chat against a busy session parks behind the running
            // turn instead of failing.
            if let Some(ref sid) = session_id {
                if state.orch.active_turns.contains_key(sid) {
                    state.orch.enqueue_chat(
                        sid,
                        QueuedChat {
                            queue_id: maestro_core::ids::queue_id(),
                            request,
                        },
                    );
                    return;
                }
            }
            spawn_turn(state, request, sink.clone());
        }

        ClientCommand::Stop { tab_id, session_id } => {
            if let Some(ref sid) = session_id {
                if !state.orch.stop_session(sid) {
                    debug!(session_id = %sid, "stop: no active turn");
                }
                return;
            }
            let Some(tab) = tab_id else {
                send(sink, &error_event("stop requires a tabId or sessionId", None));
                return;
            };
            for entry in state.orch.active_turns.iter() {
                if entry.value().tab_id.as_deref() == Some(tab.as_str()) {
                    entry.value().cancel.cancel();
                }
            }
        }

        ClientCommand::SubscribeSession {
            session_id,
            no_catch_up,
        } => {
            subscribed.insert(session_id.clone());
            if let Err(e) = state.orch.subscribe(&session_id, sink, no_catch_up) {
                warn!(session_id, "subscribe failed: {e}");
                send(sink, &error_event(&format!("subscribe failed: {e}"), None));
            }
        }

        ClientCommand::ResumeTask { session_id, tab_id } => {
            resume_interrupted(state, sink, &session_id, tab_id).await;
        }

        ClientCommand::AskUserResponse { request_id, answer } => {
            if !state.orch.ask.resolve(&request_id, &answer) {
                debug!(request_id, "answer for unknown question");
            }
        }

        ClientCommand::AskUserCancel { request_id } => {
            state.orch.ask.resolve(&request_id, ANSWER_SKIPPED);
        }

        ClientCommand::QueueRemove { queue_id } => {
            state.orch.queue_remove(&queue_id);
        }

        ClientCommand::QueueEdit { queue_id, text } => {
            state.orch.queue_edit(&queue_id, &text);
        }

        ClientCommand::ListSessions { limit } => {
            match state.orch.store.list_sessions(limit.unwrap_or(50).min(200)) {
                Ok(sessions) => send(
                    sink,
                    &ServerEvent::Sessions {
                        sessions: serde_json::json!(sessions),
                    },
                ),
                Err(e) => send(sink, &error_event(&e.to_string(), None)),
            }
        }

        ClientCommand::SessionHistory {
            session_id,
            limit,
            before,
        } => {
            match state
                .orch
                .store
                .list_messages(&session_id, limit.unwrap_or(100).min(500), before)
            {
                Ok(messages) => send(
                    sink,
                    &ServerEvent::SessionHistory {
                        session_id,
                        messages: serde_json::json!(messages),
                    },
                ),
                Err(e) => send(sink, &error_event(&e.to_string(), None)),
            }
        }

        ClientCommand::DeleteSession { session_id } => {
            state.orch.stop_session(&session_id);
            if let Err(e) = state.orch.store.delete_session(&session_id) {
                send(sink, &error_event(&e.to_string(), None));
            }
        }

        ClientCommand::TaskCreate {
            title,
            description,
            workdir,
            model,
            mode,
            agent_mode,
            max_turns,
            status,
            sort_order,
            depends_on,
            chain_id,
            source_session_id,
            attachments,
        } => {
            let status = status
                .as_deref()
                .and_then(|s| TaskStatus::from_str(s).ok())
                .unwrap_or(TaskStatus::Backlog);
            let new_task = NewTask {
                title,
                description,
                status,
                sort_order: sort_order.unwrap_or(0),
                session_id: None,
                workdir,
                model,
                mode,
                agent_mode,
                max_turns,
                attachments: attachments_json(&attachments),
                depends_on,
                chain_id,
                source_session_id,
            };
            match state.orch.store.create_task(new_task) {
                Ok(_) => {
                    state.orch.scheduler_kick.notify_one();
                    send_task_list(state, sink);
                }
                Err(e) => send(sink, &error_event(&e.to_string(), None)),
            }
        }

        ClientCommand::TaskUpdate { task_id, patch } => {
            let parsed = match parse_task_patch(&patch) {
                Ok(p) => p,
                Err(e) => {
                    send(sink, &error_event(&e, None));
                    return;
                }
            };
            // Moving a task out of in_progress is a stop request: flag it
            // before writing so the runner's terminal handler stands down.
            if let Ok(Some(current)) = state.orch.store.get_task(&task_id) {
                let leaving_in_progress = current.status == TaskStatus::InProgress
                    && parsed
                        .status
                        .is_some_and(|s| s != TaskStatus::InProgress);
                if leaving_in_progress {
                    state.scheduler.request_stop(&current);
                }
            }
            match state.orch.store.update_task(&task_id, parsed) {
                Ok(_) => {
                    state.orch.scheduler_kick.notify_one();
                    send_task_list(state, sink);
                }
                Err(e) => send(sink, &error_event(&e.to_string(), None)),
            }
        }

        ClientCommand::TaskDelete { task_id } => {
            if let Ok(Some(task)) = state.orch.store.get_task(&task_id) {
                if task.status == TaskStatus::InProgress {
                    state.scheduler.request_stop(&task);
                }
            }
            match state.orch.store.delete_task(&task_id) {
                Ok(()) => {
                    state.orch.scheduler_kick.notify_one();
                    send_task_list(state, sink);
                }
                Err(e) => send(sink, &error_event(&e.to_string(), None)),
            }
        }

        ClientCommand::TaskList {} => send_task_list(state, sink),
    }
}

/// Re-run the stored `last_user_msg` of an interrupted session.
async fn resume_interrupted(
    state: &Arc<AppState>,
    sink: &ClientSink,
    session_id: &str,
    tab_id: Option<String>,
) {
    if state.orch.active_turns.contains_key(session_id) {
        send(
            sink,
            &error_event("session already has a running turn", tab_id.clone()),
        );
        return;
    }
    let session = match state.orch.store.get_session(session_id) {
        Ok(Some(s)) => s,
        Ok(None) => {
            send(sink, &error_event("unknown session", tab_id.clone()));
            return;
        }
        Err(e) => {
            send(sink, &error_event(&e.to_string(), tab_id.clone()));
            return;
        }
    };
    let Some(last_user_msg) = session.last_user_msg else {
        send(
            sink,
            &error_event("nothing to resume for this session", tab_id.clone()),
        );
        return;
    };

    let request = TurnRequest {
        session_id: Some(session.id.clone()),
        text: last_user_msg,
        attachments: Vec::new(),
        skills: session.skills.clone(),
        plugins: session.tools.clone(),
        mode: session.mode.clone(),
        agent_mode: session.agent_mode.clone(),
        model: session.model.clone(),
        max_turns: None,
        workdir: session.workdir.clone(),
        reply_to: None,
        retry: true,
        auto_skill: false,
        tab_id,
        kanban_task: None,
    };
    spawn_turn(state, request, sink.clone());
}

fn spawn_turn(state: &Arc<AppState>, request: TurnRequest, sink: ClientSink) {
    let orch = Arc::clone(&state.orch);
    tokio::spawn(async move {
        let tab_id = request.tab_id.clone();
        if let Err(e) = run_turn(orch, request, Some(sink.clone())).await {
            warn!("turn failed to start: {e}");
            let _ = sink.try_send(error_event(&e.to_string(), tab_id).to_json());
        }
    });
}

fn convert_attachments(attachments: Vec<Attachment>) -> Vec<AttachmentFile> {
    attachments
        .into_iter()
        .map(|a| AttachmentFile {
            name: a.name,
            data: a.data,
        })
        .collect()
}

fn attachments_json(attachments: &[Attachment]) -> Option<serde_json::Value> {
    if attachments.is_empty() {
        return None;
    }
    Some(serde_json::json!(attachments
        .iter()
        .map(|a| serde_json::json!({ "name": a.name, "data": a.data }))
        .collect::<Vec<_>>()))
}

/// Translate a JSON patch object into a typed [`TaskPatch`]. A `null`
/// value clears a nullable column; an absent key leaves it untouched.
fn parse_task_patch(patch: &serde_json::Value) -> Result<TaskPatch, String> {
    let Some(obj) = patch.as_object() else {
        return Err("patch must be an object".to_string());
    };
    let mut out = TaskPatch::default();
    for (key, value) in obj {
        match key.as_str() {
            "title" => out.title = value.as_str().map(String::from),
            "description" => out.description = value.as_str().map(String::from),
            "notes" => out.notes = Some(value.as_str().map(String::from)),
            "status" => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| "status must be a string".to_string())?;
                out.status =
                    Some(TaskStatus::from_str(raw).map_err(|_| format!("bad status: {raw}"))?);
            }
            "sortOrder" => out.sort_order = value.as_i64(),
            "workdir" => out.workdir = Some(value.as_str().map(String::from)),
            "model" => out.model = Some(value.as_str().map(String::from)),
            "mode" => out.mode = Some(value.as_str().map(String::from)),
            "agentMode" => out.agent_mode = Some(value.as_str().map(String::from)),
            "maxTurns" => out.max_turns = Some(value.as_u64().map(|n| n as u32)),
            "dependsOn" => {
                let list = value
                    .as_array()
                    .ok_or_else(|| "dependsOn must be an array".to_string())?;
                out.depends_on = Some(
                    list.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect(),
                );
            }
            other => return Err(format!("unknown patch field: {other}")),
        }
    }
    Ok(out)
}

fn send_task_list(state: &Arc<AppState>, sink: &ClientSink) {
    match state.orch.store.list_tasks() {
        Ok(tasks) => send(
            sink,
            &ServerEvent::Tasks {
                tasks: serde_json::json!(tasks),
            },
        ),
        Err(e) => send(sink, &error_event(&e.to_string(), None)),
    }
}

fn send(sink: &ClientSink, event: &ServerEvent) {
    let _ = sink.try_send(event.to_json());
}

fn error_event(message: &str, tab_id: Option<String>) -> ServerEvent {
    ServerEvent::Error {
        error: message.to_string(),
        tab_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_parses_typed_fields() {
        let patch = parse_task_patch(&serde_json::json!({
            "title": "new title",
            "status": "todo",
            "sortOrder": 7,
            "dependsOn": ["a", "b"],
            "notes": null
        }))
        .unwrap();
        assert_eq!(patch.title.as_deref(), Some("new title"));
        assert_eq!(patch.status, Some(TaskStatus::Todo));
        assert_eq!(patch.sort_order, Some(7));
        assert_eq!(patch.depends_on.as_deref(), Some(&["a".to_string(), "b".to_string()][..]));
        assert_eq!(patch.notes, Some(None), "null clears the column");
    }

    #[test]
    fn patch_rejects_unknown_fields_and_bad_status() {
        assert!(parse_task_patch(&serde_json::json!({"workerPid": 1})).is_err());
        assert!(parse_task_patch(&serde_json::json!({"status": "paused"})).is_err());
        assert!(parse_task_patch(&serde_json::json!("not an object")).is_err());
    }
}
