use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use maestro_agent::attachments::AttachmentFile;
use maestro_core::config::TASK_RETRY_LIMIT;
use maestro_engine::{run_turn_with_cancel, TurnRequest, TurnStatus};
use maestro_protocol::server::ServerEvent;
use maestro_store::{FailureReason, NewSession, TaskRecord, TaskStatus};

use crate::scheduler::{retry_backoff, TaskScheduler};

/// Constant prompt suffix requiring a final self-check from the assistant.
const VERIFICATION_SUFFIX: &str = "\n\nWhen the work is finished, end your reply with a \
'VERIFICATION REPORT' section: what changed, how you verified it, and anything left undone.";

/// Execute one dispatched task end to end and record its terminal state.
///
/// Terminal rules: `success` → done; cancellation → leave alone when the
/// stop came from a manual board edit, `cancelled/user_cancelled`
/// otherwise; other failures retry up to the cap with a backoff hint, then
/// `cancelled` with the classified reason.
pub async fn run_task(sched: Arc<TaskScheduler>, task: TaskRecord, cancel: CancellationToken) {
    let orch = Arc::clone(&sched.orch);

    // Provision the session (one transaction when a fresh one is needed)
    // and flip the row to in_progress with this process's pid; the runner
    // swaps in the child pid once the subprocess spawns. Chain members
    // without their own session adopt the one their predecessor
    // established, which is what carries the resume token down the chain.
    let pid = std::process::id();
    let session_id = match resolve_session_id(&orch, &task) {
        Some(id) => match orch.store.start_task_with_session(&task.id, &id, pid) {
            Ok(()) => id,
            Err(e) => {
                error!(task_id = %task.id, "task start failed: {e}");
                sched.running_aborts.remove(&task.id);
                return;
            }
        },
        None => match orch.store.start_task_with_new_session(
            &task.id,
            NewSession {
                title: Some(task.title.clone()),
                mode: task.mode.clone(),
                agent_mode: task.agent_mode.clone(),
                model: task.model.clone(),
                workdir: task.workdir.clone(),
                ..Default::default()
            },
            pid,
        ) {
            Ok(session) => session.id,
            Err(e) => {
                error!(task_id = %task.id, "session provisioning failed: {e}");
                sched.running_aborts.remove(&task.id);
                return;
            }
        },
    };

    orch.running_tasks
        .insert(session_id.clone(), task.id.clone());
    orch.broadcast(
        &session_id,
        &ServerEvent::TaskStarted {
            session_id: session_id.clone(),
            task_id: Some(task.id.clone()),
            tab_id: None,
        },
    );
    orch.broadcast(
        &session_id,
        &ServerEvent::AgentStatus {
            status: "running".to_string(),
            session_id: Some(session_id.clone()),
        },
    );

    let mut prompt = if task.description.trim().is_empty() {
        task.title.clone()
    } else {
        format!("{}\n\n{}", task.title, task.description)
    };
    if let Some(ref notes) = task.notes {
        if !notes.trim().is_empty() {
            prompt.push_str("\n\nNotes:\n");
            prompt.push_str(notes);
        }
    }
    prompt.push_str(VERIFICATION_SUFFIX);

    let request = TurnRequest {
        session_id: Some(session_id.clone()),
        text: prompt,
        attachments: task_attachments(&task),
        skills: Vec::new(),
        plugins: Vec::new(),
        mode: task.mode.clone(),
        agent_mode: task.agent_mode.clone(),
        model: task.model.clone(),
        max_turns: task.max_turns,
        workdir: task.workdir.clone(),
        reply_to: None,
        retry: false,
        auto_skill: false,
        tab_id: None,
        kanban_task: Some(task.id.clone()),
    };

    let outcome = run_turn_with_cancel(Arc::clone(&orch), request, None, cancel).await;

    orch.running_tasks.remove(&session_id);
    sched.running_aborts.remove(&task.id);

    let manual_stop = sched.take_stopping(&task.id);
    let verdict = match &outcome {
        Ok(result) => classify(result.status, result.rate_limited),
        Err(e) => {
            warn!(task_id = %task.id, "task run errored: {e}");
            Verdict::Retryable(FailureReason::Exception)
        }
    };

    if manual_stop {
        // The board edit already wrote the status it wanted.
        info!(task_id = %task.id, "manual stop honoured, status untouched");
    } else {
        apply_verdict(&sched, &task, &session_id, verdict).await;
    }

    orch.broadcast(
        &session_id,
        &ServerEvent::AgentStatus {
            status: "idle".to_string(),
            session_id: Some(session_id.clone()),
        },
    );
    orch.scheduler_kick.notify_one();
}

enum Verdict {
    Done,
    UserCancelled,
    Retryable(FailureReason),
}

fn classify(status: TurnStatus, rate_limited: bool) -> Verdict {
    match status {
        TurnStatus::Success => Verdict::Done,
        TurnStatus::Cancelled => Verdict::UserCancelled,
        TurnStatus::Failed => Verdict::Retryable(if rate_limited {
            FailureReason::RateLimited
        } else {
            FailureReason::Exception
        }),
        TurnStatus::Incomplete | TurnStatus::BudgetExceeded => {
            Verdict::Retryable(if rate_limited {
                FailureReason::RateLimited
            } else {
                FailureReason::AgentIncomplete
            })
        }
    }
}

async fn apply_verdict(
    sched: &Arc<TaskScheduler>,
    task: &TaskRecord,
    session_id: &str,
    verdict: Verdict,
) {
    let orch = &sched.orch;
    match verdict {
        Verdict::Done => {
            if let Err(e) = orch.store.finish_task(&task.id, TaskStatus::Done, None) {
                error!(task_id = %task.id, "done transition failed: {e}");
            }
            info!(task_id = %task.id, "task done");
        }
        Verdict::UserCancelled => {
            if let Err(e) = orch.store.finish_task(
                &task.id,
                TaskStatus::Cancelled,
                Some(FailureReason::UserCancelled),
            ) {
                error!(task_id = %task.id, "cancel transition failed: {e}");
            }
        }
        Verdict::Retryable(reason) => {
            if task.retry_count < TASK_RETRY_LIMIT {
                match orch.store.retry_task(&task.id, reason) {
                    Ok(attempt) => {
                        sched.set_backoff(&task.id, retry_backoff(reason, attempt));
                        info!(
                            task_id = %task.id,
                            attempt,
                            reason = %reason,
                            "task requeued for retry"
                        );
                        orch.broadcast(
                            session_id,
                            &ServerEvent::TaskRetrying {
                                session_id: session_id.to_string(),
                                attempt,
                                tab_id: None,
                            },
                        );
                    }
                    Err(e) => error!(task_id = %task.id, "retry transition failed: {e}"),
                }
            } else {
                if let Err(e) =
                    orch.store
                        .finish_task(&task.id, TaskStatus::Cancelled, Some(reason))
                {
                    error!(task_id = %task.id, "cancel transition failed: {e}");
                }
                warn!(task_id = %task.id, reason = %reason, "task cancelled after retries");
                if let Some(ref source) = task.source_session_id {
                    orch.broadcast(
                        source,
                        &ServerEvent::Notification {
                            session_id: Some(source.clone()),
                            level: "error".to_string(),
                            title: format!("Task failed: {}", task.title),
                            detail: Some(reason.as_str().to_string()),
                            progress: None,
                        },
                    );
                }
            }
        }
    }
}

/// The session this task should run against: its own link, or, for chain
/// members, whichever session the chain already established. `None` means
/// a fresh session must be provisioned.
fn resolve_session_id(
    orch: &Arc<maestro_engine::Orchestrator>,
    task: &TaskRecord,
) -> Option<String> {
    let candidate = task.session_id.clone().or_else(|| {
        let chain_id = task.chain_id.as_deref()?;
        orch.store
            .tasks_by_chain(chain_id)
            .ok()?
            .into_iter()
            .find_map(|t| t.session_id)
    });
    candidate.filter(|id| matches!(orch.store.get_session(id), Ok(Some(_))))
}

fn task_attachments(task: &TaskRecord) -> Vec<AttachmentFile> {
    let Some(ref value) = task.attachments else {
        return Vec::new();
    };
    let Some(list) = value.as_array() else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|item| {
            Some(AttachmentFile {
                name: item.get("name")?.as_str()?.to_string(),
                data: item.get("data")?.as_str()?.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_engine::{Orchestrator, SkillLibrary};
    use maestro_store::{NewSession, NewTask, Store};

    fn orchestrator() -> Arc<Orchestrator> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        Orchestrator::with_parts(
            maestro_core::MaestroConfig::default(),
            store,
            SkillLibrary::empty(),
        )
    }

    #[test]
    fn chain_member_adopts_predecessor_session() {
        let orch = orchestrator();
        let session = orch.store.create_session(NewSession::default()).unwrap();
        // Step 1 ran already and is linked to the shared session.
        orch.store
            .create_task(NewTask {
                title: "step 1".into(),
                status: TaskStatus::Done,
                session_id: Some(session.id.clone()),
                chain_id: Some("ch".into()),
                ..Default::default()
            })
            .unwrap();
        let step2 = orch
            .store
            .create_task(NewTask {
                title: "step 2".into(),
                status: TaskStatus::Todo,
                chain_id: Some("ch".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(
            resolve_session_id(&orch, &step2).as_deref(),
            Some(session.id.as_str())
        );
    }

    #[test]
    fn unlinked_task_gets_no_session() {
        let orch = orchestrator();
        let task = orch
            .store
            .create_task(NewTask {
                title: "solo".into(),
                status: TaskStatus::Todo,
                ..Default::default()
            })
            .unwrap();
        assert!(resolve_session_id(&orch, &task).is_none());
    }

    #[test]
    fn dangling_session_link_is_ignored() {
        let orch = orchestrator();
        let task = orch
            .store
            .create_task(NewTask {
                title: "orphaned".into(),
                status: TaskStatus::Todo,
                session_id: Some("deleted-session".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(resolve_session_id(&orch, &task).is_none());
    }

    #[test]
    fn classification_table() {
        assert!(matches!(classify(TurnStatus::Success, false), Verdict::Done));
        assert!(matches!(
            classify(TurnStatus::Cancelled, false),
            Verdict::UserCancelled
        ));
        assert!(matches!(
            classify(TurnStatus::Incomplete, false),
            Verdict::Retryable(FailureReason::AgentIncomplete)
        ));
        assert!(matches!(
            classify(TurnStatus::Incomplete, true),
            Verdict::Retryable(FailureReason::RateLimited)
        ));
        assert!(matches!(
            classify(TurnStatus::Failed, false),
            Verdict::Retryable(FailureReason::Exception)
        ));
    }

    #[test]
    fn attachments_parse_name_data_pairs() {
        let task = TaskRecord {
            attachments: Some(serde_json::json!([
                {"name": "notes.md", "data": "aGk="},
                {"bogus": true}
            ])),
            ..blank_task()
        };
        let files = task_attachments(&task);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "notes.md");
    }

    fn blank_task() -> TaskRecord {
        TaskRecord {
            id: "t-1".into(),
            title: "t".into(),
            description: String::new(),
            notes: None,
            status: TaskStatus::Todo,
            sort_order: 0,
            session_id: None,
            workdir: None,
            model: None,
            mode: None,
            agent_mode: None,
            max_turns: None,
            attachments: None,
            depends_on: Vec::new(),
            chain_id: None,
            source_session_id: None,
            failure_reason: None,
            retry_count: 0,
            worker_pid: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}
