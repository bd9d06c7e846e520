use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use maestro_core::config::RECOVERY_DELAY_SECS;
use maestro_engine::Orchestrator;
use maestro_store::TaskStatus;

use crate::signal;

/// One-shot startup pass over tasks stranded `in_progress` by an unclean
/// shutdown: kill their recorded subprocesses, re-classify them, and kick
/// the scheduler.
///
/// Classification: chain tasks always go back to `todo` (the shared-session
/// text heuristic is unreliable for them); otherwise a session that already
/// holds assistant text means the run finished before the crash → `done`;
/// anything else → `todo`.
pub async fn run(orch: Arc<Orchestrator>) {
    tokio::time::sleep(Duration::from_secs(RECOVERY_DELAY_SECS)).await;

    let stranded = match orch.store.list_in_progress_tasks() {
        Ok(tasks) => tasks,
        Err(e) => {
            error!("recovery scan failed: {e}");
            return;
        }
    };
    if stranded.is_empty() {
        return;
    }
    info!(count = stranded.len(), "recovering stranded tasks");

    for task in stranded {
        if let Some(pid) = task.worker_pid {
            // The process is usually long gone; terminate() ignores that.
            signal::terminate(pid);
        }

        let recovered = if task.chain_id.is_some() {
            TaskStatus::Todo
        } else {
            let has_text = task
                .session_id
                .as_deref()
                .map(|sid| orch.store.has_assistant_text(sid).unwrap_or(false))
                .unwrap_or(false);
            if has_text {
                TaskStatus::Done
            } else {
                TaskStatus::Todo
            }
        };

        info!(
            task_id = %task.id,
            status = %recovered,
            "stranded task re-classified"
        );
        if let Err(e) = orch.store.finish_task(&task.id, recovered, None) {
            warn!(task_id = %task.id, "recovery transition failed: {e}");
        }
    }

    orch.scheduler_kick.notify_one();
}
