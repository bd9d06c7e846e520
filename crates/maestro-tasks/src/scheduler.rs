use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maestro_core::config::SCHEDULER_TICK_SECS;
use maestro_engine::Orchestrator;
use maestro_protocol::server::ServerEvent;
use maestro_store::{FailureReason, TaskRecord, TaskStatus};

use crate::error::Result;
use crate::{kanban, signal};

/// Background worker that pulls eligible `todo` tasks and starts kanban
/// runs for them, holding the per-session, per-workdir, and worker-count
/// invariants at dispatch time.
pub struct TaskScheduler {
    pub orch: Arc<Orchestrator>,
    /// task id → abort handle of its running kanban turn.
    pub(crate) running_aborts: DashMap<String, CancellationToken>,
    /// Tasks being manually moved out of `in_progress`; the terminal
    /// handler must not overwrite their status.
    pub(crate) stopping: DashMap<String, ()>,
    /// task id → earliest next dispatch (retry backoff hints).
    pub(crate) backoff_until: DashMap<String, Instant>,
}

impl TaskScheduler {
    pub fn new(orch: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self {
            orch,
            running_aborts: DashMap::new(),
            stopping: DashMap::new(),
            backoff_until: DashMap::new(),
        })
    }

    /// Main loop: a periodic tick plus immediate wake-ups after task
    /// transitions (`Orchestrator::scheduler_kick`).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("task scheduler started");
        let mut interval =
            tokio::time::interval(Duration::from_secs(SCHEDULER_TICK_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.orch.scheduler_kick.notified() => {}
                _ = shutdown.cancelled() => {
                    info!("task scheduler shutting down");
                    self.abort_all();
                    return;
                }
            }
            if let Err(e) = self.tick() {
                error!("scheduler tick failed: {e}");
            }
        }
    }

    /// One dispatch pass. Also called directly by tests.
    pub fn tick(self: &Arc<Self>) -> Result<()> {
        let todo = self.orch.store.list_todo_tasks()?;
        if todo.is_empty() {
            return Ok(());
        }
        let in_progress = self.orch.store.list_in_progress_tasks()?;

        let mut busy_sessions: HashSet<String> = in_progress
            .iter()
            .filter_map(|t| t.session_id.clone())
            .collect();
        let mut busy_workdirs: HashSet<String> = in_progress
            .iter()
            .filter_map(|t| t.workdir.clone())
            .collect();
        let mut independent = in_progress
            .iter()
            .filter(|t| t.session_id.is_none())
            .count();

        let now = Instant::now();
        for task in todo {
            // Dispatched but not yet marked in_progress by its runner.
            if self.running_aborts.contains_key(&task.id) {
                continue;
            }
            if self
                .backoff_until
                .get(&task.id)
                .is_some_and(|until| *until > now)
            {
                continue;
            }

            match self.dependency_state(&task)? {
                DepState::Ready => {}
                DepState::Waiting => continue,
                DepState::Failed => {
                    self.cascade_cancel(&task)?;
                    continue;
                }
            }

            if let Some(ref workdir) = task.workdir {
                // Workdir locking is cooperative and dispatch-time only:
                // interactive chat turns in the same directory are not
                // blocked here.
                if busy_workdirs.contains(workdir) {
                    continue;
                }
            }

            if let Some(ref session_id) = task.session_id {
                if busy_sessions.contains(session_id) {
                    continue;
                }
                busy_sessions.insert(session_id.clone());
            } else {
                if independent >= self.orch.config.limits.max_task_workers {
                    debug!(task_id = %task.id, "worker cap reached, task stays queued");
                    continue;
                }
                independent += 1;
            }
            if let Some(ref workdir) = task.workdir {
                busy_workdirs.insert(workdir.clone());
            }

            self.start(task);
        }
        Ok(())
    }

    fn start(self: &Arc<Self>, task: TaskRecord) {
        let cancel = CancellationToken::new();
        self.running_aborts.insert(task.id.clone(), cancel.clone());
        self.backoff_until.remove(&task.id);
        info!(task_id = %task.id, title = %task.title, "task dispatched");

        let sched = Arc::clone(self);
        tokio::spawn(async move {
            kanban::run_task(sched, task, cancel).await;
        });
    }

    fn dependency_state(&self, task: &TaskRecord) -> Result<DepState> {
        for dep_id in &task.depends_on {
            match self.orch.store.get_task(dep_id)? {
                // A deleted dependency can never complete; same cascade as
                // a cancelled one.
                None => return Ok(DepState::Failed),
                Some(dep) if dep.status == TaskStatus::Cancelled => {
                    return Ok(DepState::Failed)
                }
                Some(dep) if dep.status != TaskStatus::Done => return Ok(DepState::Waiting),
                Some(_) => {}
            }
        }
        Ok(DepState::Ready)
    }

    fn cascade_cancel(&self, task: &TaskRecord) -> Result<()> {
        warn!(task_id = %task.id, "dependency failed, cascading cancellation");
        self.orch
            .store
            .finish_task(&task.id, TaskStatus::Cancelled, Some(FailureReason::DepFailed))?;
        if let Some(ref source) = task.source_session_id {
            self.orch.broadcast(
                source,
                &ServerEvent::Notification {
                    session_id: Some(source.clone()),
                    level: "warning".to_string(),
                    title: format!("Task cancelled: {}", task.title),
                    detail: Some("a dependency was cancelled".to_string()),
                    progress: None,
                },
            );
        }
        // A cascade can unblock (or cascade into) other tasks immediately.
        self.orch.scheduler_kick.notify_one();
        Ok(())
    }

    /// Manual move of a task out of `in_progress`: remember it is being
    /// stopped so the terminal handler leaves the status alone, then signal
    /// the run: by abort handle when we own one, by recorded pid when the
    /// run belongs to a previous process lifetime.
    pub fn request_stop(&self, task: &TaskRecord) {
        self.stopping.insert(task.id.clone(), ());
        if let Some(handle) = self.running_aborts.get(&task.id) {
            handle.cancel();
        } else if let Some(pid) = task.worker_pid {
            signal::terminate(pid);
        }
    }

    /// Whether a terminal handler should skip its status write.
    pub(crate) fn take_stopping(&self, task_id: &str) -> bool {
        self.stopping.remove(task_id).is_some()
    }

    pub(crate) fn set_backoff(&self, task_id: &str, delay: Duration) {
        self.backoff_until
            .insert(task_id.to_string(), Instant::now() + delay);
    }

    fn abort_all(&self) {
        for entry in self.running_aborts.iter() {
            entry.value().cancel();
        }
    }
}

enum DepState {
    Ready,
    Waiting,
    Failed,
}

/// Backoff hint for a retried task.
pub(crate) fn retry_backoff(reason: FailureReason, attempt: u32) -> Duration {
    match reason {
        FailureReason::RateLimited => {
            Duration::from_secs((60 * attempt.max(1) as u64).min(300))
        }
        FailureReason::Exception => Duration::from_secs(5),
        _ => Duration::from_secs(3),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_engine::SkillLibrary;
    use maestro_store::{NewTask, Store};

    fn scheduler() -> Arc<TaskScheduler> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let orch = Orchestrator::with_parts(
            maestro_core::MaestroConfig::default(),
            store,
            SkillLibrary::empty(),
        );
        TaskScheduler::new(orch)
    }

    fn todo_task(sched: &TaskScheduler, title: &str) -> TaskRecord {
        sched
            .orch
            .store
            .create_task(NewTask {
                title: title.into(),
                status: TaskStatus::Todo,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn backoff_schedule_matches_contract() {
        assert_eq!(
            retry_backoff(FailureReason::RateLimited, 1),
            Duration::from_secs(60)
        );
        assert_eq!(
            retry_backoff(FailureReason::RateLimited, 4),
            Duration::from_secs(240)
        );
        assert_eq!(
            retry_backoff(FailureReason::RateLimited, 9),
            Duration::from_secs(300),
            "rate-limit backoff is capped"
        );
        assert_eq!(
            retry_backoff(FailureReason::Exception, 1),
            Duration::from_secs(5)
        );
        assert_eq!(
            retry_backoff(FailureReason::AgentIncomplete, 2),
            Duration::from_secs(3)
        );
    }

    #[tokio::test]
    async fn cancelled_dependency_cascades() {
        let sched = scheduler();
        let dep = todo_task(&sched, "dep");
        sched
            .orch
            .store
            .finish_task(&dep.id, TaskStatus::Cancelled, Some(FailureReason::AgentIncomplete))
            .unwrap();

        let task = sched
            .orch
            .store
            .create_task(NewTask {
                title: "downstream".into(),
                status: TaskStatus::Todo,
                depends_on: vec![dep.id.clone()],
                ..Default::default()
            })
            .unwrap();

        sched.tick().unwrap();
        let task = sched.orch.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.failure_reason, Some(FailureReason::DepFailed));
    }

    #[tokio::test]
    async fn unfinished_dependency_blocks_dispatch() {
        let sched = scheduler();
        let dep = todo_task(&sched, "dep");
        let task = sched
            .orch
            .store
            .create_task(NewTask {
                title: "downstream".into(),
                status: TaskStatus::Todo,
                depends_on: vec![dep.id.clone()],
                ..Default::default()
            })
            .unwrap();

        sched.tick().unwrap();
        // Neither cancelled nor started; the dependency is merely pending.
        // (dep itself dispatches; it has no dependencies.)
        let task = sched.orch.store.get_task(&task.id).unwrap().unwrap();
        assert_ne!(task.status, TaskStatus::Cancelled);
        assert!(!sched.running_aborts.contains_key(&task.id));
    }

    #[tokio::test]
    async fn workdir_occupancy_defers_second_task() {
        let sched = scheduler();
        for title in ["first", "second"] {
            sched
                .orch
                .store
                .create_task(NewTask {
                    title: title.into(),
                    status: TaskStatus::Todo,
                    workdir: Some("/same/repo".into()),
                    ..Default::default()
                })
                .unwrap();
        }

        sched.tick().unwrap();
        // Only one task may hold the workdir, even within a single tick.
        assert_eq!(sched.running_aborts.len(), 1);
    }

    #[tokio::test]
    async fn independent_worker_cap_is_enforced() {
        let sched = scheduler();
        let cap = sched.orch.config.limits.max_task_workers;
        for i in 0..(cap + 3) {
            sched
                .orch
                .store
                .create_task(NewTask {
                    title: format!("t{i}"),
                    status: TaskStatus::Todo,
                    ..Default::default()
                })
                .unwrap();
        }

        sched.tick().unwrap();
        assert_eq!(sched.running_aborts.len(), cap);
    }

    #[tokio::test]
    async fn backoff_hint_defers_dispatch() {
        let sched = scheduler();
        let task = todo_task(&sched, "throttled");
        sched.set_backoff(&task.id, Duration::from_secs(300));

        sched.tick().unwrap();
        assert!(!sched.running_aborts.contains_key(&task.id));
    }

    #[tokio::test]
    async fn request_stop_marks_stopping_and_cancels() {
        let sched = scheduler();
        let task = todo_task(&sched, "running");
        let token = CancellationToken::new();
        sched.running_aborts.insert(task.id.clone(), token.clone());

        sched.request_stop(&task);
        assert!(token.is_cancelled());
        assert!(sched.take_stopping(&task.id));
        assert!(!sched.take_stopping(&task.id), "stopping flag is consumed");
    }
}
