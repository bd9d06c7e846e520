use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use maestro_agent::toolconfig::PluginConfigStore;
use maestro_core::config::{ASK_TIMEOUT_SECS, IDLE_EVICT_SECS, MaestroConfig};
use maestro_protocol::server::{QueueItem, ServerEvent};
use maestro_store::Store;

use crate::ask::{AskBridge, ANSWER_TIMEOUT};
use crate::error::Result;
use crate::proxy::ClientProxy;
use crate::skills::SkillLibrary;
use crate::turn::TurnRequest;

pub use crate::proxy::ClientSink;

/// One in-flight interactive turn.
pub struct ActiveTurn {
    pub proxy: Arc<ClientProxy>,
    pub cancel: CancellationToken,
    pub tab_id: Option<String>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveTurn {
    pub fn new(proxy: Arc<ClientProxy>, cancel: CancellationToken, tab_id: Option<String>) -> Self {
        Self {
            proxy,
            cancel,
            tab_id,
            idle_timer: Mutex::new(None),
        }
    }

    fn replace_idle_timer(&self, timer: Option<JoinHandle<()>>) {
        let mut slot = self.idle_timer.lock().unwrap();
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = timer;
    }
}

/// A chat turn parked behind an already-running one.
#[derive(Clone)]
pub struct QueuedChat {
    pub queue_id: String,
    pub request: TurnRequest,
}

/// Process-wide engine state. Everything the source kept in module-level
/// maps lives here so lifetime is explicit and tests can run isolated
/// orchestrators side by side.
pub struct Orchestrator {
    pub config: MaestroConfig,
    pub store: Arc<Store>,
    pub library: SkillLibrary,
    pub plugin_configs: Arc<PluginConfigStore>,
    /// Bearer secret the loopback plugin endpoints require.
    pub plugin_secret: String,
    pub ask: AskBridge,
    /// session id → in-flight interactive turn.
    pub active_turns: DashMap<String, Arc<ActiveTurn>>,
    /// session id → subscriber connections.
    watchers: DashMap<String, Vec<ClientSink>>,
    /// session id → accumulated text of the in-flight interactive turn.
    pub chat_buffers: DashMap<String, String>,
    /// session id → accumulated text of the in-flight kanban task.
    pub task_buffers: DashMap<String, String>,
    /// session id → running kanban task id.
    pub running_tasks: DashMap<String, String>,
    /// session id → chat turns waiting for the current one to finish.
    session_queues: DashMap<String, VecDeque<QueuedChat>>,
    /// Wakes the task scheduler immediately after state transitions.
    pub scheduler_kick: Notify,
}

impl Orchestrator {
    pub fn new(config: MaestroConfig, store: Arc<Store>) -> Result<Arc<Self>> {
        let library = SkillLibrary::load(config.assistant.library_path.as_deref())?;
        Ok(Self::with_parts(config, store, library))
    }

    /// Assemble an orchestrator from explicit parts. Tests use this to run
    /// isolated instances against in-memory stores.
    pub fn with_parts(config: MaestroConfig, store: Arc<Store>, library: SkillLibrary) -> Arc<Self> {
        let plugin_configs = PluginConfigStore::new().expect("temp dir must be writable");
        plugin_configs.sweep();
        Arc::new(Self {
            config,
            store,
            library,
            plugin_configs,
            plugin_secret: maestro_core::ids::plugin_secret(),
            ask: AskBridge::new(),
            active_turns: DashMap::new(),
            watchers: DashMap::new(),
            chat_buffers: DashMap::new(),
            task_buffers: DashMap::new(),
            running_tasks: DashMap::new(),
            session_queues: DashMap::new(),
            scheduler_kick: Notify::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Serialise once and write to every open subscriber of the session.
    /// Closed entries are pruned opportunistically.
    pub fn broadcast(&self, session_id: &str, event: &ServerEvent) {
        let json = event.to_json();
        if let Some(mut sinks) = self.watchers.get_mut(session_id) {
            sinks.retain(|sink| !sink.is_closed());
            for sink in sinks.iter() {
                let _ = sink.try_send(json.clone());
            }
        }
    }

    /// Route an event to whoever is listening: the interactive proxy when a
    /// turn is active, the subscriber set otherwise.
    pub fn emit(&self, session_id: &str, event: &ServerEvent) {
        if let Some(turn) = self.active_turns.get(session_id) {
            turn.proxy.send(event);
            return;
        }
        self.broadcast(session_id, event);
    }

    fn add_watcher(&self, session_id: &str, sink: &ClientSink) {
        let mut sinks = self.watchers.entry(session_id.to_string()).or_default();
        if !sinks.iter().any(|s| s.same_channel(sink)) {
            sinks.push(sink.clone());
        }
    }

    pub fn remove_watcher(&self, session_id: &str, sink: &ClientSink) {
        if let Some(mut sinks) = self.watchers.get_mut(session_id) {
            sinks.retain(|s| !s.same_channel(sink) && !s.is_closed());
        }
    }

    fn has_live_watcher(&self, session_id: &str) -> bool {
        self.watchers
            .get(session_id)
            .is_some_and(|sinks| sinks.iter().any(|s| !s.is_closed()))
    }

    // -----------------------------------------------------------------------
    // Subscribe + catch-up
    // -----------------------------------------------------------------------

    /// Attach a connection to a session's stream, replaying whatever an
    /// absent client missed.
    pub fn subscribe(
        self: &Arc<Self>,
        session_id: &str,
        sink: &ClientSink,
        no_catch_up: bool,
    ) -> Result<()> {
        self.add_watcher(session_id, sink);

        if let Some(turn) = self.active_turns.get(session_id) {
            turn.replace_idle_timer(None);
        }
        if no_catch_up {
            return Ok(());
        }

        if let Some(task_id) = self.running_tasks.get(session_id).map(|t| t.clone()) {
            // Kanban run in flight: synthetic start plus the full buffer.
            send_event(
                sink,
                &ServerEvent::TaskStarted {
                    session_id: session_id.to_string(),
                    task_id: Some(task_id),
                    tab_id: None,
                },
            );
            if let Some(text) = self.task_buffers.get(session_id) {
                if !text.is_empty() {
                    send_event(
                        sink,
                        &ServerEvent::Text {
                            text: text.clone(),
                            tab_id: None,
                            catch_up: true,
                        },
                    );
                }
            }
        } else if let Some(turn) = self
            .active_turns
            .get(session_id)
            .filter(|t| !t.cancel.is_cancelled())
        {
            // Interactive turn in flight: replay the accumulated text, then
            // drain the proxy minus its stale text frames, then go live.
            let text = self
                .chat_buffers
                .get(session_id)
                .map(|t| t.clone())
                .unwrap_or_default();
            if !text.is_empty() {
                send_event(
                    sink,
                    &ServerEvent::Text {
                        text,
                        tab_id: turn.tab_id.clone(),
                        catch_up: true,
                    },
                );
            }
            turn.proxy.attach(sink.clone(), true);
            send_event(
                sink,
                &ServerEvent::TaskResumed {
                    session_id: session_id.to_string(),
                    tab_id: turn.tab_id.clone(),
                },
            );
            for (request_id, question, questions) in self.ask.pending_for_session(session_id) {
                send_event(
                    sink,
                    &ServerEvent::AskUser {
                        request_id,
                        question,
                        questions,
                        tab_id: turn.tab_id.clone(),
                    },
                );
            }
        } else {
            match self.store.get_session(session_id)? {
                Some(session) => {
                    if let Some(last_user_msg) = session.last_user_msg {
                        send_event(
                            sink,
                            &ServerEvent::TaskInterrupted {
                                session_id: session_id.to_string(),
                                last_user_msg,
                                retry_count: session.retry_count,
                                tab_id: None,
                            },
                        );
                    }
                }
                // Subscribed to a session the GC (or a delete) took away.
                None => send_event(
                    sink,
                    &ServerEvent::TaskLost {
                        session_id: session_id.to_string(),
                        tab_id: None,
                    },
                ),
            }
        }

        // Finally: the pending chat queue, so the client can render it.
        let items = self.queue_snapshot(session_id);
        if !items.is_empty() {
            send_event(
                sink,
                &ServerEvent::QueueUpdate {
                    tab_id: None,
                    pending: items.len(),
                    items,
                },
            );
        }
        Ok(())
    }

    /// Connection-death bookkeeping: detached turns with no remaining
    /// subscriber get an eviction timer.
    pub fn handle_disconnect(self: &Arc<Self>) {
        let orphaned: Vec<String> = self
            .active_turns
            .iter()
            .filter(|entry| {
                !entry.value().proxy.is_attached() && !self.has_live_watcher(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in orphaned {
            self.arm_idle_timer(&session_id);
        }
    }

    /// Arm (or re-arm) the idle-eviction timer for a detached turn.
    pub fn arm_idle_timer(self: &Arc<Self>, session_id: &str) {
        let Some(turn) = self.active_turns.get(session_id).map(|t| Arc::clone(&t)) else {
            return;
        };
        let orch = Arc::clone(self);
        let session = session_id.to_string();
        info!(session_id = %session, "idle eviction timer armed");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(IDLE_EVICT_SECS)).await;
            let still_orphaned = orch
                .active_turns
                .get(&session)
                .is_some_and(|t| !t.proxy.is_attached())
                && !orch.has_live_watcher(&session);
            if still_orphaned {
                info!(session_id = %session, "idle turn evicted");
                if let Some(turn) = orch.active_turns.get(&session) {
                    turn.cancel.cancel();
                }
            }
        });
        turn.replace_idle_timer(Some(handle));
    }

    // -----------------------------------------------------------------------
    // Ask-user bridge
    // -----------------------------------------------------------------------

    /// Register a question from the subprocess, route it to the client, and
    /// arm the answer timeout. The returned receiver resolves with the
    /// answer text.
    pub fn post_question(
        self: &Arc<Self>,
        request_id: &str,
        session_id: &str,
        question: String,
        questions: Value,
    ) -> tokio::sync::oneshot::Receiver<String> {
        let rx = self
            .ask
            .register(request_id, session_id, question.clone(), questions.clone());

        let orch = Arc::clone(self);
        let rid = request_id.to_string();
        let sid = session_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(ASK_TIMEOUT_SECS)).await;
            if orch.ask.resolve(&rid, ANSWER_TIMEOUT) {
                debug!(request_id = %rid, "ask-user timed out");
                orch.emit(&sid, &ServerEvent::AskUserTimeout { request_id: rid });
            }
        });
        self.ask.set_timer(request_id, timer);

        let tab_id = self
            .active_turns
            .get(session_id)
            .and_then(|t| t.tab_id.clone());
        self.emit(
            session_id,
            &ServerEvent::AskUser {
                request_id: request_id.to_string(),
                question,
                questions,
                tab_id,
            },
        );
        rx
    }

    // -----------------------------------------------------------------------
    // Chat queue
    // -----------------------------------------------------------------------

    pub fn enqueue_chat(&self, session_id: &str, chat: QueuedChat) {
        self.session_queues
            .entry(session_id.to_string())
            .or_default()
            .push_back(chat);
        self.emit_queue_update(session_id);
    }

    pub fn queue_remove(&self, queue_id: &str) -> bool {
        for mut entry in self.session_queues.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|c| c.queue_id != queue_id);
            if entry.value().len() != before {
                let session_id = entry.key().clone();
                drop(entry);
                self.emit_queue_update(&session_id);
                return true;
            }
        }
        false
    }

    pub fn queue_edit(&self, queue_id: &str, text: &str) -> bool {
        for mut entry in self.session_queues.iter_mut() {
            if let Some(chat) = entry
                .value_mut()
                .iter_mut()
                .find(|c| c.queue_id == queue_id)
            {
                chat.request.text = text.to_string();
                let session_id = entry.key().clone();
                drop(entry);
                self.emit_queue_update(&session_id);
                return true;
            }
        }
        false
    }

    /// Take the next parked chat, if any. The turn runner calls this from
    /// its teardown to auto-run the head of the queue.
    pub fn dequeue_chat(&self, session_id: &str) -> Option<QueuedChat> {
        let next = self
            .session_queues
            .get_mut(session_id)
            .and_then(|mut q| q.pop_front());
        if next.is_some() {
            self.emit_queue_update(session_id);
        }
        next
    }

    pub fn queue_snapshot(&self, session_id: &str) -> Vec<QueueItem> {
        self.session_queues
            .get(session_id)
            .map(|q| {
                q.iter()
                    .map(|c| QueueItem {
                        queue_id: c.queue_id.clone(),
                        text: c.request.text.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn emit_queue_update(&self, session_id: &str) {
        let items = self.queue_snapshot(session_id);
        self.emit(
            session_id,
            &ServerEvent::QueueUpdate {
                tab_id: None,
                pending: items.len(),
                items,
            },
        );
    }

    // -----------------------------------------------------------------------
    // Stop / shutdown
    // -----------------------------------------------------------------------

    /// Cancel the active interactive turn for a session, if any.
    pub fn stop_session(&self, session_id: &str) -> bool {
        match self.active_turns.get(session_id) {
            Some(turn) => {
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything (graceful shutdown path).
    pub fn stop_all(&self) {
        for entry in self.active_turns.iter() {
            entry.value().cancel.cancel();
        }
    }
}

fn send_event(sink: &ClientSink, event: &ServerEvent) {
    let _ = sink.try_send(event.to_json());
}
