use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Answer used when the asking subprocess outlives the session.
pub const ANSWER_SESSION_ENDED: &str = "[Session ended]";
/// Answer used when a user skips the question.
pub const ANSWER_SKIPPED: &str = "[Skipped by user]";
/// Answer used when nobody responds within the timeout.
pub const ANSWER_TIMEOUT: &str = "[No response — proceed with your best judgment.]";

struct PendingQuestion {
    session_id: String,
    question: String,
    questions: Value,
    resolve: oneshot::Sender<String>,
    timer: Option<JoinHandle<()>>,
}

/// In-process registry of questions posted by the subprocess over the
/// loopback `/ask` endpoint. The HTTP request is held open on the oneshot
/// receiver until a client answers, cancels, or the timer fires.
#[derive(Default)]
pub struct AskBridge {
    pending: DashMap<String, PendingQuestion>,
}

impl AskBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a question and return the receiver the HTTP handler awaits.
    ///
    /// A previous entry under the same request id is displaced (its caller
    /// gets a closed channel, which maps to the timeout answer).
    pub fn register(
        &self,
        request_id: &str,
        session_id: &str,
        question: String,
        questions: Value,
    ) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.to_string(),
            PendingQuestion {
                session_id: session_id.to_string(),
                question,
                questions,
                resolve: tx,
                timer: None,
            },
        );
        rx
    }

    /// Attach the timeout task handle so resolution can abort it.
    pub fn set_timer(&self, request_id: &str, timer: JoinHandle<()>) {
        if let Some(mut entry) = self.pending.get_mut(request_id) {
            entry.timer = Some(timer);
        } else {
            // Resolved before the timer was registered; nothing to time out.
            timer.abort();
        }
    }

    /// Resolve one pending question. Returns false if the id is unknown
    /// (already answered, timed out, or never registered).
    pub fn resolve(&self, request_id: &str, answer: &str) -> bool {
        let Some((_, pending)) = self.pending.remove(request_id) else {
            return false;
        };
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        debug!(request_id, "ask-user question resolved");
        let _ = pending.resolve.send(answer.to_string());
        true
    }

    /// Resolve every question belonging to a session (teardown path).
    pub fn resolve_session(&self, session_id: &str, answer: &str) {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.resolve(&id, answer);
        }
    }

    /// Snapshot of a session's open questions, for re-posting on reconnect.
    pub fn pending_for_session(&self, session_id: &str) -> Vec<(String, String, Value)> {
        self.pending
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().question.clone(),
                    e.value().questions.clone(),
                )
            })
            .collect()
    }
}

/// Normalise the inbound `/ask` body to a uniform `questions[]` list.
///
/// Legacy callers send a single `question` with optional `options` and
/// `inputType`; new callers send `questions` directly.
pub fn normalize_questions(
    question: &str,
    questions: Option<&Value>,
    options: Option<&Value>,
    input_type: Option<&str>,
) -> Value {
    if let Some(list) = questions.filter(|q| q.is_array() && !q.as_array().unwrap().is_empty()) {
        return list.clone();
    }
    let multi = matches!(input_type, Some("multi_select") | Some("multi_choice"));
    serde_json::json!([{
        "question": question,
        "options": options.cloned().unwrap_or(Value::Array(vec![])),
        "multiSelect": multi,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_answer() {
        let bridge = AskBridge::new();
        let rx = bridge.register("r1", "s1", "A or B?".into(), Value::Null);
        assert!(bridge.resolve("r1", "A"));
        assert_eq!(rx.await.unwrap(), "A");
        assert!(!bridge.resolve("r1", "again"), "double resolve must be a no-op");
    }

    #[tokio::test]
    async fn session_teardown_resolves_all_pending() {
        let bridge = AskBridge::new();
        let rx1 = bridge.register("r1", "s1", "q1".into(), Value::Null);
        let rx2 = bridge.register("r2", "s1", "q2".into(), Value::Null);
        let rx3 = bridge.register("r3", "other", "q3".into(), Value::Null);

        bridge.resolve_session("s1", ANSWER_SESSION_ENDED);
        assert_eq!(rx1.await.unwrap(), ANSWER_SESSION_ENDED);
        assert_eq!(rx2.await.unwrap(), ANSWER_SESSION_ENDED);
        assert!(bridge.resolve("r3", "still here"));
        assert_eq!(rx3.await.unwrap(), "still here");
    }

    #[test]
    fn normalize_wraps_legacy_single_question() {
        let qs = normalize_questions(
            "A or B?",
            None,
            Some(&serde_json::json!(["A", "B"])),
            Some("single_choice"),
        );
        assert_eq!(qs[0]["question"], "A or B?");
        assert_eq!(qs[0]["options"][1], "B");
        assert_eq!(qs[0]["multiSelect"], false);
    }

    #[test]
    fn normalize_passes_explicit_list_through() {
        let list = serde_json::json!([{"question":"x","options":[],"multiSelect":true}]);
        let qs = normalize_questions("ignored", Some(&list), None, None);
        assert_eq!(qs, list);
    }

    #[test]
    fn normalize_multi_select_flag() {
        let qs = normalize_questions("pick", None, None, Some("multi_select"));
        assert_eq!(qs[0]["multiSelect"], true);
    }

    #[test]
    fn pending_snapshot_filters_by_session() {
        let bridge = AskBridge::new();
        let _rx1 = bridge.register("r1", "s1", "q1".into(), Value::Null);
        let _rx2 = bridge.register("r2", "s2", "q2".into(), Value::Null);
        let pending = bridge.pending_for_session("s1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, "r1");
        assert_eq!(pending[0].1, "q1");
    }
}
