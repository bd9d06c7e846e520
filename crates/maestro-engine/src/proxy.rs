use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use maestro_core::config::PROXY_QUEUE_CAP;
use maestro_protocol::server::{FrameKind, ServerEvent};

/// Outbound half of one client connection: serialized frames in, socket out.
pub type ClientSink = mpsc::Sender<String>;

struct QueuedFrame {
    kind: FrameKind,
    json: String,
}

struct ProxyInner {
    conn: Option<ClientSink>,
    queue: VecDeque<QueuedFrame>,
}

/// Buffered bridge between a session runner and the current client
/// connection. Survives reconnects: while no connection is attached, frames
/// accumulate in a bounded queue that `attach` drains to the newcomer.
///
/// `send` never fails: a closed or missing connection buffers, and a full
/// queue silently drops the overflow.
pub struct ClientProxy {
    inner: Mutex<ProxyInner>,
}

impl ClientProxy {
    pub fn new(conn: Option<ClientSink>) -> Self {
        Self {
            inner: Mutex::new(ProxyInner {
                conn,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn send(&self, event: &ServerEvent) {
        self.send_frame(event.kind(), event.to_json());
    }

    fn send_frame(&self, kind: FrameKind, json: String) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ref conn) = inner.conn {
            match conn.try_send(json) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Closed(json)) => {
                    inner.conn = None;
                    enqueue(&mut inner.queue, QueuedFrame { kind, json });
                }
                Err(mpsc::error::TrySendError::Full(json)) => {
                    enqueue(&mut inner.queue, QueuedFrame { kind, json });
                }
            }
        } else {
            enqueue(&mut inner.queue, QueuedFrame { kind, json });
        }
    }

    /// Attach a (re)connected client and drain the queue to it.
    ///
    /// With `drop_text` set, queued text and thinking frames are discarded;
    /// the caller has just replayed the accumulated buffer and re-sending
    /// them would duplicate prose. Tool/status/done frames are retained.
    pub fn attach(&self, conn: ClientSink, drop_text: bool) {
        let mut inner = self.inner.lock().unwrap();
        let queued = std::mem::take(&mut inner.queue);
        let mut dropped = 0usize;
        for frame in queued {
            if drop_text && matches!(frame.kind, FrameKind::Text | FrameKind::Thinking) {
                dropped += 1;
                continue;
            }
            // A connection that dies mid-drain loses the remainder; the next
            // attach starts from the live stream again.
            let _ = conn.try_send(frame.json);
        }
        if dropped > 0 {
            debug!(dropped, "queued text frames discarded on reattach");
        }
        inner.conn = Some(conn);
    }

    /// Drop the active connection, keeping the buffer.
    pub fn detach(&self) {
        self.inner.lock().unwrap().conn = None;
    }

    pub fn is_attached(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.conn.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// The currently attached connection, if it is still open.
    pub fn sink(&self) -> Option<ClientSink> {
        let inner = self.inner.lock().unwrap();
        inner.conn.clone().filter(|c| !c.is_closed())
    }
}

fn enqueue(queue: &mut VecDeque<QueuedFrame>, frame: QueuedFrame) {
    if queue.len() >= PROXY_QUEUE_CAP {
        return; // overflow is dropped silently
    }
    queue.push_back(frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(t: &str) -> ServerEvent {
        ServerEvent::Text {
            text: t.into(),
            tab_id: None,
            catch_up: false,
        }
    }

    fn done() -> ServerEvent {
        ServerEvent::Done {
            tab_id: None,
            duration: 1,
        }
    }

    #[tokio::test]
    async fn attached_connection_receives_immediately() {
        let (tx, mut rx) = mpsc::channel(8);
        let proxy = ClientProxy::new(Some(tx));
        proxy.send(&text("hi"));
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"hi\""));
    }

    #[tokio::test]
    async fn detached_frames_buffer_and_drain_on_attach() {
        let proxy = ClientProxy::new(None);
        proxy.send(&text("one"));
        proxy.send(&done());

        let (tx, mut rx) = mpsc::channel(8);
        proxy.attach(tx, false);
        assert!(rx.recv().await.unwrap().contains("one"));
        assert!(rx.recv().await.unwrap().contains("done"));
    }

    #[tokio::test]
    async fn reattach_drops_text_keeps_control_frames() {
        let proxy = ClientProxy::new(None);
        proxy.send(&text("stale prose"));
        proxy.send(&ServerEvent::Tool {
            tool: "Bash".into(),
            input: "{}".into(),
            tab_id: None,
        });
        proxy.send(&done());

        let (tx, mut rx) = mpsc::channel(8);
        proxy.attach(tx, true);
        let first = rx.recv().await.unwrap();
        assert!(first.contains("\"tool\""), "text should be gone: {first}");
        let second = rx.recv().await.unwrap();
        assert!(second.contains("\"done\""));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_closed_connection_does_not_panic_and_buffers() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let proxy = ClientProxy::new(Some(tx));
        proxy.send(&text("lost?"));
        assert!(!proxy.is_attached());

        let (tx2, mut rx2) = mpsc::channel(8);
        proxy.attach(tx2, false);
        assert!(rx2.recv().await.unwrap().contains("lost?"));
    }

    #[tokio::test]
    async fn queue_overflow_is_dropped_silently() {
        let proxy = ClientProxy::new(None);
        for i in 0..(PROXY_QUEUE_CAP + 10) {
            proxy.send(&text(&format!("m{i}")));
        }
        let (tx, mut rx) = mpsc::channel(PROXY_QUEUE_CAP + 16);
        proxy.attach(tx, false);
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, PROXY_QUEUE_CAP);
    }
}
