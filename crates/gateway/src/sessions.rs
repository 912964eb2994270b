//! Client session registry: connection bookkeeping, per-client rolling
//! rate windows, subscription channels, broadcast, and drain.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_protocol::ClientFrame;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rolling windows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counts events inside a rolling time window.
pub struct RollingWindow {
    span: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl RollingWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(&self, events: &mut VecDeque<Instant>) {
        let cutoff = Instant::now() - self.span;
        while events.front().is_some_and(|t| *t < cutoff) {
            events.pop_front();
        }
    }

    /// Record one event and return the in-window count including it.
    pub fn record(&self) -> u32 {
        let mut events = self.events.lock();
        self.prune(&mut events);
        events.push_back(Instant::now());
        events.len() as u32
    }

    /// In-window count without recording.
    pub fn count(&self) -> u32 {
        let mut events = self.events.lock();
        self.prune(&mut events);
        events.len() as u32
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ClientConnection {
    pub id: String,
    pub sink: mpsc::Sender<ClientFrame>,
    pub connected_at: DateTime<Utc>,
    authenticated: AtomicBool,
    subscriptions: Mutex<HashSet<String>>,
    /// Auth failures in the rolling minute.
    pub auth_failures: RollingWindow,
    /// Messages in the rolling minute.
    pub messages: RollingWindow,
    /// Cancelled on disconnect or forced close; in-flight work derived
    /// from this client observes it.
    pub cancel: CancellationToken,
}

impl ClientConnection {
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn subscribe(&self, channels: &[String]) {
        let mut subs = self.subscriptions.lock();
        for channel in channels {
            subs.insert(channel.clone());
        }
    }

    pub fn unsubscribe(&self, channels: &[String]) {
        let mut subs = self.subscriptions.lock();
        for channel in channels {
            subs.remove(channel);
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.lock().contains(channel)
    }

    /// Best-effort frame delivery; a full or closed sink drops the frame
    /// (the socket writer owns backpressure policy).
    pub fn send(&self, frame: ClientFrame) -> bool {
        self.sink.try_send(frame).is_ok()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<ClientConnection>>>,
    accepting: AtomicBool,
    max_sessions: usize,
}

impl ClientRegistry {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            max_sessions,
        })
    }

    /// Register a new connection. `None` when draining or at capacity.
    pub fn register(&self, sink: mpsc::Sender<ClientFrame>) -> Option<Arc<ClientConnection>> {
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }
        let mut clients = self.clients.write();
        if clients.len() >= self.max_sessions {
            return None;
        }
        let connection = Arc::new(ClientConnection {
            id: uuid::Uuid::new_v4().to_string(),
            sink,
            connected_at: Utc::now(),
            authenticated: AtomicBool::new(false),
            subscriptions: Mutex::new(HashSet::new()),
            auth_failures: RollingWindow::new(Duration::from_secs(60)),
            messages: RollingWindow::new(Duration::from_secs(60)),
            cancel: CancellationToken::new(),
        });
        clients.insert(connection.id.clone(), connection.clone());
        metrics::gauge!("aegis_active_sessions", clients.len() as f64);
        Some(connection)
    }

    pub fn remove(&self, id: &str) {
        let mut clients = self.clients.write();
        if let Some(connection) = clients.remove(id) {
            connection.cancel.cancel();
        }
        metrics::gauge!("aegis_active_sessions", clients.len() as f64);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientConnection>> {
        self.clients.read().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .values()
            .map(|c| ClientInfo {
                id: c.id.clone(),
                authenticated: c.is_authenticated(),
                connected_at: c.connected_at,
                subscriptions: c.subscriptions.lock().iter().cloned().collect(),
            })
            .collect()
    }

    /// Send to every authenticated client passing `filter`.
    pub fn broadcast<F>(&self, frame: &ClientFrame, filter: F) -> usize
    where
        F: Fn(&ClientConnection) -> bool,
    {
        let clients = self.clients.read();
        let mut delivered = 0;
        for connection in clients.values() {
            if connection.is_authenticated() && filter(connection) {
                if connection.send(frame.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn send_to(&self, id: &str, frame: ClientFrame) -> bool {
        self.clients
            .read()
            .get(id)
            .map(|c| c.send(frame))
            .unwrap_or(false)
    }

    /// Publish an event to subscribers of `channel`.
    pub fn publish(&self, channel: &str, event: &str, data: serde_json::Value) -> usize {
        let frame = ClientFrame::system(event, data);
        self.broadcast(&frame, |c| c.is_subscribed(channel))
    }

    /// Force-close every connection (end of drain, or hard shutdown).
    pub fn close_all(&self) {
        for connection in self.clients.read().values() {
            connection.cancel.cancel();
        }
    }

    /// Orderly drain: stop accepting, tell clients, poll for departure
    /// every 500 ms, cancel whoever remains at the deadline.
    pub async fn drain(&self, timeout: Duration) {
        self.accepting.store(false, Ordering::Release);
        let frame = ClientFrame::system(
            "server.shutdown",
            serde_json::json!({ "message": "server shutting down" }),
        );
        self.broadcast(&frame, |_| true);

        let deadline = Instant::now() + timeout;
        while self.count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let residual = self.count();
        if residual > 0 {
            tracing::warn!(residual, "drain deadline reached, terminating sockets");
            self.close_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_protocol::FrameType;

    fn registry() -> Arc<ClientRegistry> {
        ClientRegistry::new(8)
    }

    fn connect(registry: &ClientRegistry) -> (Arc<ClientConnection>, mpsc::Receiver<ClientFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (registry.register(tx).unwrap(), rx)
    }

    #[test]
    fn rolling_window_counts() {
        let window = RollingWindow::new(Duration::from_secs(60));
        for _ in 0..4 {
            window.record();
        }
        assert_eq!(window.count(), 4);
        assert_eq!(window.record(), 5);
    }

    #[tokio::test]
    async fn broadcast_reaches_authenticated_only() {
        let registry = registry();
        let (a, mut a_rx) = connect(&registry);
        let (_b, mut b_rx) = connect(&registry);
        a.set_authenticated();

        let frame = ClientFrame::system("event", serde_json::json!({}));
        let delivered = registry.broadcast(&frame, |_| true);
        assert_eq!(delivered, 1);
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_respects_subscriptions() {
        let registry = registry();
        let (a, mut a_rx) = connect(&registry);
        let (b, mut b_rx) = connect(&registry);
        a.set_authenticated();
        b.set_authenticated();
        a.subscribe(&["agents".into()]);

        let delivered = registry.publish("agents", "agent.state.changed", serde_json::json!({}));
        assert_eq!(delivered, 1);
        let frame = a_rx.try_recv().unwrap();
        assert_eq!(frame.frame_type, FrameType::System);
        assert!(b_rx.try_recv().is_err());

        a.unsubscribe(&["agents".into()]);
        assert_eq!(
            registry.publish("agents", "agent.state.changed", serde_json::json!({})),
            0
        );
    }

    #[tokio::test]
    async fn capacity_and_drain_gate_registration() {
        let registry = ClientRegistry::new(1);
        let (tx, _rx) = mpsc::channel(1);
        let first = registry.register(tx.clone()).unwrap();
        assert!(registry.register(tx.clone()).is_none(), "at capacity");

        registry.remove(&first.id);
        assert!(first.cancel.is_cancelled());

        let second = registry.register(tx.clone()).unwrap();
        registry.drain(Duration::from_millis(10)).await;
        assert!(!registry.is_accepting());
        assert!(registry.register(tx).is_none(), "draining rejects new sessions");
        assert!(second.cancel.is_cancelled());
    }
}
