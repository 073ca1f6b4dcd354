//! Realtime connection manager
//!
//! Two layers, the same split as a service state machine and its runner:
//! - `handle_event(state, event, policy)` is a pure transition function
//!   returning the next state and one action
//! - `ConnectionManager` owns the transport, executes the actions (open a
//!   session, arm the retry timer, give up, close) and feeds transport
//!   callbacks back in as events
//!
//! Invariants:
//! - at most one retry timer and one live transport per manager
//! - `attempt` resets to 0 on a successful handshake and on `disconnect()`
//! - callbacks from a superseded transport carry a stale generation and are
//!   ignored
//!
//! Subscriptions die with the transport. Features that must survive a
//! reconnect register an `on_connected` hook and resubscribe from it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::frame::{Command, Frame};
use crate::registry::{ListenerId, Message, SubscriptionRegistry};
use crate::transport::{Connector, TransportEvent, TransportSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed attempts since the last successful handshake.
    pub attempt: u32,
    /// A retry timer is armed.
    pub retry_pending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// `connect()` was called
    ConnectRequested,
    /// Broker accepted the handshake
    HandshakeSucceeded,
    /// Transport could not be opened or the handshake was refused
    HandshakeFailed(String),
    /// A live transport dropped
    TransportLost(String),
    /// The retry timer expired
    RetryTimerFired,
    /// `disconnect()` was called
    DisconnectRequested,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Open a new transport session
    OpenTransport,
    /// Arm the single retry timer
    ScheduleRetry { delay: Duration },
    /// Stop retrying until the next explicit `connect()`
    GiveUp { attempts: u32 },
    /// Cancel everything and close the transport
    CloseTransport,
    None,
}

/// Pure transition function: no I/O, no clocks.
pub fn handle_event(
    state: ConnectionState,
    event: ConnectionEvent,
    policy: &ReconnectPolicy,
) -> (ConnectionState, ConnectionAction) {
    use ConnectionStatus::*;

    match (state.status, event) {
        (Disconnected, ConnectionEvent::ConnectRequested) => (
            ConnectionState {
                status: Connecting,
                retry_pending: false,
                ..state
            },
            ConnectionAction::OpenTransport,
        ),

        (Connecting | Connected, ConnectionEvent::ConnectRequested) => (state, ConnectionAction::None),

        (Connecting, ConnectionEvent::HandshakeSucceeded) => (
            ConnectionState {
                status: Connected,
                attempt: 0,
                retry_pending: false,
            },
            ConnectionAction::None,
        ),

        (Connecting, ConnectionEvent::HandshakeFailed(_))
        | (Connected, ConnectionEvent::TransportLost(_)) => backoff(state, policy),

        (Disconnected, ConnectionEvent::RetryTimerFired) if state.retry_pending => (
            ConnectionState {
                status: Connecting,
                retry_pending: false,
                ..state
            },
            ConnectionAction::OpenTransport,
        ),

        (_, ConnectionEvent::DisconnectRequested) => {
            (ConnectionState::default(), ConnectionAction::CloseTransport)
        }

        (_, _) => (state, ConnectionAction::None),
    }
}

fn backoff(state: ConnectionState, policy: &ReconnectPolicy) -> (ConnectionState, ConnectionAction) {
    if state.attempt < policy.max_attempts {
        let delay = policy.delay_for_attempt(state.attempt);
        (
            ConnectionState {
                status: ConnectionStatus::Disconnected,
                attempt: state.attempt + 1,
                retry_pending: true,
            },
            ConnectionAction::ScheduleRetry { delay },
        )
    } else {
        (
            ConnectionState {
                status: ConnectionStatus::Disconnected,
                attempt: state.attempt,
                retry_pending: false,
            },
            ConnectionAction::GiveUp {
                attempts: state.attempt,
            },
        )
    }
}

/// Runs after every successful handshake, outside any lock.
pub type ConnectedHook = Arc<dyn Fn(&ConnectionManager) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Default)]
struct Shared {
    machine: ConnectionState,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<Frame>>,
    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl Shared {
    fn connected_sender(&self) -> Option<&mpsc::UnboundedSender<Frame>> {
        self.outgoing
            .as_ref()
            .filter(|_| self.machine.status == ConnectionStatus::Connected)
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    /// Lock order: `shared` before `registry`.
    shared: Mutex<Shared>,
    registry: Mutex<SubscriptionRegistry>,
    hooks: Mutex<Vec<(HookId, ConnectedHook)>>,
    next_hook: AtomicU64,
    status_tx: watch::Sender<ConnectionStatus>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one managed realtime connection. Clones share it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                shared: Mutex::new(Shared::default()),
                registry: Mutex::new(SubscriptionRegistry::new()),
                hooks: Mutex::new(Vec::new()),
                next_hook: AtomicU64::new(0),
                status_tx,
            }),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.shared).machine
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    pub fn attempt(&self) -> u32 {
        self.state().attempt
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Open the connection. No-op while connecting or connected; cancels a
    /// pending retry timer and connects now otherwise.
    pub fn connect(&self) {
        self.apply(ConnectionEvent::ConnectRequested, None);
    }

    /// Cancel any retry, unsubscribe everything, close the transport and reset
    /// the attempt counter. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.apply(ConnectionEvent::DisconnectRequested, None);
    }

    /// Subscribe `key` to `topic`. Returns false, registering nothing, when
    /// not connected: callers resubscribe from an `on_connected` hook.
    pub fn subscribe<F>(&self, key: &str, topic: &str, handler: F) -> bool
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let shared = lock(&self.inner.shared);
        let Some(tx) = shared.connected_sender() else {
            debug!(key, topic, "not connected, subscription ignored");
            return false;
        };
        let (id, replaced) = lock(&self.inner.registry).insert(key, topic, Arc::new(handler));
        if let Some(old) = replaced {
            let _ = tx.send(Frame::unsubscribe(&old));
        }
        debug!(key, topic, id = %id, "subscribed");
        tx.send(Frame::subscribe(&id, topic)).is_ok()
    }

    /// Remove the subscription under `key`. Returns whether one existed.
    pub fn unsubscribe(&self, key: &str) -> bool {
        let shared = lock(&self.inner.shared);
        let Some(id) = lock(&self.inner.registry).remove(key) else {
            return false;
        };
        if let Some(tx) = shared.connected_sender() {
            let _ = tx.send(Frame::unsubscribe(&id));
        }
        debug!(key, "unsubscribed");
        true
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        lock(&self.inner.registry).contains(key)
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    /// Fire a JSON message at `destination`. Returns false, and the message is
    /// dropped, when not connected. Delivery is never confirmed.
    pub fn send(&self, destination: &str, body: &Value) -> bool {
        let shared = lock(&self.inner.shared);
        match shared.connected_sender() {
            Some(tx) => tx.send(Frame::send(destination, body.to_string())).is_ok(),
            None => {
                debug!(destination, "not connected, message dropped");
                false
            }
        }
    }

    /// Observe every message routed through subscription `key`. Listeners
    /// survive reconnects.
    pub fn add_listener<F>(&self, key: &str, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        lock(&self.inner.registry).add_listener(key, Arc::new(listener))
    }

    /// Observe every routed message, whatever its subscription.
    pub fn add_global_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        lock(&self.inner.registry).add_global_listener(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        lock(&self.inner.registry).remove_listener(id)
    }

    /// Run `hook` after every successful handshake, and right away if the
    /// connection is already up.
    pub fn on_connected<F>(&self, hook: F) -> HookId
    where
        F: Fn(&ConnectionManager) + Send + Sync + 'static,
    {
        let id = HookId(self.inner.next_hook.fetch_add(1, Ordering::Relaxed));
        let hook: ConnectedHook = Arc::new(hook);
        lock(&self.inner.hooks).push((id, hook.clone()));
        if self.is_connected() {
            hook(self);
        }
        id
    }

    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut hooks = lock(&self.inner.hooks);
        let before = hooks.len();
        hooks.retain(|(h, _)| *h != id);
        hooks.len() != before
    }

    /// Feed one event through the state machine and execute the action.
    /// Events tagged with a generation are dropped when it is stale.
    fn apply(&self, event: ConnectionEvent, generation: Option<u64>) {
        let mut shared = lock(&self.inner.shared);
        if generation.is_some_and(|g| g != shared.generation) {
            debug!(?event, "ignoring event from superseded transport");
            return;
        }
        let reason = match &event {
            ConnectionEvent::HandshakeFailed(r) | ConnectionEvent::TransportLost(r) => Some(r.clone()),
            _ => None,
        };
        let (next, action) = handle_event(shared.machine, event, &self.inner.policy);
        shared.machine = next;
        self.execute(&mut shared, action, reason);
        self.publish(next.status);
    }

    fn execute(&self, shared: &mut Shared, action: ConnectionAction, reason: Option<String>) {
        match action {
            ConnectionAction::OpenTransport => {
                shared.generation += 1;
                abort(&mut shared.retry_timer);
                abort(&mut shared.connect_task);
                abort(&mut shared.reader_task);
                shared.outgoing = None;

                let weak = Arc::downgrade(&self.inner);
                let generation = shared.generation;
                debug!(generation, attempt = shared.machine.attempt, "opening realtime transport");
                shared.connect_task = Some(tokio::spawn(run_connect(weak, generation)));
            }
            ConnectionAction::ScheduleRetry { delay } => {
                self.drop_transport(shared);
                abort(&mut shared.retry_timer);

                let attempt = shared.machine.attempt;
                info!(
                    attempt,
                    max_attempts = self.inner.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "scheduling realtime reconnect"
                );
                metrics::counter!("realtime_reconnects_scheduled_total").increment(1);

                let weak = Arc::downgrade(&self.inner);
                let generation = shared.generation;
                shared.retry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        ConnectionManager { inner }.apply(ConnectionEvent::RetryTimerFired, Some(generation));
                    }
                }));
            }
            ConnectionAction::GiveUp { attempts } => {
                self.drop_transport(shared);
                error!(
                    attempts,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "realtime reconnect attempts exhausted, giving up until connect() is called"
                );
            }
            ConnectionAction::CloseTransport => {
                shared.generation += 1;
                abort(&mut shared.retry_timer);
                abort(&mut shared.connect_task);
                abort(&mut shared.reader_task);

                let ids = lock(&self.inner.registry).drain();
                if let Some(tx) = shared.outgoing.take() {
                    for id in &ids {
                        let _ = tx.send(Frame::unsubscribe(id));
                    }
                    let _ = tx.send(Frame::disconnect());
                    info!(unsubscribed = ids.len(), "realtime disconnected");
                }
            }
            ConnectionAction::None => {}
        }
    }

    /// Forget the current transport after it failed. The calling task is the
    /// transport's own connect or reader task, so handles are detached rather
    /// than aborted.
    fn drop_transport(&self, shared: &mut Shared) {
        shared.outgoing = None;
        shared.connect_task = None;
        shared.reader_task = None;
        let dropped = lock(&self.inner.registry).drain();
        if !dropped.is_empty() {
            debug!(subscriptions = dropped.len(), "subscriptions dropped with transport");
        }
    }

    fn publish(&self, status: ConnectionStatus) {
        self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        let gauge = if status == ConnectionStatus::Connected { 1.0 } else { 0.0 };
        metrics::gauge!("realtime_connected").set(gauge);
    }

    /// Handshake completed for `generation`: install the session, start the
    /// reader, then run the hooks.
    fn on_session(&self, session: TransportSession, generation: u64) {
        let TransportSession { outgoing, incoming } = session;
        {
            let mut shared = lock(&self.inner.shared);
            if shared.generation != generation {
                debug!(generation, "handshake finished for superseded transport, closing it");
                return;
            }
            let (next, action) = handle_event(
                shared.machine,
                ConnectionEvent::HandshakeSucceeded,
                &self.inner.policy,
            );
            shared.machine = next;
            shared.outgoing = Some(outgoing);
            shared.connect_task = None;
            shared.reader_task = Some(tokio::spawn(read_loop(
                Arc::downgrade(&self.inner),
                incoming,
                generation,
            )));
            self.execute(&mut shared, action, None);
            self.publish(next.status);
        }
        info!(generation, "realtime connected");

        let hooks: Vec<ConnectedHook> = lock(&self.inner.hooks)
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook(self);
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.command {
            Command::Message => {
                let delivery = lock(&self.inner.registry).route(&frame);
                if let Some(delivery) = delivery {
                    delivery.deliver();
                }
            }
            Command::Error => {
                warn!(
                    message = frame.get("message").unwrap_or(""),
                    body = %frame.body,
                    "broker sent ERROR frame"
                );
            }
            other => debug!(command = other.as_str(), "ignoring frame"),
        }
    }
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

async fn run_connect(weak: Weak<Inner>, generation: u64) {
    let Some(connector) = weak.upgrade().map(|inner| inner.connector.clone()) else {
        return;
    };
    let result = connector.connect().await;
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let manager = ConnectionManager { inner };
    match result {
        Ok(session) => manager.on_session(session, generation),
        Err(e) => {
            warn!(error = %e, "realtime handshake failed");
            manager.apply(ConnectionEvent::HandshakeFailed(e.to_string()), Some(generation));
        }
    }
}

async fn read_loop(
    weak: Weak<Inner>,
    mut incoming: mpsc::UnboundedReceiver<TransportEvent>,
    generation: u64,
) {
    let reason = loop {
        let Some(event) = incoming.recv().await else {
            break "transport channel closed".to_string();
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Frame(frame) => ConnectionManager { inner }.handle_frame(frame),
            TransportEvent::Closed(reason) => {
                break reason.unwrap_or_else(|| "closed by broker".to_string());
            }
        }
    };
    if let Some(inner) = weak.upgrade() {
        warn!(reason = %reason, "realtime transport lost");
        ConnectionManager { inner }.apply(ConnectionEvent::TransportLost(reason), Some(generation));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::ConnectFuture;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// In-memory broker end of one fake session.
    pub(crate) struct Remote {
        pub sent: mpsc::UnboundedReceiver<Frame>,
        pub push: mpsc::UnboundedSender<TransportEvent>,
    }

    /// Connector driven by a script: each `connect()` pops one outcome,
    /// failing once the script runs out.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        script: Mutex<VecDeque<bool>>,
        pub attempts: Mutex<Vec<Instant>>,
        remotes: Mutex<VecDeque<Remote>>,
    }

    impl FakeConnector {
        pub fn scripted(outcomes: &[bool]) -> Arc<Self> {
            let connector = Self::default();
            connector.script.lock().unwrap().extend(outcomes);
            Arc::new(connector)
        }

        pub fn push_outcome(&self, ok: bool) {
            self.script.lock().unwrap().push_back(ok);
        }

        pub fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }

        pub fn take_remote(&self) -> Remote {
            self.remotes.lock().unwrap().pop_front().expect("no open session")
        }
    }

    impl Connector for FakeConnector {
        fn connect(&self) -> ConnectFuture<'_> {
            Box::pin(async move {
                self.attempts.lock().unwrap().push(Instant::now());
                let ok = self.script.lock().unwrap().pop_front().unwrap_or(false);
                if !ok {
                    return Err(Error::Connect("connection refused".into()));
                }
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                self.remotes.lock().unwrap().push_back(Remote {
                    sent: out_rx,
                    push: in_tx,
                });
                Ok(TransportSession {
                    outgoing: out_tx,
                    incoming: in_rx,
                })
            })
        }
    }

    pub(crate) fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        }
    }

    pub(crate) async fn wait_for(manager: &ConnectionManager, status: ConnectionStatus) {
        let mut rx = manager.watch_status();
        rx.wait_for(|s| *s == status).await.unwrap();
    }

    /// Let spawned tasks run; with paused time this also fires due timers.
    pub(crate) async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // --- pure state machine ---

    #[test]
    fn backoff_doubles_then_caps() {
        let p = ReconnectPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        };
        let delays: Vec<u64> = (0..6).map(|a| p.delay_for_attempt(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000, 5000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(p.delay_for_attempt(64), Duration::from_millis(5000));
    }

    #[test]
    fn three_failures_schedule_three_retries_then_give_up() {
        let p = policy(3);
        let mut state = ConnectionState::default();
        let mut delays = Vec::new();

        let (next, action) = handle_event(state, ConnectionEvent::ConnectRequested, &p);
        assert_eq!(action, ConnectionAction::OpenTransport);
        state = next;

        loop {
            let (next, action) = handle_event(state, ConnectionEvent::HandshakeFailed("refused".into()), &p);
            state = next;
            match action {
                ConnectionAction::ScheduleRetry { delay } => {
                    delays.push(delay);
                    assert!(state.retry_pending);
                    let (next, action) = handle_event(state, ConnectionEvent::RetryTimerFired, &p);
                    assert_eq!(action, ConnectionAction::OpenTransport);
                    state = next;
                }
                ConnectionAction::GiveUp { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                other => panic!("unexpected action {other:?}"),
            }
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(!state.retry_pending);
        // A stray timer after giving up does nothing
        let (after, action) = handle_event(state, ConnectionEvent::RetryTimerFired, &p);
        assert_eq!((after, action), (state, ConnectionAction::None));
    }

    #[test]
    fn connect_while_connected_keeps_attempt() {
        let p = policy(3);
        let state = ConnectionState {
            status: ConnectionStatus::Connected,
            attempt: 0,
            retry_pending: false,
        };
        assert_eq!(
            handle_event(state, ConnectionEvent::ConnectRequested, &p),
            (state, ConnectionAction::None)
        );

        let connecting = ConnectionState {
            status: ConnectionStatus::Connecting,
            attempt: 2,
            retry_pending: false,
        };
        assert_eq!(
            handle_event(connecting, ConnectionEvent::ConnectRequested, &p),
            (connecting, ConnectionAction::None)
        );
    }

    #[test]
    fn success_resets_attempt_and_disconnect_resets_all() {
        let p = policy(3);
        let state = ConnectionState {
            status: ConnectionStatus::Connecting,
            attempt: 2,
            retry_pending: false,
        };
        let (state, _) = handle_event(state, ConnectionEvent::HandshakeSucceeded, &p);
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.attempt, 0);

        let waiting = ConnectionState {
            status: ConnectionStatus::Disconnected,
            attempt: 2,
            retry_pending: true,
        };
        let (state, action) = handle_event(waiting, ConnectionEvent::DisconnectRequested, &p);
        assert_eq!(action, ConnectionAction::CloseTransport);
        assert_eq!(state, ConnectionState::default());
    }

    // --- manager ---

    #[tokio::test(start_paused = true)]
    async fn reconnect_ceiling_then_manual_connect() {
        let connector = FakeConnector::scripted(&[]);
        let manager = ConnectionManager::new(connector.clone(), policy(3));

        manager.connect();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let attempts = connector.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 4, "initial attempt plus three retries");
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(!manager.state().retry_pending);

        // Nothing more happens on its own
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempt_count(), 4);

        // Explicit connect tries again; success resets the counter
        connector.push_outcome(true);
        manager.connect();
        wait_for(&manager, ConnectionStatus::Connected).await;
        assert_eq!(connector.attempt_count(), 5);
        assert_eq!(manager.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_while_connected() {
        let connector = FakeConnector::scripted(&[true, true]);
        let manager = ConnectionManager::new(connector.clone(), policy(3));

        manager.connect();
        wait_for(&manager, ConnectionStatus::Connected).await;
        manager.connect();
        manager.connect();
        settle().await;

        assert_eq!(connector.attempt_count(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_then_success_resets_attempt() {
        let connector = FakeConnector::scripted(&[false, false, true]);
        let manager = ConnectionManager::new(connector.clone(), policy(5));

        manager.connect();
        wait_for(&manager, ConnectionStatus::Connected).await;

        assert_eq!(connector.attempt_count(), 3);
        assert_eq!(manager.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_subscribe_and_send_are_rejected() {
        let connector = FakeConnector::scripted(&[]);
        let manager = ConnectionManager::new(connector, policy(1));

        assert!(!manager.subscribe("room-1", "/topic/chat/1", |_| {}));
        assert!(!manager.is_subscribed("room-1"));
        assert!(!manager.send("/app/chat/1/send", &serde_json::json!({"content": "hi"})));
        assert!(!manager.unsubscribe("room-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_dispatch_unsubscribe() {
        let connector = FakeConnector::scripted(&[true]);
        let manager = ConnectionManager::new(connector.clone(), policy(3));
        manager.connect();
        wait_for(&manager, ConnectionStatus::Connected).await;
        let mut remote = connector.take_remote();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        assert!(manager.subscribe("room-1", "/topic/chat/1", move |m| {
            sink.lock().unwrap().push(m.body.clone())
        }));

        let subscribe = remote.sent.recv().await.unwrap();
        assert_eq!(subscribe.command, Command::Subscribe);
        assert_eq!(subscribe.get("destination"), Some("/topic/chat/1"));
        let id = subscribe.get("id").unwrap().to_string();

        let message = |body: &str| {
            TransportEvent::Frame(
                Frame::new(Command::Message)
                    .header("subscription", id.as_str())
                    .header("destination", "/topic/chat/1")
                    .body(body),
            )
        };
        remote.push.send(message(r#"{"n":1}"#)).unwrap();
        remote.push.send(message("not json")).unwrap();
        remote.push.send(message(r#"{"n":2}"#)).unwrap();
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]
        );
        assert!(manager.is_connected(), "a bad frame must not drop the connection");

        assert!(manager.send("/app/chat/1/send", &serde_json::json!({"content": "yo"})));
        let send = remote.sent.recv().await.unwrap();
        assert_eq!(send.command, Command::Send);
        assert_eq!(send.body, r#"{"content":"yo"}"#);

        assert!(manager.unsubscribe("room-1"));
        let unsubscribe = remote.sent.recv().await.unwrap();
        assert_eq!(unsubscribe.command, Command::Unsubscribe);
        assert_eq!(unsubscribe.get("id"), Some(id.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_loss_reconnects_and_hooks_resubscribe() {
        let connector = FakeConnector::scripted(&[true, true]);
        let manager = ConnectionManager::new(connector.clone(), policy(3));
        manager.on_connected(|m| {
            m.subscribe("user-7", "/user/7/queue/notifications", |_| {});
        });

        manager.connect();
        wait_for(&manager, ConnectionStatus::Connected).await;
        let mut first = connector.take_remote();
        assert_eq!(first.sent.recv().await.unwrap().command, Command::Subscribe);

        first.push.send(TransportEvent::Closed(Some("network down".into()))).unwrap();
        wait_for(&manager, ConnectionStatus::Disconnected).await;
        assert!(!manager.is_subscribed("user-7"));
        assert_eq!(manager.attempt(), 1);

        wait_for(&manager, ConnectionStatus::Connected).await;
        let mut second = connector.take_remote();
        let resubscribe = second.sent.recv().await.unwrap();
        assert_eq!(resubscribe.command, Command::Subscribe);
        assert_eq!(resubscribe.get("destination"), Some("/user/7/queue/notifications"));
        assert!(manager.is_subscribed("user-7"));
        assert_eq!(manager.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_unsubscribes_and_closes() {
        let connector = FakeConnector::scripted(&[true]);
        let manager = ConnectionManager::new(connector.clone(), policy(3));
        manager.connect();
        wait_for(&manager, ConnectionStatus::Connected).await;
        let mut remote = connector.take_remote();

        manager.subscribe("room-1", "/topic/chat/1", |_| {});
        manager.subscribe("room-2", "/topic/chat/2", |_| {});
        manager.disconnect();
        manager.disconnect();

        let mut commands = Vec::new();
        while let Some(frame) = remote.sent.recv().await {
            commands.push(frame.command);
        }
        assert_eq!(
            commands,
            vec![
                Command::Subscribe,
                Command::Subscribe,
                Command::Unsubscribe,
                Command::Unsubscribe,
                Command::Disconnect
            ]
        );
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let connector = FakeConnector::scripted(&[]);
        let manager = ConnectionManager::new(connector.clone(), policy(5));

        manager.connect();
        settle().await;
        assert!(manager.state().retry_pending);
        assert_eq!(manager.attempt(), 1);

        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(manager.state(), ConnectionState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_during_backoff_connects_now() {
        let connector = FakeConnector::scripted(&[false, true]);
        let manager = ConnectionManager::new(connector.clone(), policy(5));

        manager.connect();
        settle().await;
        assert!(manager.state().retry_pending);

        manager.connect();
        wait_for(&manager, ConnectionStatus::Connected).await;
        // The cancelled timer never fires a second handshake
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempt_count(), 2);
    }
}
