// src/session/mod.rs

//! Client sessions
//!
//! A session is the durable, reconnect-tolerant state for one logical client
//! connection. Transport comes and goes; the session survives: outbound
//! messages queue while disconnected and replay in order on rejoin, in-flight
//! orchestration keeps running, and only a reconnect window elapsing (or an
//! explicit cancel) ends the session and its owned work.
//!
//! Concurrency shape: the session's processing worker is the only actor that
//! reads its transport; outbound delivery is drained by at most one drain
//! worker at a time (mutual exclusion on the drain lock); orchestration
//! workers are attached to the session through child cancel tokens so ending
//! the session cascades into everything it owns.

pub mod dispatch;
pub mod message;

pub use dispatch::{Dispatcher, PermissionCheck};
pub use message::{Event, OutboundMessage, Request, RequestOutcome};

use crate::context::CancelToken;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tracing::{debug, info, warn};

/// Inbound half of a session transport
pub type TransportReader = Box<dyn AsyncBufRead + Send + Unpin>;
/// Outbound half of a session transport
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The identity tuple a session is keyed by
///
/// An elevation or user mismatch on the same nominal client/session id is a
/// security-relevant inconsistency, which is why all four fields participate
/// in identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub client_id: String,
    pub session_id: String,
    pub elevated: bool,
    pub user_id: u32,
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    /// Terminal; a session object is never reused after this
    Ended,
}

/// One reconnect-tolerant client session
pub struct Session {
    key: SessionKey,
    /// Synchronous transports need idle keep-alives; asynchronous ones do not
    synchronous: bool,
    reconnect_window: Duration,
    state: Mutex<SessionState>,
    outbound: Mutex<VecDeque<OutboundMessage>>,
    /// Wakes the drain worker: new message, disconnect, or end
    queue_signal: Notify,
    /// Mutual exclusion on who drains the outbound queue
    drain_lock: AsyncMutex<()>,
    writer: AsyncMutex<Option<TransportWriter>>,
    readers_tx: mpsc::UnboundedSender<TransportReader>,
    readers_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<TransportReader>>>,
    cancel: CancelToken,
    /// Cancel tokens of in-flight requests, by correlation id
    requests: Mutex<HashMap<String, CancelToken>>,
    /// Per-session request cache, cleared at end
    cache: Mutex<HashMap<String, Value>>,
}

impl Session {
    pub fn new(key: SessionKey, synchronous: bool, reconnect_window: Duration) -> Arc<Self> {
        let (readers_tx, readers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            key,
            synchronous,
            reconnect_window,
            state: Mutex::new(SessionState::Connecting),
            outbound: Mutex::new(VecDeque::new()),
            queue_signal: Notify::new(),
            drain_lock: AsyncMutex::new(()),
            writer: AsyncMutex::new(None),
            readers_tx,
            readers_rx: AsyncMutex::new(Some(readers_rx)),
            cancel: CancelToken::new(),
            requests: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SessionState::Ended
    }

    /// The session-scoped cancel token; request tokens are children of it
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Attach (or re-attach) transport handles
    ///
    /// Flips the session to Connected, hands the reader to the processing
    /// worker, and starts a drain worker for the outbound queue. On rejoin
    /// the queue drains from its head, replaying anything the previous
    /// connection never delivered.
    pub async fn attach(self: Arc<Self>, reader: TransportReader, writer: TransportWriter) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Ended {
                return;
            }
            *state = SessionState::Connected;
        }
        *self.writer.lock().await = Some(writer);
        // The processing worker picks this up; a send failure means the
        // worker is gone, which only happens once the session ended.
        let _ = self.readers_tx.send(reader);

        tokio::spawn(async move {
            self.drain_outbound().await;
        });
    }

    /// Queue a message for delivery
    ///
    /// Messages survive disconnection and replay in order after rejoin.
    pub fn enqueue(&self, message: OutboundMessage) {
        if self.is_ended() {
            return;
        }
        self.outbound.lock().push_back(message);
        self.queue_signal.notify_one();
    }

    /// A sender that feeds this session's outbound queue
    ///
    /// Request contexts hold this so resolver and orchestrator events land in
    /// the queue without borrowing the session.
    pub fn outbound_sender(self: Arc<Self>) -> mpsc::UnboundedSender<OutboundMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                self.enqueue(message);
            }
        });
        tx
    }

    pub fn queued_len(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Register an in-flight request so `cancel-request` can reach it
    pub fn track_request(&self, correlation_id: String) -> CancelToken {
        let token = self.cancel.child();
        self.requests.lock().insert(correlation_id, token.clone());
        token
    }

    pub fn finish_request(&self, correlation_id: &str) {
        self.requests.lock().remove(correlation_id);
    }

    /// Cancel one in-flight request by correlation id
    pub fn cancel_request(&self, correlation_id: &str) -> bool {
        if let Some(token) = self.requests.lock().get(correlation_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Read or compute a per-session cache entry
    pub fn cache_get(&self, key: &str) -> Option<Value> {
        self.cache.lock().get(key).cloned()
    }

    pub fn cache_put(&self, key: impl Into<String>, value: Value) {
        self.cache.lock().insert(key.into(), value);
    }

    /// The session's processing worker
    ///
    /// The only reader of this session's transport. Reads requests and hands
    /// them to the dispatcher until the transport drops, then waits up to the
    /// reconnect window for a new transport before ending the session.
    pub async fn run(self: Arc<Self>, dispatcher: Arc<Dispatcher>) {
        let Some(mut readers) = self.readers_rx.lock().await.take() else {
            // A second run() call; the first worker owns the session.
            return;
        };

        if self.synchronous {
            self.clone().spawn_heartbeat();
        }

        loop {
            let next = tokio::select! {
                reader = readers.recv() => reader,
                _ = tokio::time::sleep(self.reconnect_window) => {
                    debug!(session = %self.key.session_id, "reconnect window elapsed");
                    None
                }
                _ = self.cancel.notified() => None,
            };
            let Some(mut reader) = next else { break };

            self.clone().read_requests(&mut reader, &dispatcher).await;
            if self.cancel.is_canceled() {
                break;
            }
            self.mark_disconnected();
        }

        self.end().await;
    }

    /// Read loop over one transport; returns when the transport drops
    async fn read_requests(
        self: Arc<Self>,
        reader: &mut TransportReader,
        dispatcher: &Arc<Dispatcher>,
    ) {
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                read = reader.read_line(&mut line) => read,
                _ = self.cancel.notified() => return,
            };
            match read {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) => {
                    debug!(session = %self.key.session_id, error = %err, "transport read failed");
                    return;
                }
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Request>(trimmed) {
                Ok(request) => dispatcher.dispatch(self.clone(), request).await,
                Err(err) => {
                    warn!(session = %self.key.session_id, error = %err, "unparsable request");
                }
            }
        }
    }

    /// Periodic keep-alives while a synchronous transport is idle
    fn spawn_heartbeat(self: Arc<Self>) {
        // A third of the window keeps traffic well inside any read timeout
        // the client derives from it.
        let interval = self.reconnect_window / 3;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.cancel.notified() => return,
                }
                if self.is_ended() {
                    return;
                }
                if self.state() == SessionState::Connected && self.queued_len() == 0 {
                    self.enqueue(OutboundMessage::broadcast(Event::KeepAlive));
                }
            }
        });
    }

    /// The outbound drain worker
    ///
    /// Holds the drain lock for its lifetime so at most one drainer writes
    /// at a time. A message leaves the queue only after its write succeeds;
    /// a write failure is an implicit disconnect and the message stays
    /// queued for replay.
    async fn drain_outbound(self: Arc<Self>) {
        let _drain_guard = self.drain_lock.lock().await;

        loop {
            if self.is_ended() || self.cancel.is_canceled() {
                return;
            }
            if self.state() != SessionState::Connected {
                return;
            }

            let front = self.outbound.lock().front().cloned();
            let message = match front {
                Some(message) => message,
                None => {
                    tokio::select! {
                        _ = self.queue_signal.notified() => {}
                        _ = self.cancel.notified() => return,
                    }
                    continue;
                }
            };

            let mut payload = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    // Drop the message rather than wedge the queue.
                    warn!(session = %self.key.session_id, error = %err, "unserializable outbound message");
                    self.outbound.lock().pop_front();
                    continue;
                }
            };
            payload.push('\n');

            let mut writer = self.writer.lock().await;
            let Some(w) = writer.as_mut() else {
                return;
            };
            match w.write_all(payload.as_bytes()).await {
                Ok(()) => {
                    let _ = w.flush().await;
                    drop(writer);
                    self.outbound.lock().pop_front();
                }
                Err(err) => {
                    // Implicit disconnect; the message remains queued.
                    debug!(session = %self.key.session_id, error = %err, "outbound write failed");
                    *writer = None;
                    drop(writer);
                    self.mark_disconnected();
                    return;
                }
            }
        }
    }

    fn mark_disconnected(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Connected {
            info!(session = %self.key.session_id, "session disconnected, retaining state");
            *state = SessionState::Disconnected;
        }
        drop(state);
        // Wake a drainer parked on an empty queue so it observes the change.
        self.queue_signal.notify_one();
    }

    /// Terminal teardown: cancel owned work, clear the per-session cache,
    /// release transport resources
    pub async fn end(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Ended {
                return;
            }
            *state = SessionState::Ended;
        }
        info!(session = %self.key.session_id, client = %self.key.client_id, "session ended");
        self.cancel.cancel();
        self.requests.lock().clear();
        self.cache.lock().clear();
        self.outbound.lock().clear();
        *self.writer.lock().await = None;
        self.queue_signal.notify_one();
    }
}

/// Result of presenting a connection's identity tuple to the registry
pub enum ClaimOutcome {
    /// A fresh session; the caller must spawn its processing worker
    Created(Arc<Session>),
    /// An existing session reattached; its worker is already running
    Rejoined(Arc<Session>),
}

/// All live sessions in the process
///
/// At most one active session exists per identity tuple. A new connection
/// with a matching tuple rejoins the existing session; partial matches (same
/// client and session id, different elevation or user) are ended, never
/// reused.
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<Session>>>,
    reconnect_window: Duration,
}

impl SessionRegistry {
    pub fn new(reconnect_window: Duration) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            reconnect_window,
        }
    }

    /// Claim the session for an arriving connection
    pub fn claim(&self, key: SessionKey, synchronous: bool) -> ClaimOutcome {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_ended());

        let mut full_matches: Vec<Arc<Session>> = Vec::new();
        let mut partial_matches: Vec<Arc<Session>> = Vec::new();
        for session in sessions.iter() {
            let k = session.key();
            if k.client_id == key.client_id && k.session_id == key.session_id {
                if *k == key {
                    full_matches.push(session.clone());
                } else {
                    partial_matches.push(session.clone());
                }
            }
        }

        // An elevation/user mismatch on the same nominal session id is
        // treated as a security-relevant inconsistency.
        for stale in partial_matches {
            warn!(session = %key.session_id, "ending session with mismatched elevation or user");
            end_in_background(stale);
        }

        match full_matches.len() {
            1 => {
                debug!(session = %key.session_id, "rejoining existing session");
                ClaimOutcome::Rejoined(full_matches.remove(0))
            }
            0 => {
                let session = Session::new(key, synchronous, self.reconnect_window);
                sessions.push(session.clone());
                ClaimOutcome::Created(session)
            }
            _ => {
                // Should not happen; end every match defensively and start
                // over with a clean session.
                warn!(session = %key.session_id, "multiple matching sessions, ending all");
                for stale in &full_matches {
                    sessions.retain(|s| !Arc::ptr_eq(s, stale));
                }
                for stale in full_matches {
                    end_in_background(stale);
                }
                let session = Session::new(key, synchronous, self.reconnect_window);
                sessions.push(session.clone());
                ClaimOutcome::Created(session)
            }
        }
    }

    /// Live (non-ended) session count
    pub fn active_count(&self) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_ended());
        sessions.len()
    }

    /// End every session (daemon shutdown)
    pub async fn end_all(&self) {
        let drained: Vec<Arc<Session>> = std::mem::take(&mut *self.sessions.lock());
        for session in drained {
            session.end().await;
        }
    }
}

fn end_in_background(session: Arc<Session>) {
    tokio::spawn(async move {
        session.end().await;
    });
}
