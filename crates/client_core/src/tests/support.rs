use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{Identity, MessageId},
    protocol::{ClientRequest, MessagePayload, ServerEvent},
};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::{
    auth_api::{AuthApi, AuthApiError, RefreshGrant},
    credentials::{Credential, CredentialStore},
    error::TransportError,
    realtime::{ReconnectPolicy, SessionEvent},
    refresh::RefreshCoordinator,
    transport::{RealtimeConnector, RealtimeLink},
};

pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn expect_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts: 3,
        connect_timeout: Duration::from_secs(2),
    }
}

pub fn seeded_store(access_token: &str) -> Arc<CredentialStore> {
    let store = Arc::new(CredentialStore::in_memory());
    store
        .set(Credential::new(access_token, "refresh-1"))
        .expect("seed credential");
    store
}

pub fn coordinator(store: Arc<CredentialStore>, auth: Arc<FakeAuthApi>) -> Arc<RefreshCoordinator> {
    RefreshCoordinator::new(store, auth, Duration::from_secs(2))
}

/// Auth endpoints that hand out `access-2`, `access-3`, ... on each refresh.
pub struct FakeAuthApi {
    refresh_calls: AtomicUsize,
    login_calls: AtomicUsize,
    delay: Duration,
    reject_refresh_with: Option<u16>,
}

impl FakeAuthApi {
    pub fn new() -> Arc<Self> {
        Self::build(Duration::ZERO, None)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(delay, None)
    }

    pub fn rejecting(status: u16, delay: Duration) -> Arc<Self> {
        Self::build(delay, Some(status))
    }

    fn build(delay: Duration, reject_refresh_with: Option<u16>) -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            delay,
            reject_refresh_with,
        })
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for FakeAuthApi {
    async fn login(&self, _email: &str, _password: &str) -> Result<Credential, AuthApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::new("access-1", "refresh-1"))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshGrant, AuthApiError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(status) = self.reject_refresh_with {
            return Err(AuthApiError::Rejected {
                status,
                error: None,
            });
        }
        Ok(RefreshGrant {
            access_token: format!("access-{}", call + 1),
            refresh_token: Some(format!("refresh-{}", call + 1)),
        })
    }
}

type Outbound = mpsc::UnboundedSender<Option<String>>;

struct Connection {
    sent: Vec<ClientRequest>,
    outbound: Outbound,
}

#[derive(Default)]
struct BackendState {
    dials: Vec<String>,
    connections: Vec<Connection>,
    rejected_tokens: HashSet<String>,
    refuse: bool,
    silent: bool,
    gate: Option<Arc<Notify>>,
    next_message_id: i64,
}

/// In-process realtime backend. Confirms identity on connect, answers
/// `load-messages` with an empty snapshot and echoes chat messages back.
pub struct FakeBackend {
    identity: Identity,
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new(identity: Identity) -> Arc<Self> {
        Arc::new(Self {
            identity,
            state: Mutex::new(BackendState::default()),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn RealtimeConnector> {
        Arc::new(FakeConnector {
            backend: Arc::clone(self),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().expect("backend state")
    }

    pub fn reject_token(&self, token: &str) {
        self.lock().rejected_tokens.insert(token.to_string());
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// Accept connections but never confirm identity.
    pub fn withhold_identity(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// The next dial parks until the returned handle is notified.
    pub fn hold_next_connection(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().gate = Some(Arc::clone(&gate));
        gate
    }

    /// Access tokens presented on every dial, accepted or not.
    pub fn dials(&self) -> Vec<String> {
        self.lock().dials.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn sent(&self, connection: usize) -> Vec<ClientRequest> {
        self.lock()
            .connections
            .get(connection)
            .map(|c| c.sent.clone())
            .unwrap_or_default()
    }

    pub fn push_raw(&self, text: &str) {
        if let Some(connection) = self.lock().connections.last() {
            let _ = connection.outbound.send(Some(text.to_string()));
        }
    }

    pub fn push(&self, event: &ServerEvent) {
        self.push_raw(&serde_json::to_string(event).expect("encode event"));
    }

    /// Breaks the newest connection as a network failure would.
    pub fn drop_latest(&self) {
        if let Some(connection) = self.lock().connections.last() {
            let _ = connection.outbound.send(None);
        }
    }

    fn record(&self, index: usize, request: ClientRequest) {
        let mut state = self.lock();
        let reply = match &request {
            ClientRequest::LoadMessages => Some(ServerEvent::LoadMessages(Vec::new())),
            ClientRequest::PublicMessage { body } => {
                state.next_message_id += 1;
                Some(ServerEvent::PublicMessage(MessagePayload {
                    id: MessageId(state.next_message_id),
                    sender_id: self.identity.id,
                    sender_name: self.identity.name.clone(),
                    body: body.clone(),
                    created_at: Utc::now(),
                    receiver_id: None,
                }))
            }
            ClientRequest::PrivateMessage {
                target_user_id,
                body,
            } => {
                state.next_message_id += 1;
                Some(ServerEvent::PrivateMessage(MessagePayload {
                    id: MessageId(state.next_message_id),
                    sender_id: self.identity.id,
                    sender_name: self.identity.name.clone(),
                    body: body.clone(),
                    created_at: Utc::now(),
                    receiver_id: Some(*target_user_id),
                }))
            }
            _ => None,
        };
        if let Some(connection) = state.connections.get_mut(index) {
            connection.sent.push(request);
            if let Some(reply) = reply {
                let _ = connection
                    .outbound
                    .send(Some(serde_json::to_string(&reply).expect("encode reply")));
            }
        }
    }
}

struct FakeConnector {
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn connect(&self, access_token: &str) -> Result<Box<dyn RealtimeLink>, TransportError> {
        let (gate, silent) = {
            let mut state = self.backend.lock();
            state.dials.push(access_token.to_string());
            if state.refuse {
                return Err(TransportError::Io("connection refused".into()));
            }
            if state.rejected_tokens.contains(access_token) {
                return Err(TransportError::Unauthorized("token rejected".into()));
            }
            (state.gate.take(), state.silent)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let (outbound, inbound) = mpsc::unbounded_channel();
        if !silent {
            let me = ServerEvent::Me(self.backend.identity.clone());
            let _ = outbound.send(Some(serde_json::to_string(&me).expect("encode me")));
        }

        let mut state = self.backend.lock();
        state.connections.push(Connection {
            sent: Vec::new(),
            outbound,
        });
        Ok(Box::new(FakeLink {
            backend: Arc::clone(&self.backend),
            index: state.connections.len() - 1,
            inbound,
            closed: false,
        }))
    }
}

struct FakeLink {
    backend: Arc<FakeBackend>,
    index: usize,
    inbound: mpsc::UnboundedReceiver<Option<String>>,
    closed: bool,
}

#[async_trait]
impl RealtimeLink for FakeLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let request: ClientRequest = serde_json::from_str(&text).expect("client frame");
        self.backend.record(self.index, request);
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        if self.closed {
            return None;
        }
        match self.inbound.recv().await {
            Some(Some(text)) => Some(Ok(text)),
            Some(None) => {
                self.closed = true;
                Some(Err(TransportError::Io("connection reset".into())))
            }
            None => None,
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
