use std::{collections::VecDeque, sync::Arc, time::Duration};

use shared::protocol::{ClientRequest, ServerEvent};
use tokio::sync::{
    broadcast::{self, error::RecvError, error::TryRecvError},
    mpsc, watch,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};
use tracing::{debug, info, warn};

use crate::{
    error::{ProtocolError, SessionError, TransportError},
    refresh::{RefreshCoordinator, SessionSignal},
    transport::{RealtimeConnector, RealtimeLink},
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Reauthenticating,
    Closed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Inbound(ServerEvent),
    ProtocolError(ProtocolError),
    /// Automatic reconnects gave up; the session waits for `connect()`.
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
}

impl ReconnectPolicy {
    /// Exponential delay before retry number `attempt` (1-based), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 6,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    Connect,
    Send(ClientRequest),
    Close,
}

/// Handle to one logical realtime connection. The connection itself is
/// owned by a background driver task; the handle only issues commands and
/// observes state.
pub struct RealtimeSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl RealtimeSession {
    /// Spawns the driver in `Disconnected`. Nothing is dialled until
    /// [`RealtimeSession::connect`] is called.
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        coordinator: Arc<RefreshCoordinator>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::spawn(connector, coordinator, policy, None)
    }

    /// Like [`RealtimeSession::new`], plus a lossless copy of every event for
    /// a single consumer that must not miss any (the chat view). The feed
    /// ends once the session is closed.
    pub fn with_feed(
        connector: Arc<dyn RealtimeConnector>,
        coordinator: Arc<RefreshCoordinator>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (feed, feed_rx) = mpsc::unbounded_channel();
        (Self::spawn(connector, coordinator, policy, Some(feed)), feed_rx)
    }

    fn spawn(
        connector: Arc<dyn RealtimeConnector>,
        coordinator: Arc<RefreshCoordinator>,
        policy: ReconnectPolicy,
        feed: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let driver = SessionDriver {
            connector,
            signals: coordinator.subscribe(),
            coordinator,
            policy,
            commands: command_rx,
            events: events.clone(),
            feed,
            state: state_tx,
            outbox: VecDeque::new(),
            started: false,
        };
        tokio::spawn(driver.run());
        Self {
            commands,
            events,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Typed event stream for observers; lagging subscribers skip what they
    /// missed.
    pub fn event_stream(&self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "realtime: event subscriber lagged");
                None
            }
        })
    }

    /// Dials the backend, or retries now after automatic retries gave up.
    pub fn connect(&self) -> Result<(), SessionError> {
        if self.state() == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        self.command(SessionCommand::Connect)
    }

    /// Queues an outbound frame. Frames issued while the connection is not
    /// authenticated are buffered and flushed after the next handshake.
    pub fn send(&self, request: ClientRequest) -> Result<(), SessionError> {
        if self.state() == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        self.command(SessionCommand::Send(request))
    }

    /// Tears the connection down for good. Buffered frames are discarded.
    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target || *current == ConnectionState::Closed)
            .await
            .map_err(|_| SessionError::Closed)?;
        if target != ConnectionState::Closed && *state.borrow() == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        let _ = self.commands.send(SessionCommand::Close);
    }
}

struct Handshake {
    link: Box<dyn RealtimeLink>,
    /// Frames received up to and including the identity confirmation.
    early: Vec<Result<ServerEvent, ProtocolError>>,
}

enum Step {
    Idle,
    Connect {
        phase: ConnectionState,
        attempt: u32,
        refreshed: bool,
    },
    Backoff {
        attempt: u32,
    },
    Live {
        link: Box<dyn RealtimeLink>,
        access_token: String,
    },
    Close,
}

enum SignalAction {
    Rotate,
    Terminate,
}

struct SessionDriver {
    connector: Arc<dyn RealtimeConnector>,
    coordinator: Arc<RefreshCoordinator>,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    signals: broadcast::Receiver<SessionSignal>,
    events: broadcast::Sender<SessionEvent>,
    feed: Option<mpsc::UnboundedSender<SessionEvent>>,
    state: watch::Sender<ConnectionState>,
    outbox: VecDeque<ClientRequest>,
    started: bool,
}

impl SessionDriver {
    async fn run(mut self) {
        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => self.idle().await,
                Step::Connect {
                    phase,
                    attempt,
                    refreshed,
                } => self.connect(phase, attempt, refreshed).await,
                Step::Backoff { attempt } => self.backoff(attempt).await,
                Step::Live { link, access_token } => self.live(link, access_token).await,
                Step::Close => break,
            };
        }

        if !self.outbox.is_empty() {
            debug!(discarded = self.outbox.len(), "realtime: dropping buffered frames");
        }
        self.outbox.clear();
        self.set_state(ConnectionState::Closed);
        info!("realtime: session closed");
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "realtime: state changed");
            self.emit(SessionEvent::StateChanged(next));
        }
    }

    fn classify(signal: Result<SessionSignal, RecvError>) -> SignalAction {
        match signal {
            Ok(SessionSignal::CredentialRotated) | Err(RecvError::Lagged(_)) => SignalAction::Rotate,
            Ok(SessionSignal::SessionTerminated(_)) | Err(RecvError::Closed) => {
                SignalAction::Terminate
            }
        }
    }

    /// Swallows rotations already queued; they are all satisfied by
    /// connecting with the latest stored credential. Returns `true` if a
    /// termination was queued among them.
    fn drain_rotations(&mut self) -> bool {
        loop {
            match self.signals.try_recv() {
                Ok(SessionSignal::CredentialRotated) | Err(TryRecvError::Lagged(_)) => continue,
                Ok(SessionSignal::SessionTerminated(_)) => return true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return false,
            }
        }
    }

    async fn idle(&mut self) -> Step {
        tokio::select! {
            command = self.commands.recv() => match command {
                None | Some(SessionCommand::Close) => Step::Close,
                Some(SessionCommand::Connect) => {
                    self.started = true;
                    Step::Connect { phase: ConnectionState::Connecting, attempt: 0, refreshed: false }
                }
                Some(SessionCommand::Send(request)) => {
                    self.outbox.push_back(request);
                    Step::Idle
                }
            },
            signal = self.signals.recv() => match Self::classify(signal) {
                SignalAction::Terminate => Step::Close,
                SignalAction::Rotate if self.started => {
                    Step::Connect { phase: ConnectionState::Connecting, attempt: 0, refreshed: false }
                }
                SignalAction::Rotate => Step::Idle,
            },
        }
    }

    async fn connect(&mut self, phase: ConnectionState, attempt: u32, refreshed: bool) -> Step {
        self.set_state(phase);
        let Some(credential) = self.coordinator.store().get() else {
            warn!("realtime: no credential to authenticate with");
            return Step::Close;
        };

        let handshake = open_and_identify(
            Arc::clone(&self.connector),
            credential.access_token.clone(),
            self.policy.connect_timeout,
        );
        tokio::pin!(handshake);

        let outcome = loop {
            tokio::select! {
                outcome = &mut handshake => break outcome,
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Close) => return Step::Close,
                    Some(SessionCommand::Send(request)) => self.outbox.push_back(request),
                    Some(SessionCommand::Connect) => {}
                },
                signal = self.signals.recv() => {
                    // Rotations are reconciled once the handshake settles.
                    if let SignalAction::Terminate = Self::classify(signal) {
                        return Step::Close;
                    }
                }
            }
        };

        match outcome {
            Ok(Handshake { mut link, early }) => {
                if self.drain_rotations() {
                    link.close().await;
                    return Step::Close;
                }
                let current = self.coordinator.store().access_token();
                if current.as_deref() != Some(credential.access_token.as_str()) {
                    info!("realtime: credential rotated during handshake, reconnecting");
                    link.close().await;
                    if current.is_none() {
                        return Step::Close;
                    }
                    return Step::Connect {
                        phase,
                        attempt,
                        refreshed,
                    };
                }
                self.authenticated(link, credential.access_token.clone(), early)
                    .await
            }
            Err(TransportError::Unauthorized(reason)) if !refreshed => {
                warn!(%reason, "realtime: handshake rejected credential, refreshing");
                match self.coordinator.ensure_fresh(&credential).await {
                    Ok(_) => {
                        self.drain_rotations();
                        Step::Connect {
                            phase,
                            attempt,
                            refreshed: true,
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "realtime: refresh after handshake rejection failed");
                        Step::Close
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, attempt, "realtime: connect failed");
                self.set_state(ConnectionState::Disconnected);
                Step::Backoff {
                    attempt: attempt + 1,
                }
            }
        }
    }

    async fn authenticated(
        &mut self,
        mut link: Box<dyn RealtimeLink>,
        access_token: String,
        early: Vec<Result<ServerEvent, ProtocolError>>,
    ) -> Step {
        self.set_state(ConnectionState::Authenticated);
        for frame in early {
            self.publish(frame);
        }

        if let Err(err) = transmit(link.as_mut(), &ClientRequest::LoadMessages).await {
            return self.dropped(link, err).await;
        }
        while let Some(request) = self.outbox.pop_front() {
            if let Err(err) = transmit(link.as_mut(), &request).await {
                self.outbox.push_front(request);
                return self.dropped(link, err).await;
            }
        }
        Step::Live { link, access_token }
    }

    async fn live(&mut self, mut link: Box<dyn RealtimeLink>, access_token: String) -> Step {
        loop {
            tokio::select! {
                frame = link.next_text() => match frame {
                    Some(Ok(text)) => self.publish(decode_frame(&text)),
                    Some(Err(err)) => return self.dropped(link, err).await,
                    None => return self.dropped(link, TransportError::Closed).await,
                },
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Close) => {
                        link.close().await;
                        return Step::Close;
                    }
                    Some(SessionCommand::Send(request)) => {
                        if let Err(err) = transmit(link.as_mut(), &request).await {
                            self.outbox.push_front(request);
                            return self.dropped(link, err).await;
                        }
                    }
                    Some(SessionCommand::Connect) => {}
                },
                signal = self.signals.recv() => match Self::classify(signal) {
                    SignalAction::Terminate => {
                        link.close().await;
                        return Step::Close;
                    }
                    SignalAction::Rotate => {
                        if self.drain_rotations() {
                            link.close().await;
                            return Step::Close;
                        }
                        if self.coordinator.store().access_token().as_deref() == Some(access_token.as_str()) {
                            continue;
                        }
                        info!("realtime: credential rotated, re-authenticating");
                        link.close().await;
                        return Step::Connect {
                            phase: ConnectionState::Reauthenticating,
                            attempt: 0,
                            refreshed: false,
                        };
                    }
                },
            }
        }
    }

    async fn dropped(&mut self, mut link: Box<dyn RealtimeLink>, err: TransportError) -> Step {
        warn!(error = %err, "realtime: connection lost");
        link.close().await;
        self.set_state(ConnectionState::Disconnected);
        Step::Backoff { attempt: 1 }
    }

    async fn backoff(&mut self, attempt: u32) -> Step {
        if attempt > self.policy.max_attempts {
            warn!(attempts = attempt - 1, "realtime: reconnect attempts exhausted");
            self.emit(SessionEvent::RetriesExhausted {
                attempts: attempt - 1,
            });
            return Step::Idle;
        }

        let delay = self.policy.delay_for(attempt);
        debug!(attempt, ?delay, "realtime: waiting before reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let reconnect = Step::Connect {
            phase: ConnectionState::Connecting,
            attempt,
            refreshed: false,
        };

        loop {
            tokio::select! {
                _ = &mut sleep => return reconnect,
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Close) => return Step::Close,
                    Some(SessionCommand::Send(request)) => self.outbox.push_back(request),
                    Some(SessionCommand::Connect) => return reconnect,
                },
                signal = self.signals.recv() => match Self::classify(signal) {
                    SignalAction::Terminate => return Step::Close,
                    SignalAction::Rotate => return reconnect,
                },
            }
        }
    }

    fn publish(&self, frame: Result<ServerEvent, ProtocolError>) {
        let event = match frame {
            Ok(event) => SessionEvent::Inbound(event),
            Err(err) => {
                warn!(error = %err, "realtime: dropping inbound frame");
                SessionEvent::ProtocolError(err)
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(feed) = &self.feed {
            let _ = feed.send(event.clone());
        }
        let _ = self.events.send(event);
    }
}

fn decode_frame(text: &str) -> Result<ServerEvent, ProtocolError> {
    serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
}

async fn transmit(link: &mut dyn RealtimeLink, request: &ClientRequest) -> Result<(), TransportError> {
    let text = serde_json::to_string(request).map_err(|err| TransportError::Io(err.to_string()))?;
    link.send_text(text).await
}

/// Opens a connection and waits for the backend's `me` confirmation.
async fn open_and_identify(
    connector: Arc<dyn RealtimeConnector>,
    access_token: String,
    connect_timeout: Duration,
) -> Result<Handshake, TransportError> {
    tokio::time::timeout(connect_timeout, identify(connector, access_token))
        .await
        .unwrap_or(Err(TransportError::Timeout(connect_timeout)))
}

async fn identify(
    connector: Arc<dyn RealtimeConnector>,
    access_token: String,
) -> Result<Handshake, TransportError> {
    let mut link = connector.connect(&access_token).await?;
    let mut early = Vec::new();
    loop {
        let text = match link.next_text().await {
            Some(Ok(text)) => text,
            Some(Err(err)) => return Err(err),
            None => return Err(TransportError::Closed),
        };
        match decode_frame(&text) {
            Ok(ServerEvent::ConnectError(error)) => {
                link.close().await;
                return Err(if error.is_unauthorized() {
                    TransportError::Unauthorized(error.message)
                } else {
                    TransportError::Io(error.message)
                });
            }
            Ok(event @ ServerEvent::Me(_)) => {
                early.push(Ok(event));
                return Ok(Handshake { link, early });
            }
            frame => early.push(frame),
        }
    }
}
