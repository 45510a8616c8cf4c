use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use reqwest::Client;
use shared::{domain::UserId, protocol::ClientRequest};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod auth_api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod message_stream;
pub mod realtime;
pub mod refresh;
pub mod transport;

pub use auth_api::{AuthApi, AuthApiError, HttpAuthApi, RefreshGrant};
pub use config::{load_settings, ClientSettings};
pub use credentials::{Credential, CredentialStore, FilePersistence, MemoryPersistence};
pub use error::{ProtocolError, RefreshError, SessionError, TransportError};
pub use gateway::{ApiRequest, RequestGateway};
pub use message_stream::{ChatState, Conversation, Message, Notice, PresenceEntry, StreamEvent};
pub use realtime::{ConnectionState, ReconnectPolicy, RealtimeSession, SessionEvent};
pub use refresh::{RefreshCoordinator, SessionSignal, TerminationReason};
pub use transport::{RealtimeConnector, RealtimeLink, WebSocketConnector};

const NOTICE_CAPACITY: usize = 256;

impl From<AuthApiError> for SessionError {
    fn from(value: AuthApiError) -> Self {
        match value {
            AuthApiError::Rejected { status, error } => SessionError::Http { status, error },
            AuthApiError::Transport(err) => SessionError::Transport(err),
        }
    }
}

/// Collaborators a [`ChatSession`] is assembled from.
pub struct SessionDependencies {
    pub http: Client,
    pub store: Arc<CredentialStore>,
    pub auth: Arc<dyn AuthApi>,
    pub connector: Arc<dyn RealtimeConnector>,
}

impl SessionDependencies {
    /// Production wiring: HTTP auth endpoints, a WebSocket transport and a
    /// file-backed credential store.
    pub fn from_settings(settings: &ClientSettings) -> anyhow::Result<Self> {
        let http = Client::new();
        let credentials_path = settings
            .credentials_path
            .clone()
            .or_else(FilePersistence::default_path)
            .context("no credentials path configured and no platform config dir")?;
        let realtime_url = settings.resolved_realtime_url()?;
        Ok(Self {
            auth: Arc::new(HttpAuthApi::new(http.clone(), settings.api_url.clone())),
            connector: Arc::new(WebSocketConnector::new(realtime_url)),
            store: Arc::new(CredentialStore::new(Arc::new(FilePersistence::new(
                credentials_path,
            )))),
            http,
        })
    }
}

/// One authenticated session: credential store, refresh coordinator, REST
/// gateway, realtime connection and the folded chat view.
pub struct ChatSession {
    coordinator: Arc<RefreshCoordinator>,
    gateway: RequestGateway,
    realtime: RealtimeSession,
    view: Arc<RwLock<ChatState>>,
    notices: broadcast::Sender<Notice>,
    view_task: JoinHandle<()>,
}

impl ChatSession {
    /// Exchanges `email`/`password` for a credential pair and connects.
    pub async fn login(
        settings: &ClientSettings,
        deps: SessionDependencies,
        email: &str,
        password: &str,
    ) -> Result<Self, SessionError> {
        let credential = deps.auth.login(email, password).await?;
        if let Err(err) = deps.store.set(credential) {
            warn!(error = %err, "session: credential not persisted");
        }
        info!("session: logged in");
        Self::start(settings, deps)
    }

    /// Resumes from a persisted credential pair without a login exchange.
    pub fn resume(settings: &ClientSettings, deps: SessionDependencies) -> Result<Self, SessionError> {
        if deps.store.load()?.is_none() {
            return Err(SessionError::NotAuthenticated);
        }
        info!("session: resumed persisted credential");
        Self::start(settings, deps)
    }

    fn start(settings: &ClientSettings, deps: SessionDependencies) -> Result<Self, SessionError> {
        let coordinator = RefreshCoordinator::new(deps.store, deps.auth, settings.refresh_timeout);
        let gateway = RequestGateway::new(deps.http, settings.api_url.clone(), Arc::clone(&coordinator));
        let (realtime, feed) = RealtimeSession::with_feed(
            deps.connector,
            Arc::clone(&coordinator),
            settings.reconnect_policy(),
        );

        let view = Arc::new(RwLock::new(ChatState::default()));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let view_task = tokio::spawn(fold_view(feed, Arc::clone(&view), notices.clone()));

        realtime.connect()?;
        Ok(Self {
            coordinator,
            gateway,
            realtime,
            view,
            notices,
            view_task,
        })
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn realtime(&self) -> &RealtimeSession {
        &self.realtime
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn state(&self) -> ConnectionState {
        self.realtime.state()
    }

    /// Copy of the current chat view.
    pub fn snapshot(&self) -> ChatState {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn load_public_history(&self) -> Result<(), SessionError> {
        self.realtime.send(ClientRequest::LoadMessages)
    }

    pub fn load_private_history(&self, user_id: UserId) -> Result<(), SessionError> {
        self.realtime.send(ClientRequest::LoadPrivateMessages {
            target_user_id: user_id,
        })
    }

    pub fn send_public(&self, body: impl Into<String>) -> Result<(), SessionError> {
        self.realtime
            .send(ClientRequest::PublicMessage { body: body.into() })
    }

    pub fn send_private(&self, user_id: UserId, body: impl Into<String>) -> Result<(), SessionError> {
        self.realtime.send(ClientRequest::PrivateMessage {
            target_user_id: user_id,
            body: body.into(),
        })
    }

    pub fn typing(&self, target: Option<UserId>) -> Result<(), SessionError> {
        self.realtime.send(ClientRequest::Typing {
            target_user_id: target,
        })
    }

    /// Rejects parked REST callers, clears the credential and closes the
    /// realtime connection.
    pub async fn logout(&self) {
        self.coordinator.terminate(TerminationReason::Logout);
        self.realtime.close();
        let _ = self
            .realtime
            .wait_for_state(ConnectionState::Closed)
            .await;
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.view_task.abort();
    }
}

async fn fold_view(
    mut feed: mpsc::UnboundedReceiver<SessionEvent>,
    view: Arc<RwLock<ChatState>>,
    notices: broadcast::Sender<Notice>,
) {
    while let Some(event) = feed.recv().await {
        match event {
            SessionEvent::Inbound(event) => {
                let name = event.name();
                let outcome = view
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .ingest(event);
                match outcome {
                    Ok(Some(notice)) => {
                        let _ = notices.send(notice);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(event = name, error = %err, "session: inbound event dropped"),
                }
            }
            SessionEvent::StateChanged(ConnectionState::Closed) => {
                *view.write().unwrap_or_else(PoisonError::into_inner) = ChatState::default();
                debug!("session: view discarded");
                break;
            }
            SessionEvent::RetriesExhausted { attempts } => {
                warn!(attempts, "session: realtime disconnected, reconnect manually");
            }
            SessionEvent::StateChanged(_) | SessionEvent::ProtocolError(_) => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod refresh_tests;

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod gateway_tests;

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod realtime_tests;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
