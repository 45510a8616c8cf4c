use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::{
    auth_api::{AuthApi, AuthApiError},
    credentials::{Credential, CredentialStore},
    error::RefreshError,
};

const SIGNAL_CAPACITY: usize = 64;

/// Why the authenticated session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Logout,
    RefreshFailed(RefreshError),
}

/// Session-wide notifications published by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Published after the in-memory store holds the new credential. The
    /// on-disk copy may lag behind: a persistence failure is logged and the
    /// rotation is published anyway, so a restart may have to log in again.
    CredentialRotated,
    SessionTerminated(TerminationReason),
}

/// A caller parked behind the in-flight refresh. Resolved exactly once.
type PendingCall = oneshot::Sender<Result<Credential, RefreshError>>;

type Outcome = oneshot::Receiver<Result<Credential, RefreshError>>;

enum Entry {
    Resolved(Result<Credential, RefreshError>),
    Queued(Outcome),
    Lead {
        epoch: u64,
        refresh_token: String,
        outcome: Outcome,
    },
}

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    pending: Vec<PendingCall>,
    /// Bumped whenever the session is torn down so a refresh that settles
    /// afterwards cannot write into a closed session.
    epoch: u64,
}

/// Serializes credential refreshes: however many callers discover an
/// expired credential at once, one exchange reaches the backend and every
/// caller observes its outcome.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    auth: Arc<dyn AuthApi>,
    refresh_timeout: Duration,
    state: Mutex<RefreshState>,
    signals: broadcast::Sender<SessionSignal>,
    this: Weak<RefreshCoordinator>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        auth: Arc<dyn AuthApi>,
        refresh_timeout: Duration,
    ) -> Arc<Self> {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            store,
            auth,
            refresh_timeout,
            state: Mutex::new(RefreshState::default()),
            signals,
            this: this.clone(),
        })
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock_state().in_flight
    }

    /// Callers waiting on the in-flight exchange, including the one that
    /// started it.
    pub fn pending_calls(&self) -> usize {
        self.lock_state().pending.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a credential newer than `failed`, refreshing if needed.
    ///
    /// A caller whose `failed` credential was already superseded gets the
    /// stored one back without any exchange. A caller arriving while an
    /// exchange is running waits for that exchange.
    ///
    /// The exchange runs on its own task, so dropping the returned future
    /// never leaves the coordinator stuck in flight.
    pub async fn ensure_fresh(&self, failed: &Credential) -> Result<Credential, RefreshError> {
        let outcome = match self.enter(failed) {
            Entry::Resolved(outcome) => return outcome,
            Entry::Queued(outcome) => outcome,
            Entry::Lead {
                epoch,
                refresh_token,
                outcome,
            } => {
                info!("refresh: starting credential refresh exchange");
                match self.this.upgrade() {
                    Some(coordinator) => {
                        tokio::spawn(async move {
                            let result = coordinator.exchange(&refresh_token).await;
                            coordinator.settle(epoch, result);
                        });
                    }
                    None => {
                        let result = self.exchange(&refresh_token).await;
                        self.settle(epoch, result);
                    }
                }
                outcome
            }
        };
        outcome.await.unwrap_or(Err(RefreshError::Cancelled))
    }

    fn enter(&self, failed: &Credential) -> Entry {
        let mut state = self.lock_state();
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.pending.push(tx);
            debug!(
                pending = state.pending.len(),
                "refresh: queued behind in-flight exchange"
            );
            return Entry::Queued(rx);
        }

        let Some(current) = self.store.get() else {
            return Entry::Resolved(Err(RefreshError::NoCredential));
        };
        if current.access_token != failed.access_token {
            debug!("refresh: presented credential already superseded, skipping exchange");
            return Entry::Resolved(Ok(current));
        }

        let (tx, rx) = oneshot::channel();
        state.pending.push(tx);
        state.in_flight = true;
        Entry::Lead {
            epoch: state.epoch,
            refresh_token: current.refresh_token.clone(),
            outcome: rx,
        }
    }

    async fn exchange(&self, refresh_token: &str) -> Result<Credential, RefreshError> {
        match tokio::time::timeout(self.refresh_timeout, self.auth.refresh(refresh_token)).await {
            Ok(Ok(grant)) => Ok(Credential::new(
                grant.access_token,
                grant
                    .refresh_token
                    .unwrap_or_else(|| refresh_token.to_string()),
            )),
            Ok(Err(AuthApiError::Rejected { status, .. })) => {
                Err(RefreshError::Rejected { status })
            }
            Ok(Err(AuthApiError::Transport(err))) => Err(RefreshError::Exchange(err.to_string())),
            Err(_) => Err(RefreshError::Timeout(self.refresh_timeout)),
        }
    }

    fn settle(&self, epoch: u64, outcome: Result<Credential, RefreshError>) {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            info!("refresh: session ended during exchange, discarding result");
            return;
        }

        state.in_flight = false;
        let pending = std::mem::take(&mut state.pending);
        match outcome {
            Ok(credential) => {
                if let Err(err) = self.store.set(credential.clone()) {
                    warn!(error = %err, "refresh: refreshed credential not persisted");
                }
                drop(state);
                info!(released = pending.len(), "refresh: credential rotated");
                for call in pending {
                    let _ = call.send(Ok(credential.clone()));
                }
                let _ = self.signals.send(SessionSignal::CredentialRotated);
            }
            Err(err) => {
                state.epoch += 1;
                self.store.clear();
                drop(state);
                warn!(error = %err, rejected = pending.len(), "refresh: exchange failed, terminating session");
                for call in pending {
                    let _ = call.send(Err(err.clone()));
                }
                let _ = self.signals.send(SessionSignal::SessionTerminated(
                    TerminationReason::RefreshFailed(err),
                ));
            }
        }
    }

    /// Ends the session: rejects every parked caller, clears the store and
    /// tells the realtime side to close. A refresh still in flight is left
    /// to finish but its result is discarded.
    pub fn terminate(&self, reason: TerminationReason) {
        let pending = {
            let mut state = self.lock_state();
            state.epoch += 1;
            state.in_flight = false;
            self.store.clear();
            std::mem::take(&mut state.pending)
        };
        info!(?reason, rejected = pending.len(), "refresh: session terminated");
        for call in pending {
            let _ = call.send(Err(RefreshError::Cancelled));
        }
        let _ = self
            .signals
            .send(SessionSignal::SessionTerminated(reason));
    }
}
