//! Identity/session controller
//!
//! Tracks which identity is active, reacts to sign-in and sign-out signals
//! from the auth provider and publishes every transition on a broadcast
//! channel. A sign-in is bounded by the configured auth timeout. On timeout
//! or a failed profile write a local session stays local; any other session
//! falls back to the guest identity.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::guest::generate_guest_id;
use crate::migration::MigrationResult;
use crate::models::{Identity, UserProfile, now};
use crate::sync::{AppInit, AuthOutcome, LogoutOutcome, SyncService};

const EVENT_CAPACITY: usize = 64;

/// Identity reported by the auth provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl AuthenticatedUser {
    fn profile(&self) -> UserProfile {
        let timestamp = now();
        UserProfile {
            id: self.uid.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            photo_url: self.photo_url.clone(),
            is_guest: false,
            created_at: timestamp.clone(),
            last_login_at: timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Unresolved,
    Guest {
        id: String,
    },
    Local {
        id: String,
        original_remote_id: Option<String>,
    },
    Authenticated {
        user: AuthenticatedUser,
    },
    /// Signed out; the user still has to choose what happens to the data
    AwaitingDisposition {
        user: AuthenticatedUser,
    },
}

impl SessionState {
    fn from_identity(identity: Identity) -> Self {
        match identity {
            Identity::Guest { id } => SessionState::Guest { id },
            Identity::Local {
                id,
                original_remote_id,
            } => SessionState::Local {
                id,
                original_remote_id,
            },
            Identity::Remote { id } => SessionState::Authenticated {
                user: AuthenticatedUser {
                    uid: id,
                    email: None,
                    display_name: None,
                    photo_url: None,
                },
            },
        }
    }

    /// Identity whose data is active in this state
    pub fn identity(&self) -> Option<Identity> {
        match self {
            SessionState::Unresolved => None,
            SessionState::Guest { id } => Some(Identity::guest(id.clone())),
            SessionState::Local {
                id,
                original_remote_id,
            } => Some(Identity::Local {
                id: id.clone(),
                original_remote_id: original_remote_id.clone(),
            }),
            SessionState::Authenticated { user } | SessionState::AwaitingDisposition { user } => {
                Some(Identity::remote(user.uid.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged(SessionState),
    Migrated(MigrationResult),
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

pub struct SessionController {
    sync: Arc<SyncService>,
    auth_timeout: Duration,
    state: RwLock<SessionState>,
    loading: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(sync: Arc<SyncService>, config: &SessionConfig) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            sync,
            auth_timeout: config.auth_timeout(),
            state: RwLock::new(SessionState::Unresolved),
            loading: AtomicBool::new(false),
            events,
            watcher: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or(SessionState::Unresolved)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state().identity()
    }

    pub fn loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Profile of the active user. Never carries provider credentials.
    pub fn user(&self) -> Option<UserProfile> {
        match self.state() {
            SessionState::Unresolved => None,
            SessionState::Guest { id } => Some(UserProfile::guest(&id)),
            SessionState::Local { id, .. } => {
                let mut profile = UserProfile::guest(&id);
                profile.is_guest = false;
                profile.display_name = Some("Local user".to_string());
                Some(profile)
            }
            SessionState::Authenticated { user } | SessionState::AwaitingDisposition { user } => {
                Some(user.profile())
            }
        }
    }

    /// Resolve the starting identity and start watching connectivity
    pub async fn init(self: &Arc<Self>) -> AppInit {
        self.loading.store(true, Ordering::SeqCst);
        let init = self.sync.initialize_app();
        self.set_state(SessionState::from_identity(init.user.clone()));
        self.loading.store(false, Ordering::SeqCst);

        if init.needs_migration {
            self.notify(
                NotificationLevel::Info,
                "Guest data will be moved to your account when you sign in",
            );
        }

        let rx = self.sync.connectivity().subscribe();
        let handle = tokio::spawn(watch_connectivity(Arc::downgrade(self), rx));
        if let Ok(mut watcher) = self.watcher.lock()
            && let Some(previous) = watcher.replace(handle)
        {
            previous.abort();
        }
        init
    }

    /// Stop the connectivity watcher
    pub fn dispose(&self) {
        if let Ok(mut watcher) = self.watcher.lock()
            && let Some(handle) = watcher.take()
        {
            handle.abort();
        }
    }

    pub async fn on_auth_state_changed(&self, user: Option<AuthenticatedUser>) {
        match user {
            Some(user) => self.signed_in(user).await,
            None => self.signed_out(),
        }
    }

    async fn signed_in(&self, user: AuthenticatedUser) {
        self.loading.store(true, Ordering::SeqCst);
        tracing::info!(uid = %user.uid, "Signed in");
        let previous = self.state();

        match tokio::time::timeout(self.auth_timeout, self.authenticate(&user)).await {
            Ok(Ok(outcome)) => {
                if let Some(result) = outcome.migration_result {
                    self.emit(SessionEvent::Migrated(result));
                }
                if let Some(error) = outcome.error {
                    self.notify(NotificationLevel::Warning, format!("Sync incomplete: {error}"));
                }
                self.set_state(SessionState::Authenticated { user });
            }
            Ok(Err(e)) => {
                tracing::warn!(uid = %user.uid, error = %e, "Sign-in failed");
                self.recover_from_failed_sign_in(previous);
                self.notify(NotificationLevel::Error, format!("Sign-in failed: {e}"));
            }
            Err(_) => {
                tracing::warn!(
                    uid = %user.uid,
                    timeout_secs = self.auth_timeout.as_secs_f64(),
                    "Sign-in timed out"
                );
                self.recover_from_failed_sign_in(previous);
                self.notify(NotificationLevel::Error, "Sign-in timed out");
            }
        }

        self.loading.store(false, Ordering::SeqCst);
    }

    async fn authenticate(&self, user: &AuthenticatedUser) -> Result<AuthOutcome> {
        self.sync.upsert_user_profile(&user.profile()).await?;

        if self.sync.has_resumable_state(&user.uid)? {
            return Ok(self.sync.resume_user_session(&user.uid).await);
        }
        Ok(self.sync.handle_user_authentication(&user.uid).await)
    }

    fn signed_out(&self) {
        match self.state() {
            SessionState::Authenticated { user } => {
                tracing::info!(uid = %user.uid, "Signed out, awaiting data disposition");
                self.set_state(SessionState::AwaitingDisposition { user });
            }
            SessionState::Guest { id } => {
                if let Err(e) = self.sync.guests().delete_guest_snapshot(&id) {
                    tracing::warn!(guest_id = %id, error = %e, "Failed to delete guest snapshot");
                }
                let next = self
                    .sync
                    .guests()
                    .create_new_guest_session()
                    .unwrap_or_else(|e| {
                        tracing::error!(error = %e, "Guest session could not be persisted");
                        generate_guest_id()
                    });
                self.set_state(SessionState::Guest { id: next });
            }
            SessionState::Local { id, .. } => {
                if let Err(e) = self.sync.leave_local_identity(None) {
                    tracing::warn!(local_id = %id, error = %e, "Failed to clear local identity");
                }
                self.fall_back_to_guest();
            }
            SessionState::Unresolved | SessionState::AwaitingDisposition { .. } => {}
        }
    }

    /// Finish a sign-out with the user's choice for their data
    pub async fn complete_sign_out(&self, option: &str) -> LogoutOutcome {
        let SessionState::AwaitingDisposition { user } = self.state() else {
            let error = Error::Validation("no sign-out is awaiting a choice".into());
            return LogoutOutcome {
                error: Some(error.to_string()),
                ..LogoutOutcome::default()
            };
        };

        self.loading.store(true, Ordering::SeqCst);
        let outcome = self
            .sync
            .handle_user_logout(&Identity::remote(user.uid.clone()), option)
            .await;

        match (&outcome.identity, &outcome.error) {
            (Some(next), _) if outcome.success => {
                self.set_state(SessionState::from_identity(next.clone()));
            }
            (_, Some(error)) => self.notify(NotificationLevel::Error, error.clone()),
            _ => {}
        }

        self.loading.store(false, Ordering::SeqCst);
        outcome
    }

    /// Local and signed-in sessions survive a failed sign-in; the rest become guest
    fn recover_from_failed_sign_in(&self, previous: SessionState) {
        match previous {
            SessionState::Unresolved | SessionState::Guest { .. } => self.fall_back_to_guest(),
            kept => {
                tracing::info!(state = ?kept, "Keeping previous session after failed sign-in");
                self.set_state(kept);
            }
        }
    }

    fn fall_back_to_guest(&self) {
        let id = self
            .sync
            .guests()
            .get_or_create_guest_id()
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Guest session could not be persisted");
                generate_guest_id()
            });
        self.set_state(SessionState::Guest { id });
    }

    fn authenticated_uid(&self) -> Option<String> {
        match self.state() {
            SessionState::Authenticated { user } => Some(user.uid),
            _ => None,
        }
    }

    fn set_state(&self, next: SessionState) {
        match self.state.write() {
            Ok(mut state) => *state = next.clone(),
            Err(_) => {
                tracing::error!("Session state lock poisoned");
                return;
            }
        }
        self.emit(SessionEvent::StateChanged(next));
    }

    fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Notification {
            level,
            message: message.into(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Drain the sync queue each time connectivity comes back while signed in
async fn watch_connectivity(session: Weak<SessionController>, mut rx: watch::Receiver<bool>) {
    while rx.changed().await.is_ok() {
        if !*rx.borrow_and_update() {
            continue;
        }
        let Some(session) = session.upgrade() else {
            break;
        };
        let Some(uid) = session.authenticated_uid() else {
            continue;
        };

        match session.sync.handle_reconnect(&uid).await {
            Ok(report) if report.replayed > 0 => session.notify(
                NotificationLevel::Info,
                format!("Synced {} offline change(s)", report.replayed),
            ),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(uid = %uid, error = %e, "Queue drain after reconnect failed");
            }
        }
    }
}
