//! Authentication Module
//!
//! Owns the session state machine and the login/revalidation flows.
//! Observers subscribe to [`Session`] snapshots; the host shell acts
//! on the returned [`Redirect`] signals.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::storage::TokenStore;
use crate::sync::{AuthenticatedUser, RegistryApi};

/// Navigation signal for the host shell after an auth transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    Dashboard,
    Login,
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Anonymous,
    Authenticating,
    Authenticated,
    Failed,
}

/// Access level of an allow-list account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// The signed-in user as shown in the application header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub name: String,
    /// Stable external subject: the username or email the account is
    /// known by.
    pub subject: String,
    pub picture: Option<String>,
    /// Present only for allow-list password sessions.
    pub role: Option<Role>,
}

impl From<AuthenticatedUser> for Identity {
    fn from(user: AuthenticatedUser) -> Self {
        Self {
            name: user.name,
            subject: user.email,
            picture: user.picture,
            role: None,
        }
    }
}

/// The published authentication state.
///
/// `identity` is populated exactly when `status` is `Authenticated`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub status: SessionStatus,
    pub identity: Option<Identity>,
    pub status_message: Option<String>,
}

impl Session {
    fn anonymous(status_message: Option<String>) -> Self {
        Self {
            status: SessionStatus::Anonymous,
            identity: None,
            status_message,
        }
    }

    fn authenticating() -> Self {
        Self {
            status: SessionStatus::Authenticating,
            identity: None,
            status_message: None,
        }
    }

    fn authenticated(identity: Identity, status_message: Option<String>) -> Self {
        Self {
            status: SessionStatus::Authenticated,
            identity: Some(identity),
            status_message,
        }
    }

    fn failed(status_message: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Failed,
            identity: None,
            status_message: Some(status_message.into()),
        }
    }

    /// Check if this session is signed in.
    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }
}

struct DemoAccount {
    username: &'static str,
    password: &'static str,
    full_name: &'static str,
    role: Role,
}

// Fixed demo accounts; a real deployment would check credentials
// against a backend instead.
const DEMO_ACCOUNTS: &[DemoAccount] = &[
    DemoAccount {
        username: "admin1",
        password: "admin123",
        full_name: "Administrator One",
        role: Role::Admin,
    },
    DemoAccount {
        username: "user1",
        password: "user123",
        full_name: "Data Entry User 1",
        role: Role::User,
    },
];

/// Manages authentication state.
///
/// Cheap to clone — the token store, API handle and published session
/// are all shared. The state machine is re-entrant for the life of the
/// process: any login attempt is valid from any state.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<TokenStore>,
    api: Arc<dyn RegistryApi>,
    session: Arc<watch::Sender<Session>>,
}

impl SessionManager {
    /// Create a new session manager in the `Anonymous` state.
    pub fn new(store: Arc<TokenStore>, api: Arc<dyn RegistryApi>) -> Self {
        let (session, _) = watch::channel(Session::anonymous(None));
        Self {
            store,
            api,
            session: Arc::new(session),
        }
    }

    /// Subscribe to session snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    /// The current session snapshot.
    pub fn current(&self) -> Session {
        self.session.borrow().clone()
    }

    fn publish(&self, session: Session) {
        self.session.send_replace(session);
    }

    /// Restore the persisted session at application start.
    ///
    /// Without a stored credential no network call is made. With one,
    /// the credential is verified remotely; rejection, a bad payload
    /// and a network fault all clear it and fail closed.
    pub async fn revalidate(&self) -> Redirect {
        let Some(token) = self.store.get() else {
            info!("No stored session");
            self.publish(Session::anonymous(None));
            return Redirect::Login;
        };

        self.publish(Session::authenticating());

        match self.api.authenticate(&token).await {
            Ok(user) => {
                info!("Session restored for {}", user.email);
                self.publish(Session::authenticated(user.into(), None));
                Redirect::Dashboard
            }
            Err(e) => {
                warn!("Stored session rejected: {}", e);
                if let Err(e) = self.store.clear() {
                    warn!("Failed to clear rejected credential: {}", e);
                }
                self.publish(Session::failed("Session expired. Please sign in again."));
                Redirect::Login
            }
        }
    }

    /// Sign in against the fixed demo allow-list.
    ///
    /// Password sessions are not persisted: the next start lands on
    /// the login surface again.
    pub fn login_with_password(&self, username: &str, password: &str) -> bool {
        self.publish(Session::authenticating());

        let account = DEMO_ACCOUNTS
            .iter()
            .find(|a| a.username == username && a.password == password);

        match account {
            Some(account) => {
                info!("Password login for {}", account.username);
                let identity = Identity {
                    name: account.full_name.to_string(),
                    subject: account.username.to_string(),
                    picture: None,
                    role: Some(account.role),
                };
                self.publish(Session::authenticated(identity, None));
                true
            }
            None => {
                warn!("Rejected password login for {}", username);
                self.publish(Session::failed("Invalid username or password"));
                false
            }
        }
    }

    /// Sign in by exchanging a Google identity token for a session
    /// credential, which is then persisted.
    ///
    /// On failure a previously stored credential is left untouched.
    pub async fn login_with_google(&self, id_token: &str) -> bool {
        self.publish(Session::authenticating());

        match self.api.exchange_google_token(id_token).await {
            Ok(exchange) => {
                if let Err(e) = self.store.set(&exchange.token) {
                    error!("Failed to persist session credential: {}", e);
                }
                info!("Google login for {}", exchange.user.email);
                self.publish(Session::authenticated(
                    exchange.user.into(),
                    Some("Login successful with Google".to_string()),
                ));
                true
            }
            Err(e) => {
                warn!("Google sign-in failed: {}", e);
                self.publish(Session::failed("Google login failed. Please try again."));
                false
            }
        }
    }

    /// Drop the credential and return to `Anonymous`.
    ///
    /// Safe to call from any state, including when already logged out.
    pub fn logout(&self) -> Redirect {
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear stored credential: {}", e);
        }
        self.publish(Session::anonymous(Some("You have been logged out.".to_string())));
        info!("Logged out");
        Redirect::Login
    }
}
