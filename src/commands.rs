//! Command Module
//!
//! The operation set exposed to the host frontend: thin wrappers over
//! session and repository, plus the cross-cutting rule that a rejected
//! credential during any data call forces a logout.

use tracing::{debug, warn};

use crate::auth::Redirect;
use crate::records::{PersonDraft, PersonRecord, RepositoryError};
use crate::sync::ApiError;
use crate::AppState;

/// Revalidate the persisted session at application start.
pub async fn restore_session(state: &AppState) -> Redirect {
    state.session.revalidate().await
}

/// Sign in with an allow-list username/password pair.
pub fn login(state: &AppState, username: &str, password: &str) -> bool {
    state.session.login_with_password(username, password)
}

/// Sign in with a Google identity token.
pub async fn login_with_google(state: &AppState, id_token: &str) -> bool {
    state.session.login_with_google(id_token).await
}

/// Log out and clear the persisted credential.
pub fn logout(state: &AppState) -> Redirect {
    state.session.logout()
}

/// Refresh the registry snapshot and return the current collection.
pub async fn load_people(state: &AppState) -> Result<Vec<PersonRecord>, RepositoryError> {
    match state.registry.load_snapshot().await {
        Ok(count) => {
            debug!("Snapshot refreshed with {} records", count);
            Ok(state.registry.records())
        }
        Err(e) => {
            force_logout_on_unauthorized(state, &e);
            Err(e)
        }
    }
}

/// Add a person to the registry.
pub async fn add_person(
    state: &AppState,
    draft: PersonDraft,
) -> Result<PersonRecord, RepositoryError> {
    state.registry.add(draft).await.map_err(|e| {
        force_logout_on_unauthorized(state, &e);
        e
    })
}

/// Update a person in the registry.
pub async fn update_person(
    state: &AppState,
    id: &str,
    draft: PersonDraft,
) -> Result<PersonRecord, RepositoryError> {
    state.registry.update(id, draft).await.map_err(|e| {
        force_logout_on_unauthorized(state, &e);
        e
    })
}

/// Delete a person from the registry.
pub async fn delete_person(state: &AppState, id: &str) -> Result<(), RepositoryError> {
    state.registry.remove(id).await.map_err(|e| {
        force_logout_on_unauthorized(state, &e);
        e
    })
}

/// A rejected credential ends the session, whichever call surfaced it.
fn force_logout_on_unauthorized(state: &AppState, error: &RepositoryError) {
    if let RepositoryError::Api(ApiError::Unauthorized(_)) = error {
        warn!("Credential rejected during a data call, forcing logout");
        state.session.logout();
    }
}
