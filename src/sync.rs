//! API Sync Module
//!
//! Handles HTTP communication with the HRDS registry service.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::records::PersonDraft;
use crate::storage::TokenStore;

/// Remote operations the registry service exposes.
///
/// `RegistryClient` is the production implementation; tests substitute
/// an in-memory fake so session and repository logic can be exercised
/// without a server.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Verify a session credential and return the identity behind it.
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, ApiError>;

    /// Exchange a Google identity token for a session credential.
    async fn exchange_google_token(&self, id_token: &str) -> Result<GoogleExchange, ApiError>;

    /// Fetch the full registry snapshot.
    async fn list_all(&self) -> Result<Vec<RecordRow>, ApiError>;

    /// Store a new record; the response carries the server-assigned id.
    async fn create(&self, draft: &PersonDraft) -> Result<RecordRow, ApiError>;

    /// Replace an existing record.
    async fn update(&self, id: &str, draft: &PersonDraft) -> Result<RecordRow, ApiError>;

    /// Delete a record.
    async fn delete(&self, id: &str) -> Result<(), ApiError>;
}

/// HTTP client for the HRDS registry backend.
///
/// Stateless beyond the connection pool: the bearer credential is read
/// from the [`TokenStore`] on every data call, and no retries are
/// performed here. Retry policy belongs to the caller.
pub struct RegistryClient {
    base_url: String,
    client: reqwest::Client,
    store: Arc<TokenStore>,
}

impl RegistryClient {
    /// Create a new API client.
    pub fn new(base_url: &str, store: Arc<TokenStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            store,
        }
    }

    /// Read the stored credential, or fail without touching the network.
    fn bearer(&self) -> Result<String, ApiError> {
        self.store
            .get()
            .ok_or_else(|| ApiError::Unauthorized("no stored credential".into()))
    }

    /// Turn a non-success data response into a typed failure.
    ///
    /// A 401/403 means the credential itself was rejected, so the
    /// stored copy is dropped before the error propagates.
    async fn data_failure(&self, response: reqwest::Response) -> ApiError {
        let status = response.status();
        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| format!("Status: {}", status));

        let error = classify_status(status, message);
        if matches!(error, ApiError::Unauthorized(_)) {
            warn!("Credential rejected by server, clearing stored token");
            if let Err(e) = self.store.clear() {
                warn!("Failed to clear rejected credential: {}", e);
            }
        }
        error
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, ApiError> {
        let url = format!("{}/authenticate", self.base_url);

        debug!("Verifying session credential at: {}", url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .json::<ErrorResponse>()
                .await
                .map(|e| e.error)
                .unwrap_or_else(|_| format!("Status: {}", status));
            return Err(classify_status(status, message));
        }

        let data = response
            .json::<AuthenticateResponse>()
            .await
            .map_err(|e| ApiError::Unavailable(format!("malformed user payload: {}", e)))?;

        info!("Session credential verified for {}", data.user.email);
        Ok(data.user)
    }

    async fn exchange_google_token(&self, id_token: &str) -> Result<GoogleExchange, ApiError> {
        let url = format!("{}/auth/google", self.base_url);

        debug!("Exchanging Google identity token at: {}", url);

        let response = self
            .client
            .post(&url)
            .json(&GoogleExchangeRequest { token: id_token })
            .send()
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .json::<ErrorResponse>()
                .await
                .map(|e| e.error)
                .unwrap_or_else(|_| format!("Status: {}", status));
            // The rejected token is Google's, not our stored credential.
            return Err(classify_status(status, message));
        }

        let data = response
            .json::<GoogleExchange>()
            .await
            .map_err(|e| ApiError::Unavailable(format!("malformed exchange payload: {}", e)))?;

        info!("Google sign-in exchanged for a session credential");
        Ok(data)
    }

    async fn list_all(&self) -> Result<Vec<RecordRow>, ApiError> {
        let token = self.bearer()?;
        let url = format!("{}/data", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.data_failure(response).await);
        }

        response
            .json::<Vec<RecordRow>>()
            .await
            .map_err(|e| ApiError::Unavailable(format!("malformed row data: {}", e)))
    }

    async fn create(&self, draft: &PersonDraft) -> Result<RecordRow, ApiError> {
        let token = self.bearer()?;
        let url = format!("{}/data/entry", self.base_url);

        info!("Submitting new registry entry for {}", draft.full_name);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .json(draft)
            .send()
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.data_failure(response).await);
        }

        response
            .json::<RecordRow>()
            .await
            .map_err(|e| ApiError::Unavailable(format!("malformed row data: {}", e)))
    }

    async fn update(&self, id: &str, draft: &PersonDraft) -> Result<RecordRow, ApiError> {
        let token = self.bearer()?;
        let url = format!("{}/dataupdate/{}", self.base_url, id);

        let response = self
            .client
            .put(&url)
            .header("Authorization", format!("Bearer {}", token))
            .json(draft)
            .send()
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.data_failure(response).await);
        }

        response
            .json::<RecordRow>()
            .await
            .map_err(|e| ApiError::Unavailable(format!("malformed row data: {}", e)))
    }

    async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let token = self.bearer()?;
        // Deletion is modeled server-side as an update-style call.
        let url = format!("{}/datadelete/{}", self.base_url, id);

        let response = self
            .client
            .put(&url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.data_failure(response).await);
        }

        info!("Registry entry {} deleted", id);
        Ok(())
    }
}

fn classify_status(status: reqwest::StatusCode, message: String) -> ApiError {
    match status.as_u16() {
        401 | 403 => ApiError::Unauthorized(message),
        404 => ApiError::NotFound(message),
        400 | 409 | 422 => ApiError::ValidationRejected(message),
        _ => ApiError::Unavailable(message),
    }
}

// Request/Response types

#[derive(Serialize)]
struct GoogleExchangeRequest<'a> {
    token: &'a str,
}

/// The identity payload returned by the authentication endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticatedUser {
    pub name: String,
    pub email: String,
    pub picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthenticateResponse {
    user: AuthenticatedUser,
}

/// A successful `/auth/google` exchange: session credential plus identity.
#[derive(Debug, Deserialize)]
pub struct GoogleExchange {
    pub token: String,
    pub user: AuthenticatedUser,
}

/// One raw registry row as the server sends it.
///
/// Everything except the id is optional; the repository fills gaps
/// with documented defaults during normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRow {
    pub id: String,
    pub full_name: Option<String>,
    pub population_id: Option<String>,
    pub family_id: Option<String>,
    pub gender: Option<String>,
    pub date_of_birth: Option<String>,
    pub place_of_birth: Option<String>,
    pub religion: Option<String>,
    pub blood_type: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

/// API errors, one variant per failure class the core distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected by server: {0}")]
    ValidationRejected(String),

    #[error("Not found: {0}")]
    NotFound(String),
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_status_codes_to_taxonomy() {
        use reqwest::StatusCode;

        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "x".into()),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "x".into()),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "x".into()),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "x".into()),
            ApiError::ValidationRejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "x".into()),
            ApiError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn data_calls_fail_fast_without_a_credential() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = std::sync::Arc::new(crate::storage::TokenStore::at(dir.path()));
        // Port 9 is discard; nothing should ever be sent anyway.
        let client = RegistryClient::new("http://127.0.0.1:9", store);

        let result = client.list_all().await;

        assert!(matches!(result, Err(ApiError::Unauthorized(_))));
    }

    #[test]
    fn record_row_deserializes_camel_case_with_gaps() {
        let row: RecordRow = serde_json::from_str(
            r#"{"id":"7","fullName":"John Doe","populationId":"1234567890123456"}"#,
        )
        .unwrap();

        assert_eq!(row.id, "7");
        assert_eq!(row.full_name.as_deref(), Some("John Doe"));
        assert!(row.gender.is_none());
        assert!(row.blood_type.is_none());
    }
}
