//! HRDS Desktop Library
//!
//! Core modules for the registry companion app.

pub mod auth;
pub mod commands;
pub mod logging;
pub mod records;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use auth::SessionManager;
use records::RecordRepository;
use storage::TokenStore;
use sync::{RegistryApi, RegistryClient};

/// Application state shared across commands
pub struct AppState {
    pub session: SessionManager,
    pub registry: RecordRepository,
    pub storage: Arc<TokenStore>,
}

impl AppState {
    /// Wire up production state against the given service base URL.
    pub fn new(base_url: &str) -> Self {
        let storage = Arc::new(TokenStore::new());
        let api: Arc<dyn RegistryApi> =
            Arc::new(RegistryClient::new(base_url, storage.clone()));
        Self::from_parts(storage, api)
    }

    /// Wire up state from explicit parts (embedders and tests).
    pub fn from_parts(storage: Arc<TokenStore>, api: Arc<dyn RegistryApi>) -> Self {
        Self {
            session: SessionManager::new(storage.clone(), api.clone()),
            registry: RecordRepository::new(api),
            storage,
        }
    }
}
