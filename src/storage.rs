//! Token Storage Module
//!
//! Durable persistence of the single session credential, encrypted
//! with Windows DPAPI where available.

use std::path::PathBuf;
use tracing::{debug, info, warn};

#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN,
};
#[cfg(windows)]
use windows::Win32::Security::Cryptography::CRYPT_INTEGER_BLOB;

/// The single key under which the session credential lives.
const CREDENTIAL_KEY: &str = "HRDS_ACCESS";

/// Persists the opaque session credential on disk.
///
/// Holds at most one credential at a time. The token content is never
/// inspected here. On Windows the bytes are wrapped with DPAPI; on
/// other platforms they are written as-is (development fallback).
pub struct TokenStore {
    storage_path: PathBuf,
}

impl TokenStore {
    /// Create a store rooted at the platform data directory.
    pub fn new() -> Self {
        let storage_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("HRDS");

        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            warn!("Failed to create storage directory: {}", e);
        }

        debug!("Token store initialized at: {:?}", storage_path);

        Self { storage_path }
    }

    /// Create a store rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let storage_path = dir.into();
        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            warn!("Failed to create storage directory: {}", e);
        }
        Self { storage_path }
    }

    fn credential_path(&self) -> PathBuf {
        self.storage_path.join(format!("{}.dat", CREDENTIAL_KEY))
    }

    /// Persist the credential, overwriting any prior value.
    pub fn set(&self, token: &str) -> Result<(), StorageError> {
        let protected = self.encrypt(token.as_bytes())?;

        std::fs::write(self.credential_path(), protected)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        info!("Session credential stored");
        Ok(())
    }

    /// Read the credential back, or `None` if absent.
    ///
    /// Unreadable or undecryptable state counts as absent: the caller
    /// ends up unauthenticated rather than holding a bad token.
    pub fn get(&self) -> Option<String> {
        let path = self.credential_path();
        if !path.exists() {
            return None;
        }

        let protected = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read stored credential: {}", e);
                return None;
            }
        };

        let bytes = match self.decrypt(&protected) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to decrypt stored credential: {}", e);
                return None;
            }
        };

        match String::from_utf8(bytes) {
            Ok(token) => Some(token),
            Err(_) => {
                warn!("Stored credential is not valid UTF-8, ignoring");
                None
            }
        }
    }

    /// Remove the credential. Removing an absent credential is not an error.
    pub fn clear(&self) -> Result<(), StorageError> {
        let path = self.credential_path();

        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| StorageError::Io(e.to_string()))?;
            info!("Session credential cleared");
        }

        Ok(())
    }

    /// Check whether a credential is currently stored.
    pub fn has_credential(&self) -> bool {
        self.credential_path().exists()
    }

    #[cfg(windows)]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptProtectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Encryption("DPAPI encryption failed".into()));
            }

            let encrypted = std::slice::from_raw_parts(
                output.pbData,
                output.cbData as usize,
            ).to_vec();

            // Free the memory allocated by CryptProtectData
            windows::Win32::Foundation::LocalFree(
                windows::Win32::Foundation::HLOCAL(output.pbData as *mut std::ffi::c_void)
            );

            Ok(encrypted)
        }
    }

    #[cfg(windows)]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptUnprotectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Decryption("DPAPI decryption failed".into()));
            }

            let decrypted = std::slice::from_raw_parts(
                output.pbData,
                output.cbData as usize,
            ).to_vec();

            // Free the memory allocated by CryptUnprotectData
            windows::Win32::Foundation::LocalFree(
                windows::Win32::Foundation::HLOCAL(output.pbData as *mut std::ffi::c_void)
            );

            Ok(decrypted)
        }
    }

    #[cfg(not(windows))]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        // Fallback for non-Windows (development only)
        Ok(data.to_vec())
    }

    #[cfg(not(windows))]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        // Fallback for non-Windows (development only)
        Ok(data.to_vec())
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}
