//! In-memory secret store.
//!
//! Secrets are provided by clients over the protocol and live only in
//! process memory; the core never persists them. Credentialed
//! synchronizer work parks until a secret for its resource instance
//! becomes available.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

/// Process-wide map from resource instance id to secret.
///
/// Constructed once at startup and passed through the process context;
/// cloning shares the same underlying map.
#[derive(Clone, Default)]
pub struct SecretStore {
    secrets: Arc<Mutex<HashMap<String, String>>>,
    inserted: Arc<Notify>,
}

impl SecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the secret for a resource instance and wakes
    /// everyone parked on it.
    pub fn insert(&self, resource_id: impl Into<String>, secret: impl Into<String>) {
        let resource_id = resource_id.into();
        debug!(resource = %resource_id, "secret stored");
        self.secrets
            .lock()
            .expect("secret store lock")
            .insert(resource_id, secret.into());
        self.inserted.notify_waiters();
    }

    /// Returns the secret for a resource instance, if present.
    pub fn secret(&self, resource_id: &str) -> Option<String> {
        self.secrets
            .lock()
            .expect("secret store lock")
            .get(resource_id)
            .cloned()
    }

    /// Waits until a secret for the resource instance is available.
    pub async fn wait_for(&self, resource_id: &str) -> String {
        loop {
            // Arm the notification before checking, so an insert between
            // the check and the await cannot be missed.
            let notified = self.inserted.notified();
            if let Some(secret) = self.secret(resource_id) {
                return secret;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.secrets.lock().map(|m| m.len()).unwrap_or(0);
        // Secret values are never printed.
        f.debug_struct("SecretStore").field("entries", &count).finish()
    }
}
