//! The durable credential and the accessors that read and write it.

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::{keys, LocalStorage};

/// Snapshot of the credential fields held in durable storage.
///
/// There is only ever one credential: every write overwrites the fields in
/// place.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// Bearer token, if one has been issued.
    pub token: Option<String>,
    /// Server-confirmed user id.
    pub user_id: Option<String>,
    /// Stable device identifier.
    pub device_id: Option<String>,
    /// Whether the durable login marker is `"true"`.
    pub logged_in: bool,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("logged_in", &self.logged_in)
            .finish()
    }
}

impl Credential {
    /// Returns `true` if every field needed to restore a session is present.
    #[must_use]
    pub fn is_restorable(&self) -> bool {
        self.logged_in && self.token.is_some() && self.user_id.is_some() && self.device_id.is_some()
    }

    /// Returns a copy safe to print, with the token masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            token: self.token.as_ref().map(|t| mask(t)),
            ..self.clone()
        }
    }
}

fn mask(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{visible}…")
}

/// Typed access to the credential fields of a [`LocalStorage`].
#[derive(Debug, Clone)]
pub struct CredentialStore {
    storage: LocalStorage,
}

impl CredentialStore {
    /// Wraps a storage handle.
    #[must_use]
    pub const fn new(storage: LocalStorage) -> Self {
        Self { storage }
    }

    /// The underlying storage handle.
    #[must_use]
    pub const fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    /// Reads the current credential.
    #[must_use]
    pub fn load(&self) -> Credential {
        Credential {
            token: self.token(),
            user_id: self.user_id(),
            device_id: self.device_id(),
            logged_in: self.storage.get_flag(keys::IS_LOGGED_IN),
        }
    }

    /// Stored bearer token, ignoring empty values.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        non_empty(self.storage.get(keys::TOKEN))
    }

    /// Stored user id, ignoring empty values.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        non_empty(self.storage.get(keys::USER_ID))
    }

    /// Stored device id, ignoring empty values.
    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        non_empty(self.storage.get(keys::DEVICE_ID))
    }

    /// Returns the stored device id, generating and persisting a new one if
    /// none exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the generated id fails.
    pub fn ensure_device_id(&self) -> Result<String> {
        if let Some(device_id) = self.device_id() {
            return Ok(device_id);
        }
        let device_id = Uuid::new_v4().to_string();
        self.storage.set(keys::DEVICE_ID, device_id.clone())?;
        info!(device_id = %device_id, "Generated new device id");
        Ok(device_id)
    }

    /// Persists a freshly issued token.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn store_token(&self, token: &str) -> Result<()> {
        self.storage.set(keys::TOKEN, token)
    }

    /// Persists the confirmed user id.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn store_user_id(&self, user_id: &str) -> Result<()> {
        self.storage.set(keys::USER_ID, user_id)
    }

    /// Sets the durable login marker.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn set_logged_in(&self, logged_in: bool) -> Result<()> {
        self.storage.set_flag(keys::IS_LOGGED_IN, logged_in)
    }

    /// Last navigation path recorded by the application.
    #[must_use]
    pub fn last_path(&self) -> Option<String> {
        non_empty(self.storage.get(keys::LAST_PATH))
    }

    /// Records the last navigation path.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn set_last_path(&self, path: &str) -> Result<()> {
        self.storage.set(keys::LAST_PATH, path)
    }

    /// Removes the session fields (`token`, `userId`, `isLoggedIn`,
    /// `lastPath`). The device id is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn clear(&self) -> Result<()> {
        for key in [keys::TOKEN, keys::USER_ID, keys::IS_LOGGED_IN, keys::LAST_PATH] {
            self.storage.remove(key)?;
        }
        debug!("Cleared stored credential");
        Ok(())
    }

    /// Marks the user logged out: `isLoggedIn` becomes `"false"` first, then
    /// `token`, `userId` and `lastPath` are removed.
    ///
    /// Running it again on an already signed-out store writes nothing, so
    /// other tabs see no further change.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn sign_out(&self) -> Result<()> {
        self.set_logged_in(false)?;
        for key in [keys::TOKEN, keys::USER_ID, keys::LAST_PATH] {
            self.storage.remove(key)?;
        }
        debug!("Signed out stored credential");
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_is_generated_once() {
        let store = CredentialStore::new(LocalStorage::in_memory());
        let first = store.ensure_device_id().unwrap();
        let second = store.ensure_device_id().unwrap();

        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_existing_device_id_is_kept() {
        let storage = LocalStorage::in_memory();
        storage.set(keys::DEVICE_ID, "D1").unwrap();

        let store = CredentialStore::new(storage);
        assert_eq!(store.ensure_device_id().unwrap(), "D1");
    }

    #[test]
    fn test_restorable_requires_every_field() {
        let storage = LocalStorage::in_memory();
        let store = CredentialStore::new(storage.clone());
        assert!(!store.load().is_restorable());

        storage.set(keys::TOKEN, "T1").unwrap();
        storage.set(keys::USER_ID, "U1").unwrap();
        storage.set(keys::DEVICE_ID, "D1").unwrap();
        assert!(!store.load().is_restorable(), "isLoggedIn missing");

        storage.set(keys::IS_LOGGED_IN, "true").unwrap();
        assert!(store.load().is_restorable());

        storage.set(keys::TOKEN, "").unwrap();
        assert!(!store.load().is_restorable(), "empty token");
    }

    #[test]
    fn test_clear_keeps_device_id() {
        let storage = LocalStorage::in_memory();
        for (key, value) in [
            (keys::TOKEN, "T1"),
            (keys::USER_ID, "U1"),
            (keys::IS_LOGGED_IN, "true"),
            (keys::DEVICE_ID, "D1"),
            (keys::LAST_PATH, "/classes"),
        ] {
            storage.set(key, value).unwrap();
        }

        let store = CredentialStore::new(storage.clone());
        store.clear().unwrap();

        let credential = store.load();
        assert_eq!(credential.token, None);
        assert_eq!(credential.user_id, None);
        assert!(!credential.logged_in);
        assert_eq!(credential.device_id.as_deref(), Some("D1"));
        assert_eq!(storage.get(keys::LAST_PATH), None);
    }

    #[tokio::test]
    async fn test_repeated_sign_out_is_silent() {
        let tab_a = LocalStorage::in_memory();
        let tab_b = tab_a.sibling();
        tab_a.set(keys::TOKEN, "T1").unwrap();
        tab_a.set(keys::IS_LOGGED_IN, "true").unwrap();
        let mut events_a = tab_a.subscribe();

        CredentialStore::new(tab_a.clone()).sign_out().unwrap();
        CredentialStore::new(tab_b.clone()).sign_out().unwrap();
        assert_eq!(tab_a.get(keys::IS_LOGGED_IN).as_deref(), Some("false"));
        assert_eq!(tab_a.get(keys::TOKEN), None);

        // A marker write from tab_b would show up before this one
        tab_b.set(keys::LAST_PATH, "/probe").unwrap();
        let next = events_a.next().await.unwrap();
        assert_eq!(next.key, keys::LAST_PATH);
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential {
            token: Some("secret-token".to_string()),
            ..Default::default()
        };
        let debug = format!("{credential:?}");
        assert!(!debug.contains("secret-token"));
        assert_eq!(credential.redacted().token.as_deref(), Some("secr…"));
    }
}
