//! Configuration types for the portal session core.
//!
//! This module provides the configuration structures controlling the API
//! location, the gateway and session timings, the navigation routes and the
//! endpoint paths used during session bootstrap.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "portal.json";

/// Default API base URL.
fn default_api_base_url() -> String {
    "http://localhost:5000/api".to_string()
}

/// Default per-request transport timeout in seconds.
const fn default_request_timeout() -> u32 {
    30
}

/// Default durable storage file.
fn default_storage_file() -> String {
    ".portal/storage.json".to_string()
}

/// Default time a gated request may wait for restoration.
const fn default_queue_timeout_ms() -> u64 {
    10_000
}

/// Default debounce window for the restoration trigger.
const fn default_restore_debounce_ms() -> u64 {
    4_000
}

/// Default pause between session establishment and navigation.
const fn default_settle_delay_ms() -> u64 {
    500
}

/// Default cooldown before another logout may run.
const fn default_logout_cooldown_ms() -> u64 {
    1_000
}

/// Default age after which a durable session lock is considered abandoned.
const fn default_session_lock_stale_ms() -> u64 {
    30_000
}

fn default_login_route() -> String {
    "/login".to_string()
}

fn default_timezone_setup_route() -> String {
    "/timezone-setup".to_string()
}

fn default_landing_route() -> String {
    "/dashboard".to_string()
}

fn default_direct_login() -> String {
    "/auth/direct-login".to_string()
}

fn default_verify_login_otp() -> String {
    "/auth/verify-login-otp".to_string()
}

fn default_sync_device() -> String {
    "/auth/sync-device".to_string()
}

fn default_renew_token() -> String {
    "/auth/renew-token".to_string()
}

fn default_logout() -> String {
    "/auth/logout".to_string()
}

/// Main configuration for the portal session core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Base URL every endpoint path is appended to.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Per-request transport timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u32,

    /// Path of the JSON file backing durable storage.
    #[serde(default = "default_storage_file")]
    pub storage_file: String,

    /// Gateway and session timings.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Navigation targets.
    #[serde(default)]
    pub routes: RouteConfig,

    /// API endpoint paths.
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout(),
            storage_file: default_storage_file(),
            timing: TimingConfig::default(),
            routes: RouteConfig::default(),
            endpoints: EndpointConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `portal.json` in the current directory. If not found,
    /// returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            SessionError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `portal.json` in a specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ConfigParseError` if the file cannot be read or
    /// contains invalid JSON, and `SessionError::ConfigValidationError` if the
    /// values are out of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(SessionError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| SessionError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(SessionError::config_validation(
                "apiBaseUrl must not be empty",
                "Set apiBaseUrl to the portal API root, e.g. https://portal.example.com/api",
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(SessionError::config_validation(
                "requestTimeoutSecs must be greater than 0",
                "Set requestTimeoutSecs to at least 1 in your portal.json",
            ));
        }

        if self.storage_file.trim().is_empty() {
            return Err(SessionError::config_validation(
                "storageFile must not be empty",
                "Provide a writable storageFile path in your portal.json",
            ));
        }

        self.timing.validate()?;

        for (name, route) in [
            ("routes.login", &self.routes.login),
            ("routes.timezoneSetup", &self.routes.timezone_setup),
            ("routes.defaultLanding", &self.routes.default_landing),
            ("endpoints.directLogin", &self.endpoints.direct_login),
            ("endpoints.verifyLoginOtp", &self.endpoints.verify_login_otp),
            ("endpoints.syncDevice", &self.endpoints.sync_device),
            ("endpoints.renewToken", &self.endpoints.renew_token),
            ("endpoints.logout", &self.endpoints.logout),
        ] {
            if !route.starts_with('/') {
                return Err(SessionError::config_validation(
                    format!("{name} must start with '/' (got '{route}')"),
                    format!("Use an absolute path for {name} in your portal.json"),
                ));
            }
        }

        Ok(())
    }

    /// Returns the transport timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.request_timeout_secs))
    }
}

/// Timings for gating, debouncing and settling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingConfig {
    /// How long a gated request may wait for restoration.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Debounce window coalescing restoration triggers.
    #[serde(default = "default_restore_debounce_ms")]
    pub restore_debounce_ms: u64,

    /// Pause after restoration before navigating.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Cooldown after a logout before another may start.
    #[serde(default = "default_logout_cooldown_ms")]
    pub logout_cooldown_ms: u64,

    /// Age after which a durable session lock is ignored.
    #[serde(default = "default_session_lock_stale_ms")]
    pub session_lock_stale_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            queue_timeout_ms: default_queue_timeout_ms(),
            restore_debounce_ms: default_restore_debounce_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            logout_cooldown_ms: default_logout_cooldown_ms(),
            session_lock_stale_ms: default_session_lock_stale_ms(),
        }
    }
}

impl TimingConfig {
    fn validate(&self) -> Result<()> {
        if self.queue_timeout_ms == 0 {
            return Err(SessionError::config_validation(
                "timing.queueTimeoutMs must be greater than 0",
                "Set timing.queueTimeoutMs to at least 1 in your portal.json",
            ));
        }

        if self.session_lock_stale_ms == 0 {
            return Err(SessionError::config_validation(
                "timing.sessionLockStaleMs must be greater than 0",
                "Set timing.sessionLockStaleMs to at least 1 in your portal.json",
            ));
        }

        Ok(())
    }

    /// Queue timeout as a `Duration`.
    #[must_use]
    pub const fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// Restoration debounce window as a `Duration`.
    #[must_use]
    pub const fn restore_debounce(&self) -> Duration {
        Duration::from_millis(self.restore_debounce_ms)
    }

    /// Settle delay as a `Duration`.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Logout cooldown as a `Duration`.
    #[must_use]
    pub const fn logout_cooldown(&self) -> Duration {
        Duration::from_millis(self.logout_cooldown_ms)
    }
}

/// Navigation targets used by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// Login entry point.
    #[serde(default = "default_login_route")]
    pub login: String,

    /// Mandatory timezone setup surface.
    #[serde(default = "default_timezone_setup_route")]
    pub timezone_setup: String,

    /// Landing page when no last path was recorded.
    #[serde(default = "default_landing_route")]
    pub default_landing: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            login: default_login_route(),
            timezone_setup: default_timezone_setup_route(),
            default_landing: default_landing_route(),
        }
    }
}

/// API endpoint paths, relative to `apiBaseUrl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Session re-establishment from a stored token (bootstrap).
    #[serde(default = "default_direct_login")]
    pub direct_login: String,

    /// OTP login verification (bootstrap).
    #[serde(default = "default_verify_login_otp")]
    pub verify_login_otp: String,

    /// Best-effort device registration after restore.
    #[serde(default = "default_sync_device")]
    pub sync_device: String,

    /// Token renewal.
    #[serde(default = "default_renew_token")]
    pub renew_token: String,

    /// Server-side logout.
    #[serde(default = "default_logout")]
    pub logout: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            direct_login: default_direct_login(),
            verify_login_otp: default_verify_login_otp(),
            sync_device: default_sync_device(),
            renew_token: default_renew_token(),
            logout: default_logout(),
        }
    }
}

impl EndpointConfig {
    /// Returns `true` if `path` is one of the session-establishing endpoints
    /// exempt from gating.
    #[must_use]
    pub fn is_bootstrap(&self, path: &str) -> bool {
        path == self.direct_login || path == self.verify_login_otp
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.api_base_url, "http://localhost:5000/api");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.storage_file, ".portal/storage.json");
        assert_eq!(config.timing.queue_timeout_ms, 10_000);
        assert_eq!(config.timing.restore_debounce_ms, 4_000);
        assert_eq!(config.timing.settle_delay_ms, 500);
        assert_eq!(config.timing.logout_cooldown_ms, 1_000);
        assert_eq!(config.routes.login, "/login");
        assert_eq!(config.routes.timezone_setup, "/timezone-setup");
        assert_eq!(config.endpoints.renew_token, "/auth/renew-token");
    }

    #[test]
    fn test_config_deserialization_with_overrides() {
        let json = r#"{
            "apiBaseUrl": "https://portal.example.com/api",
            "timing": { "queueTimeoutMs": 2500 },
            "routes": { "defaultLanding": "/home" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.api_base_url, "https://portal.example.com/api");
        assert_eq!(config.timing.queue_timeout_ms, 2500);
        assert_eq!(config.timing.restore_debounce_ms, 4_000);
        assert_eq!(config.routes.default_landing, "/home");
        assert_eq!(config.routes.login, "/login");
    }

    #[test]
    fn test_bootstrap_endpoints() {
        let endpoints = EndpointConfig::default();
        assert!(endpoints.is_bootstrap("/auth/direct-login"));
        assert!(endpoints.is_bootstrap("/auth/verify-login-otp"));
        assert!(!endpoints.is_bootstrap("/auth/renew-token"));
        assert!(!endpoints.is_bootstrap("/classes"));
    }

    #[test]
    fn test_load_from_file_nonexistent_returns_default() {
        let config = Config::load_from_file(&PathBuf::from("/nonexistent/portal.json")).unwrap();
        assert_eq!(config.routes.login, "/login");
    }

    #[test]
    fn test_load_from_file_invalid_json() {
        use std::io::Write;

        let config_path = std::env::temp_dir().join("test_portal_invalid.json");
        let mut file = std::fs::File::create(&config_path).unwrap();
        file.write_all(b"{ not json").unwrap();

        let err = Config::load_from_file(&config_path).unwrap_err();
        assert!(
            matches!(&err, SessionError::ConfigParseError { path, .. } if *path == config_path),
            "Expected ConfigParseError, got: {err:?}"
        );

        std::fs::remove_file(&config_path).ok();
    }

    #[test]
    fn test_load_from_dir_validates_after_parsing() {
        use std::io::Write;

        let dir = std::env::temp_dir().join("test_portal_dir_validation");
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("portal.json");
        let mut file = std::fs::File::create(&config_path).unwrap();
        file.write_all(br#"{"timing": {"queueTimeoutMs": 0}}"#).unwrap();

        let err = Config::load_from_dir(&dir).unwrap_err();
        assert!(
            matches!(&err, SessionError::ConfigValidationError { message, .. } if message.contains("queueTimeoutMs")),
            "Expected ConfigValidationError, got: {err:?}"
        );

        std::fs::remove_file(&config_path).ok();
        std::fs::remove_dir(&dir).ok();
    }

    #[test]
    fn test_validation_rejects_relative_route() {
        let mut config = Config::default();
        config.routes.login = "login".to_string();

        let err = config.validate().unwrap_err();
        assert!(
            matches!(&err, SessionError::ConfigValidationError { message, .. } if message.contains("routes.login")),
            "Expected ConfigValidationError about routes.login, got: {err:?}"
        );
    }

    #[test]
    fn test_validation_rejects_empty_base_url() {
        let config = Config {
            api_base_url: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_passes_validation() {
        assert!(Config::default().validate().is_ok());
    }
}
