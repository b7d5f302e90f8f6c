//! Portal Session Core
//!
//! Restores the portal session on startup and gates every outbound API call
//! until restoration has finished.
//!
//! - [`RequestGateway`] attaches credentials, parks requests until the session
//!   is restored, and renews the token once on a 401.
//! - [`SessionManager`] drives restoration, login and logout, and follows
//!   logouts made in other tabs.

pub mod config;
pub mod credential;
pub mod debounce;
pub mod error;
pub mod events;
pub mod gate;
pub mod gateway;
pub mod models;
pub mod navigation;
pub mod session;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use config::{Config, EndpointConfig, RouteConfig, TimingConfig};
pub use credential::{Credential, CredentialStore};
pub use error::{Result, SessionError};
pub use events::{EventBroadcaster, LogoutOrigin, SessionEvent};
pub use gate::{restore_gate, Admission, RestoreGate, RestoreSignal, Turn};
pub use gateway::RequestGateway;
pub use models::{AuthResponse, Role, User, UserRole};
pub use navigation::{HistoryNavigator, Navigator};
pub use reqwest::Method;
pub use session::{SessionManager, SessionPhase, SessionState};
pub use storage::{keys, LocalStorage, StorageEvent, StorageEvents};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
