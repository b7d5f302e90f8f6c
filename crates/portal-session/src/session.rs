//! Session bootstrap, login, logout and cross-tab propagation.
//!
//! [`SessionManager`] is the only writer of the restored flag. It walks the
//! per-process state machine:
//!
//! ```text
//! Uninitialized --mount--> AwaitingRestore --debounce--> Restoring
//!                                                          |
//!                                   +----------------------+----------------------+
//!                                   v                                             v
//!                             Authenticated  <----- login_with_otp -----  Unauthenticated
//!                                   |                                             ^
//!                                   +------------- logout / other tab ------------+
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::credential::CredentialStore;
use crate::debounce::Debouncer;
use crate::error::{Result, SessionError};
use crate::events::{EventBroadcaster, LogoutOrigin, SessionEvent};
use crate::gate::{restore_gate, RestoreSignal};
use crate::gateway::RequestGateway;
use crate::models::{AuthResponse, SyncDeviceRequest, User};
use crate::navigation::Navigator;
use crate::storage::{keys, LocalStorage};
use crate::transport::{ApiRequest, Transport};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Nothing has happened yet.
    Uninitialized,
    /// The device id is known and a restoration is scheduled.
    AwaitingRestore,
    /// A restoration attempt is running.
    Restoring,
    /// A user is logged in and the gate is open.
    Authenticated,
    /// No user is logged in; the gate is open so requests fail fast.
    Unauthenticated,
}

impl SessionPhase {
    /// Returns the phase name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::AwaitingRestore => "awaiting_restore",
            Self::Restoring => "restoring",
            Self::Authenticated => "authenticated",
            Self::Unauthenticated => "unauthenticated",
        }
    }

    /// Returns `true` once restoration has finished either way.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Unauthenticated)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory view of the session, rebuilt on every process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Current phase.
    pub phase: SessionPhase,
    /// The confirmed user, when authenticated.
    pub user: Option<User>,
    /// `true` until restoration has finished.
    pub loading: bool,
    /// Whether the gate has been opened.
    pub restored: bool,
    /// Device id, once resolved.
    pub device_id: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Uninitialized,
            user: None,
            loading: true,
            restored: false,
            device_id: None,
        }
    }
}

/// Shared session context: the restored flag writer, the re-entrancy flags
/// and everything the background tasks need.
struct SessionContext {
    config: Config,
    credentials: CredentialStore,
    gateway: RequestGateway,
    signal: RestoreSignal,
    navigator: Arc<dyn Navigator>,
    events: EventBroadcaster,
    state: Mutex<SessionState>,
    restoring: AtomicBool,
    logging_out: AtomicBool,
    debouncer: Debouncer,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionContext {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        let watcher = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
    }
}

/// Clears an [`AtomicBool`] when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Durable `sessionLock` marker, removed when dropped.
struct SessionLock<'a> {
    storage: &'a LocalStorage,
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        for key in [keys::SESSION_LOCK, keys::SESSION_LOCK_AT] {
            if let Err(err) = self.storage.remove(key) {
                warn!(key, error = %err, "Failed to release session lock");
            }
        }
    }
}

/// Drives session bootstrap and owns login and logout.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionContext>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &*self.inner.state())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager over `storage`, with a closed gate.
    #[must_use]
    pub fn new(
        config: Config,
        storage: LocalStorage,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let credentials = CredentialStore::new(storage);
        let (signal, gate) = restore_gate();
        let gateway = RequestGateway::new(
            &config,
            transport,
            credentials.clone(),
            gate,
            Arc::clone(&navigator),
        );
        let debouncer = Debouncer::new(config.timing.restore_debounce());

        Self {
            inner: Arc::new(SessionContext {
                config,
                credentials,
                gateway,
                signal,
                navigator,
                events: EventBroadcaster::default(),
                state: Mutex::new(SessionState::default()),
                restoring: AtomicBool::new(false),
                logging_out: AtomicBool::new(false),
                debouncer,
                watcher: Mutex::new(None),
            }),
        }
    }

    const fn from_context(inner: Arc<SessionContext>) -> Self {
        Self { inner }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Snapshot of the in-memory session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state().clone()
    }

    /// The confirmed user, when authenticated.
    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.inner.state().user.clone()
    }

    /// The device id, once resolved.
    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        self.inner.state().device_id.clone()
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.state().phase
    }

    /// Returns `true` once the gate has been opened.
    #[must_use]
    pub fn is_restored(&self) -> bool {
        self.inner.gateway.gate().is_restored()
    }

    /// Subscribes to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The gateway all application requests should go through.
    #[must_use]
    pub fn gateway(&self) -> &RequestGateway {
        &self.inner.gateway
    }

    /// Typed access to the stored credential.
    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Resolves the device id, starts listening for other tabs and schedules
    /// a restoration attempt.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a newly generated device id cannot be persisted.
    pub fn mount(&self) -> Result<String> {
        let device_id = self.inner.credentials.ensure_device_id()?;
        {
            let mut state = self.inner.state();
            state.device_id = Some(device_id.clone());
            if state.phase == SessionPhase::Uninitialized {
                state.phase = SessionPhase::AwaitingRestore;
            }
        }
        info!(device_id = %device_id, "Session mounted");

        self.start_watcher();
        self.trigger_restore();
        Ok(device_id)
    }

    /// Schedules a debounced restoration attempt.
    ///
    /// Returns `false` if the session is already restored or a restoration
    /// is in flight. Repeated triggers re-arm the timer instead of stacking.
    pub fn trigger_restore(&self) -> bool {
        if self.is_restored() || self.inner.restoring.load(Ordering::SeqCst) {
            debug!("Restoration not needed or already running");
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.debouncer.trigger(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(err) = SessionManager::from_context(inner).restore_session().await {
                debug!(error = %err, "Scheduled restoration ended in error");
            }
        });
        debug!(
            delay_ms = self.inner.config.timing.restore_debounce_ms,
            "Restoration scheduled"
        );
        true
    }

    /// Runs a restoration attempt now.
    ///
    /// Returns the phase reached. A no-op returning the current phase when
    /// the session is already restored, another restoration is in flight, or
    /// another tab holds a live session lock (in which case a new attempt is
    /// scheduled).
    ///
    /// # Errors
    ///
    /// Returns the error that made the restoration fail. The session is then
    /// `Unauthenticated`, the credential is cleared and the gate is open.
    pub async fn restore_session(&self) -> Result<SessionPhase> {
        self.inner.debouncer.cancel();
        if self.is_restored() {
            return Ok(self.phase());
        }
        let Some(restoring) = FlagGuard::acquire(&self.inner.restoring) else {
            debug!("Restoration already in flight");
            return Ok(self.phase());
        };

        let Some(lock) = self.acquire_session_lock()? else {
            info!("Another tab is restoring the session, retrying later");
            drop(restoring);
            self.trigger_restore();
            return Ok(self.phase());
        };

        let result = self.restore_locked().await;
        drop(lock);
        result
    }

    fn acquire_session_lock(&self) -> Result<Option<SessionLock<'_>>> {
        let storage = self.inner.credentials.storage();
        if self.session_lock_is_live(storage) {
            return Ok(None);
        }
        if storage.get_flag(keys::SESSION_LOCK) {
            warn!("Taking over stale session lock");
        }
        storage.set_flag(keys::SESSION_LOCK, true)?;
        storage.set(keys::SESSION_LOCK_AT, Utc::now().to_rfc3339())?;
        Ok(Some(SessionLock { storage }))
    }

    /// A lock is live if it is set and was taken less than
    /// `sessionLockStaleMs` ago. Locks without a readable timestamp are stale.
    fn session_lock_is_live(&self, storage: &LocalStorage) -> bool {
        if !storage.get_flag(keys::SESSION_LOCK) {
            return false;
        }
        let Some(taken_at) = storage
            .get(keys::SESSION_LOCK_AT)
            .and_then(|at| DateTime::parse_from_rfc3339(&at).ok())
        else {
            return false;
        };
        let age_ms = Utc::now()
            .signed_duration_since(taken_at)
            .num_milliseconds();
        let stale_ms = i64::try_from(self.inner.config.timing.session_lock_stale_ms)
            .unwrap_or(i64::MAX);
        age_ms < stale_ms
    }

    async fn restore_locked(&self) -> Result<SessionPhase> {
        let credentials = &self.inner.credentials;
        let device_id = credentials.ensure_device_id()?;
        {
            let mut state = self.inner.state();
            state.phase = SessionPhase::Restoring;
            state.loading = true;
            state.device_id = Some(device_id.clone());
        }
        info!(device_id = %device_id, "Restoring session");
        self.inner
            .events
            .send(SessionEvent::restore_started(&device_id));

        if !credentials.load().is_restorable() {
            info!("No stored session, login required");
            if let Err(err) = credentials.clear() {
                warn!(error = %err, "Failed to clear stored credential");
            }
            self.enter_unauthenticated("no stored session");
            return Ok(SessionPhase::Unauthenticated);
        }

        let request = ApiRequest::post(self.inner.config.endpoints.direct_login.clone());
        let outcome = match self.inner.gateway.send_json::<AuthResponse>(request).await {
            Ok(auth) => self.establish(auth).await,
            Err(err) => Err(err),
        };
        outcome.map_err(|err| self.fail_restore(err))
    }

    fn fail_restore(&self, err: SessionError) -> SessionError {
        warn!(error = %err, "Session restoration failed");
        if let Err(clear_err) = self.inner.credentials.clear() {
            warn!(error = %clear_err, "Failed to clear stored credential");
        }
        self.enter_unauthenticated(&err.to_string());
        self.inner.events.send(SessionEvent::error(err.to_string()));
        err
    }

    /// Opens the gate without a user and sends the app to the login route.
    fn enter_unauthenticated(&self, reason: &str) {
        {
            let mut state = self.inner.state();
            state.phase = SessionPhase::Unauthenticated;
            state.user = None;
            state.loading = false;
            state.restored = true;
        }
        self.inner.signal.mark_restored();
        self.inner
            .events
            .send(SessionEvent::unauthenticated(reason));
        self.navigate(&self.inner.config.routes.login);
    }

    /// Stores a confirmed identity, opens the gate and routes the app.
    async fn establish(&self, auth: AuthResponse) -> Result<SessionPhase> {
        let credentials = &self.inner.credentials;
        if let Some(token) = auth.token.as_deref().filter(|t| !t.is_empty()) {
            credentials.store_token(token)?;
        }
        credentials.store_user_id(&auth.user.id)?;
        credentials.set_logged_in(true)?;

        let user = auth.user;
        {
            let mut state = self.inner.state();
            state.phase = SessionPhase::Authenticated;
            state.user = Some(user.clone());
            state.loading = false;
            state.restored = true;
        }
        let released = self.inner.signal.mark_restored();
        info!(user_id = %user.id, role = %user.role.role_name, released, "Session established");
        self.inner.events.send(SessionEvent::restored(
            user.id.clone(),
            user.role.role_name.clone(),
            released,
        ));

        self.sync_device().await;
        sleep(self.inner.config.timing.settle_delay()).await;
        let target = self.landing_route(&user);
        self.navigate(&target);
        Ok(SessionPhase::Authenticated)
    }

    async fn sync_device(&self) {
        let Some(device_id) = self.inner.credentials.device_id() else {
            return;
        };
        let body = match serde_json::to_value(SyncDeviceRequest { device_id }) {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "Failed to encode device sync body");
                return;
            }
        };
        let request =
            ApiRequest::post(self.inner.config.endpoints.sync_device.clone()).with_json(body);
        match self.inner.gateway.send(request).await {
            Ok(_) => debug!("Device synced"),
            Err(err) => warn!(error = %err, "Device sync failed"),
        }
    }

    fn landing_route(&self, user: &User) -> String {
        let routes = &self.inner.config.routes;
        if user.needs_timezone_setup() {
            return routes.timezone_setup.clone();
        }
        self.inner
            .credentials
            .last_path()
            .filter(|path| *path != routes.login)
            .unwrap_or_else(|| routes.default_landing.clone())
    }

    fn navigate(&self, path: &str) {
        self.inner.navigator.navigate(path);
        self.inner.events.send(SessionEvent::navigated(path));
    }

    // ========================================================================
    // Login
    // ========================================================================

    /// Verifies a login OTP and establishes the session it returns.
    ///
    /// `payload` is sent as-is as the request body.
    ///
    /// # Errors
    ///
    /// Returns the gateway error if verification fails, or `InvalidResponse`
    /// if the server did not return a user.
    pub async fn login_with_otp(&self, payload: Value) -> Result<User> {
        let request = ApiRequest::post(self.inner.config.endpoints.verify_login_otp.clone())
            .with_json(payload);
        let auth = match self.inner.gateway.send_json::<AuthResponse>(request).await {
            Ok(auth) => auth,
            Err(err) => {
                warn!(error = %err, "OTP login failed");
                self.inner.events.send(SessionEvent::error(err.to_string()));
                return Err(err);
            }
        };
        let user = auth.user.clone();
        self.establish(auth).await?;
        Ok(user)
    }

    /// Records the current route so the next restoration can return to it.
    /// The login route is never recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn record_path(&self, path: &str) -> Result<()> {
        if path == self.inner.config.routes.login {
            return Ok(());
        }
        debug!(path, "Recording last path");
        self.inner.credentials.set_last_path(path)
    }

    // ========================================================================
    // Logout
    // ========================================================================

    /// Logs out. Concurrent calls collapse into one until the cooldown ends.
    ///
    /// Returns `false` if a logout was already in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored credential cannot be cleared. The
    /// server call is best effort and never fails the logout.
    pub async fn logout(&self) -> Result<bool> {
        self.logout_from(LogoutOrigin::Local).await
    }

    async fn logout_from(&self, origin: LogoutOrigin) -> Result<bool> {
        if self.inner.logging_out.swap(true, Ordering::SeqCst) {
            debug!(?origin, "Logout already in progress");
            return Ok(false);
        }
        let result = self.sign_out(origin).await;
        self.schedule_logout_cooldown();
        result.map(|()| true)
    }

    async fn sign_out(&self, origin: LogoutOrigin) -> Result<()> {
        if self.is_restored() && self.inner.credentials.token().is_some() {
            let request = ApiRequest::post(self.inner.config.endpoints.logout.clone());
            if let Err(err) = self.inner.gateway.send(request).await {
                warn!(error = %err, "Logout request failed, clearing session anyway");
            }
        }

        self.inner.credentials.sign_out()?;
        {
            let mut state = self.inner.state();
            state.phase = SessionPhase::Unauthenticated;
            state.user = None;
            state.loading = false;
        }
        info!(?origin, "Logged out");
        self.inner.events.send(SessionEvent::logged_out(origin));
        self.navigate(&self.inner.config.routes.login);
        Ok(())
    }

    fn schedule_logout_cooldown(&self) {
        let weak: Weak<SessionContext> = Arc::downgrade(&self.inner);
        let cooldown = self.inner.config.timing.logout_cooldown();
        tokio::spawn(async move {
            sleep(cooldown).await;
            if let Some(inner) = weak.upgrade() {
                inner.logging_out.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Logs this tab out whenever another tab sets `isLoggedIn` to `"false"`.
    fn start_watcher(&self) {
        let mut watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return;
        }

        let mut changes = self.inner.credentials.storage().subscribe();
        let weak = Arc::downgrade(&self.inner);
        *watcher = Some(tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                if change.key != keys::IS_LOGGED_IN || change.new_value.as_deref() != Some("false")
                {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                info!("Another tab logged out");
                let manager = SessionManager::from_context(inner);
                if let Err(err) = manager.logout_from(LogoutOrigin::CrossTab).await {
                    warn!(error = %err, "Cross-tab logout failed");
                }
            }
        }));
    }
}
