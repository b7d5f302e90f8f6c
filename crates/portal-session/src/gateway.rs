//! The request gateway: the single chokepoint for outbound API calls.
//!
//! Every call runs through a fixed pipeline around the transport:
//!
//! 1. **prepare** - bootstrap endpoints skip the gate; everything else waits
//!    on the [`RestoreGate`] (FIFO, with a queue timeout), then gets the
//!    stored bearer token and device id attached.
//! 2. **send** - the prepared request goes to the [`Transport`]. Released
//!    requests hold their turn until the transport has started sending.
//! 3. **settle** - bootstrap responses refresh the stored token, a first 401
//!    triggers one token renewal and one re-issue, and remaining failures
//!    are mapped onto [`SessionError`].

use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, EndpointConfig};
use crate::credential::CredentialStore;
use crate::error::{Result, SessionError};
use crate::gate::{Admission, RestoreGate};
use crate::models::{RenewRequest, RenewResponse};
use crate::navigation::Navigator;
use crate::transport::{ApiRequest, ApiResponse, Transport, DEVICE_ID_HEADER};

/// HTTP status that triggers token renewal.
const UNAUTHORIZED: u16 = 401;

/// Central chokepoint for outbound API calls.
///
/// Cloning is cheap; clones share the transport, storage and gate.
#[derive(Clone)]
pub struct RequestGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    transport: Arc<dyn Transport>,
    credentials: CredentialStore,
    gate: RestoreGate,
    navigator: Arc<dyn Navigator>,
    endpoints: EndpointConfig,
    login_route: String,
    queue_timeout: Duration,
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("restored", &self.inner.gate.is_restored())
            .field("queued", &self.inner.gate.queued())
            .finish_non_exhaustive()
    }
}

impl RequestGateway {
    /// Creates a gateway reading the restored flag from `gate`.
    #[must_use]
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        credentials: CredentialStore,
        gate: RestoreGate,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                transport,
                credentials,
                gate,
                navigator,
                endpoints: config.endpoints.clone(),
                login_route: config.routes.login.clone(),
                queue_timeout: config.timing.queue_timeout(),
            }),
        }
    }

    /// The gate this gateway waits on.
    #[must_use]
    pub fn gate(&self) -> &RestoreGate {
        &self.inner.gate
    }

    /// Sends a request through the full pipeline.
    ///
    /// # Errors
    ///
    /// - `SessionRestorationTimeout` if the request expired in the queue
    /// - `RenewalFailed` if a 401 could not be recovered by renewing the token
    /// - `Unauthorized` if the re-issued request was rejected again
    /// - `ServerError` for any other non-2xx status
    /// - `NetworkError` for transport failures
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        let response = self.dispatch(&mut request).await?;
        self.settle(request, response).await
    }

    /// Sends a request and deserializes the response body.
    ///
    /// # Errors
    ///
    /// Everything [`RequestGateway::send`] returns, plus `InvalidResponse`
    /// when the body does not match `T`.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let path = request.path.clone();
        self.send(request).await?.json(&path)
    }

    /// Prepares a request and hands it to the transport.
    async fn dispatch(&self, request: &mut ApiRequest) -> Result<ApiResponse> {
        let admission = if self.inner.endpoints.is_bootstrap(&request.path) {
            debug!(path = %request.path, "Bootstrap endpoint bypasses the restore gate");
            Admission::Open
        } else {
            match self
                .inner
                .gate
                .admit(&request.path, self.inner.queue_timeout)
                .await
            {
                Ok(admission) => admission,
                Err(err) => {
                    if let Err(store_err) = self.inner.credentials.set_logged_in(false) {
                        warn!(error = %store_err, "Failed to clear login marker after queue timeout");
                    }
                    return Err(err);
                }
            }
        };

        if let Admission::Released(turn) = &admission {
            turn.wait().await;
            debug!(path = %request.path, ticket = turn.ticket(), "Released from restore gate");
        }

        self.attach_headers(request);
        debug!(method = %request.method, path = %request.path, retried = request.is_retried(), "Sending request");

        let mut in_flight = self.inner.transport.send(request);
        // The first poll starts the send; after that later turns may proceed
        let first = futures::poll!(&mut in_flight);
        drop(admission);
        match first {
            Poll::Ready(result) => result,
            Poll::Pending => in_flight.await,
        }
    }

    fn attach_headers(&self, request: &mut ApiRequest) {
        match self.inner.credentials.token() {
            Some(token) => request.set_bearer(&token),
            None => debug!(path = %request.path, "No stored token; sending without Authorization"),
        }
        match self.inner.credentials.device_id() {
            Some(device_id) => {
                request
                    .headers
                    .insert(DEVICE_ID_HEADER.to_string(), device_id);
            }
            None => debug!(path = %request.path, "No stored device id; sending without Device-Id"),
        }
    }

    /// Post-receive stage.
    async fn settle(&self, mut request: ApiRequest, response: ApiResponse) -> Result<ApiResponse> {
        let renewable = response.status == UNAUTHORIZED
            && !request.is_retried()
            && request.path != self.inner.endpoints.logout;
        if !renewable {
            return self.classify(&request, response);
        }

        request.mark_retried();
        info!(path = %request.path, "Received 401, attempting token renewal");
        let token = match self.renew().await {
            Ok(token) => token,
            Err(err) => {
                warn!(path = %request.path, error = %err, "Token renewal failed, redirecting to login");
                if let Err(store_err) = self.inner.credentials.set_logged_in(false) {
                    warn!(error = %store_err, "Failed to clear login marker");
                }
                // Bootstrap callers route the app themselves
                if !self.inner.endpoints.is_bootstrap(&request.path) {
                    self.inner.navigator.navigate(&self.inner.login_route);
                }
                return Err(err);
            }
        };

        request.set_bearer(&token);
        let response = self.dispatch(&mut request).await?;
        self.classify(&request, response)
    }

    /// Maps a final response onto success or a [`SessionError`].
    fn classify(&self, request: &ApiRequest, response: ApiResponse) -> Result<ApiResponse> {
        if response.is_success() {
            self.capture_token(request, &response);
            return Ok(response);
        }
        if response.status == UNAUTHORIZED {
            return Err(SessionError::unauthorized(&request.path));
        }
        Err(SessionError::server(
            response.status,
            &request.path,
            response.error_message(),
        ))
    }

    /// Persists a rotated token returned by a bootstrap endpoint.
    fn capture_token(&self, request: &ApiRequest, response: &ApiResponse) {
        if !self.inner.endpoints.is_bootstrap(&request.path) {
            return;
        }
        let Some(token) = response.body.get("token").and_then(Value::as_str) else {
            return;
        };
        let credentials = &self.inner.credentials;
        if token.is_empty() || credentials.token().as_deref() == Some(token) {
            return;
        }

        let user_id = response
            .body
            .get("user")
            .and_then(|user| user.get("_id"))
            .or_else(|| response.body.get("userId"))
            .and_then(Value::as_str);

        let stored = credentials
            .store_token(token)
            .and_then(|()| match user_id {
                Some(user_id) => credentials.store_user_id(user_id),
                None => Ok(()),
            })
            .and_then(|()| credentials.set_logged_in(true));
        match stored {
            Ok(()) => info!(path = %request.path, "Stored token issued by bootstrap endpoint"),
            Err(err) => warn!(error = %err, "Failed to persist bootstrap token"),
        }
    }

    /// Exchanges the stored user and device ids for a fresh token.
    ///
    /// Renewal goes straight to the transport: it is only issued after a
    /// request already passed the gate, and a 401 here is final.
    async fn renew(&self) -> Result<String> {
        let credentials = &self.inner.credentials;
        let (Some(user_id), Some(device_id)) = (credentials.user_id(), credentials.device_id())
        else {
            return Err(SessionError::renewal_failed(
                "no stored user id or device id",
            ));
        };

        let path = &self.inner.endpoints.renew_token;
        let body = serde_json::to_value(RenewRequest { user_id, device_id })?;
        let mut request = ApiRequest::post(path.clone()).with_json(body);
        self.attach_headers(&mut request);

        let response = self
            .inner
            .transport
            .send(&request)
            .await
            .map_err(|e| SessionError::renewal_failed(e.to_string()))?;
        if !response.is_success() {
            return Err(SessionError::renewal_failed(format!(
                "renewal endpoint answered {}",
                response.status
            )));
        }
        let renewed: RenewResponse = response
            .json(path)
            .map_err(|e| SessionError::renewal_failed(e.to_string()))?;

        credentials.store_token(&renewed.token)?;
        info!("Token renewed");
        Ok(renewed.token)
    }
}
