//! Authenticated access to the backend API.
//!
//! Every call made through [`Gateway::send`] carries the stored access token as a bearer
//! credential. When the backend answers `401 Unauthorized` the gateway refreshes the access token
//! and retries the call once. Calls that expire while a refresh is already running wait for that
//! refresh instead of starting their own, so a burst of expired calls costs a single refresh.

mod coordinator;
mod credentials;
mod transport;

pub use coordinator::{RefreshCoordinator, RefreshFailure, RefreshGuard, RefreshOutcome, Ticket};
pub use credentials::{
    CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore, StoredSession,
};
pub use transport::{
    ApiRequest, ApiResponse, FilePart, FormData, ReqwestTransport, RequestBody, Transport,
    TransportError,
};

use crate::metrics::{GatewayMetrics, RefreshStatus};
use prometheus::Registry;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Path of the token refresh endpoint.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Message for calls rejected after an earlier failed refresh already ended the session.
pub const SESSION_ENDED_MESSAGE: &str = "Session expired, please log in again";

/// Message used when neither the backend nor the transport explain a failure.
pub const FALLBACK_MESSAGE: &str = "An unexpected error occurred";

/// The only error shape callers of the gateway ever see.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The backend rejected the credential even after a refresh.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    /// The session cannot be recovered; stored credentials were purged.
    #[error("session expired: {message}")]
    SessionExpired { message: String },
    /// Any other failure. `status` is absent when no response was received.
    #[error("{message}")]
    Api {
        status: Option<StatusCode>,
        message: String,
    },
}

impl GatewayError {
    pub fn message(&self) -> &str {
        match self {
            GatewayError::Unauthorized { message }
            | GatewayError::SessionExpired { message }
            | GatewayError::Api { message, .. } => message,
        }
    }

    fn from_response(response: &ApiResponse) -> GatewayError {
        let message = error_message(response);

        if response.status == StatusCode::UNAUTHORIZED {
            GatewayError::Unauthorized { message }
        } else {
            GatewayError::Api {
                status: Some(response.status),
                message,
            }
        }
    }

    fn from_transport(err: &TransportError) -> GatewayError {
        let message = err.to_string();

        GatewayError::Api {
            status: None,
            message: if message.trim().is_empty() {
                FALLBACK_MESSAGE.to_owned()
            } else {
                message
            },
        }
    }
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: Option<String>,
}

/// Picks the most helpful message for a failed response: the backend's own `message`, then the
/// status line, then the fallback.
fn error_message(response: &ApiResponse) -> String {
    if let Ok(ErrorPayload {
        message: Some(message),
    }) = response.json::<ErrorPayload>()
    {
        if !message.is_empty() {
            return message;
        }
    }

    if response.status.is_client_error() || response.status.is_server_error() {
        return format!("Request failed with status code {}", response.status.as_u16());
    }

    FALLBACK_MESSAGE.to_owned()
}

/// Invoked once whenever the session ends because a refresh failed.
pub trait SessionExpiredNotifier: Send + Sync {
    fn session_expired(&self);
}

impl<F> SessionExpiredNotifier for F
where
    F: Fn() + Send + Sync,
{
    fn session_expired(&self) {
        self()
    }
}

/// One try of a request, remembering whether it already went through a refresh.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub request: ApiRequest,
    pub retried: bool,
}

impl Attempt {
    pub fn new(request: ApiRequest) -> Attempt {
        Attempt {
            request,
            retried: false,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshData {
    access_token: String,
}

#[derive(Deserialize)]
struct RefreshResponse {
    data: RefreshData,
}

struct Inner {
    transport: Box<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    notifier: Box<dyn SessionExpiredNotifier>,
    coordinator: RefreshCoordinator,
    refresh_timeout: Option<Duration>,
    metrics: GatewayMetrics,
}

/// Sends authenticated requests and recovers from expired access tokens.
///
/// Cloning is cheap; clones share the credential store and the refresh state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Creates a gateway. Refreshes are unbounded unless [`Gateway::with_refresh_timeout`] is used.
    pub fn new<T, N>(
        transport: T,
        credentials: Arc<dyn CredentialStore>,
        notifier: N,
    ) -> Result<Gateway, prometheus::Error>
    where
        T: Transport + 'static,
        N: SessionExpiredNotifier + 'static,
    {
        Ok(Gateway {
            inner: Arc::new(Inner {
                transport: Box::new(transport),
                credentials,
                notifier: Box::new(notifier),
                coordinator: RefreshCoordinator::new(),
                refresh_timeout: None,
                metrics: GatewayMetrics::new()?,
            }),
        })
    }

    /// Bounds every refresh call by `timeout`. Must be called before the gateway is cloned.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Gateway {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.refresh_timeout = Some(timeout),
            None => log::warn!("refresh timeout ignored on a shared gateway"),
        }
        self
    }

    /// Registers the gateway metrics in a prometheus registry.
    pub fn register_metrics(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        self.inner.metrics.register(registry)
    }

    /// The credential store this gateway reads tokens from.
    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.credentials
    }

    /// Returns true while a token refresh is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.inner.coordinator.is_refreshing()
    }

    /// Sends `request` with the stored access token attached and returns the successful response.
    ///
    /// A `401` triggers at most one refresh-and-retry cycle for this call.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, GatewayError> {
        let mut attempt = Attempt::new(request);
        let mut token = self.inner.credentials.access_token();

        loop {
            let response = self.perform(&attempt, token.as_deref()).await?;

            if response.status != StatusCode::UNAUTHORIZED || attempt.retried {
                return finish(response);
            }

            attempt.retried = true;
            token = Some(self.recover(token.as_deref()).await?);

            log::debug!(
                "retrying {} {} with refreshed token",
                attempt.request.method,
                attempt.request.path
            );
        }
    }

    /// Sends `request` without a bearer token and without refresh handling, for endpoints that
    /// establish a session such as login. A `401` here means bad input, not an expired token.
    pub async fn send_anonymous(&self, request: ApiRequest) -> Result<ApiResponse, GatewayError> {
        finish(self.perform(&Attempt::new(request), None).await?)
    }

    /// Performs one attempt. The bearer header is only touched when a token is available.
    async fn perform(
        &self,
        attempt: &Attempt,
        token: Option<&str>,
    ) -> Result<ApiResponse, GatewayError> {
        let mut request = attempt.request.clone();

        if let Some(token) = token {
            let mut header = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                GatewayError::Api {
                    status: None,
                    message: "stored access token is not a valid header value".to_owned(),
                }
            })?;
            header.set_sensitive(true);
            request.headers.insert(AUTHORIZATION, header);
        }

        self.inner.transport.perform(&request).await.map_err(|err| {
            log::warn!("{} {} failed: {err}", request.method, request.path);
            GatewayError::from_transport(&err)
        })
    }

    /// Obtains a fresh access token for a call that was rejected while sending `sent`, either by
    /// refreshing or by waiting for the refresh that is already running.
    ///
    /// If the stored token changed since the call was sent, an earlier refresh already settled:
    /// its new token is reused, or, when that refresh failed and cleared the store, the call
    /// fails without refreshing or notifying again.
    async fn recover(&self, sent: Option<&str>) -> Result<String, GatewayError> {
        let inner = &self.inner;

        let current = inner.credentials.access_token();
        if current.as_deref() != sent {
            return match current {
                Some(token) => {
                    log::debug!("access token was refreshed meanwhile, reusing it");
                    Ok(token)
                }
                None => Err(GatewayError::SessionExpired {
                    message: SESSION_ENDED_MESSAGE.to_owned(),
                }),
            };
        }

        let guard = match inner.coordinator.acquire_or_enqueue() {
            Ticket::Lead(guard) => guard,
            Ticket::Wait(rx) => {
                inner.metrics.queued_requests_total().inc();
                log::debug!("token refresh in progress, waiting for it");

                return match rx.await {
                    Ok(Ok(token)) => Ok(token),
                    // The leader went away; the session is still intact.
                    Ok(Err(failure)) if failure.abandoned => Err(GatewayError::Api {
                        status: None,
                        message: failure.message,
                    }),
                    Ok(Err(failure)) => Err(GatewayError::SessionExpired {
                        message: failure.message,
                    }),
                    Err(_) => Err(GatewayError::Api {
                        status: None,
                        message: RefreshFailure::abandoned().message,
                    }),
                };
            }
        };

        log::debug!("access token expired, refreshing");

        let result = match inner.refresh_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.refresh())
                .await
                .unwrap_or_else(|_| Err(RefreshFailure::new("token refresh timed out"))),
            None => self.refresh().await,
        };

        match result {
            Ok(token) => {
                let waiters = guard.settle(Ok(token.clone()));
                inner.metrics.refreshes_total(RefreshStatus::Success).inc();
                log::info!("refreshed access token, resuming {waiters} queued request(s)");
                Ok(token)
            }
            Err(failure) => {
                // Purge before releasing the waiters so none of them sees the stale tokens.
                if let Err(err) = inner.credentials.clear() {
                    log::error!("failed to clear credentials: {err}");
                }

                let waiters = guard.settle(Err(failure.clone()));
                inner.metrics.refreshes_total(RefreshStatus::Error).inc();
                log::warn!(
                    "token refresh failed, failing {waiters} queued request(s): {}",
                    failure.message
                );

                inner.notifier.session_expired();

                Err(GatewayError::SessionExpired {
                    message: failure.message,
                })
            }
        }
    }

    /// Exchanges the stored refresh token for a new access token and persists it. The call goes
    /// straight to the transport without a bearer header.
    async fn refresh(&self) -> Result<String, RefreshFailure> {
        let inner = &self.inner;

        let refresh_token = inner
            .credentials
            .refresh_token()
            .ok_or_else(|| RefreshFailure::new("No refresh token available"))?;

        let request = ApiRequest::post(REFRESH_PATH)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .map_err(|err| RefreshFailure::new(err.to_string()))?;

        let response = inner
            .transport
            .perform(&request)
            .await
            .map_err(|err| RefreshFailure::new(GatewayError::from_transport(&err).message()))?;

        if !response.is_success() {
            return Err(RefreshFailure::new(error_message(&response)));
        }

        let RefreshResponse { data } = response
            .json()
            .map_err(|err| RefreshFailure::new(format!("invalid refresh response: {err}")))?;

        inner
            .credentials
            .set_access(&data.access_token)
            .map_err(|err| RefreshFailure::new(err.to_string()))?;

        Ok(data.access_token)
    }
}

fn finish(response: ApiResponse) -> Result<ApiResponse, GatewayError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(GatewayError::from_response(&response))
    }
}
