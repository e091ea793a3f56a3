//! Authenticated transport with single-flight token refresh.
//!
//! Every request goes through [`Gateway::send`]. A 401 on an authenticated
//! call is handed to [`Gateway::handle_unauthorized`], which is the only path
//! that may start a refresh. While a refresh (or login) is in flight, further
//! 401s park in a [`PendingRequestQueue`] and are resumed in FIFO order once
//! the attempt settles.

use crate::{store::TokenStore, Error, Result};
use casebox_types::{
    api::{paths, ErrorBody, LoginRequest, RefreshRequest},
    TokenPair,
};
use reqwest::{Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, trace, warn};
use url::Url;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// A request that can be dispatched more than once.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    method: Method,
    path: String,
    segments: Vec<String>,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    exempt: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            segments: Vec::new(),
            query: Vec::new(),
            body: None,
            exempt: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Append one path segment. Reserved characters in it are escaped.
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Mark the request as one that never carries a bearer token and never
    /// triggers a refresh (login, refresh).
    pub fn unauthenticated(mut self) -> Self {
        self.exempt = true;
        self
    }

    pub fn is_exempt(&self) -> bool {
        self.exempt
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Derived session status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Authenticating,
    Authenticated,
    Expired,
}

/// Signals for the UI layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Authenticated,
    SessionExpired { reason: String },
    LoggedOut,
}

/// Observable view of the session, without the secrets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub pending: usize,
}

#[derive(Debug)]
enum Rejection {
    Failed(String),
    Reset,
}

type Continuation = oneshot::Sender<std::result::Result<String, Rejection>>;

/// Requests suspended behind an in-flight authentication attempt.
#[derive(Default)]
pub(crate) struct PendingRequestQueue {
    waiters: Vec<Continuation>,
}

impl PendingRequestQueue {
    fn push(&mut self) -> oneshot::Receiver<std::result::Result<String, Rejection>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    fn len(&self) -> usize {
        self.waiters.len()
    }

    fn resume(self, access_token: &str) -> usize {
        let count = self.waiters.len();
        for waiter in self.waiters {
            // A dropped receiver means the caller went away.
            let _ = waiter.send(Ok(access_token.to_string()));
        }
        count
    }

    fn reject(self, reason: impl Fn() -> Rejection) -> usize {
        let count = self.waiters.len();
        for waiter in self.waiters {
            let _ = waiter.send(Err(reason()));
        }
        count
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AuthAttempt {
    Login,
    Refresh,
}

enum Phase {
    Idle,
    Authenticating {
        attempt: AuthAttempt,
        pending: PendingRequestQueue,
    },
    Authenticated,
    Expired,
}

/// Tokens plus the authentication phase. Only the gateway mutates it.
pub(crate) struct SessionGatewayState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    phase: Phase,
    /// Bumped when an in-flight attempt is torn down so its late result is
    /// ignored.
    epoch: u64,
}

impl SessionGatewayState {
    fn new() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            phase: Phase::Idle,
            epoch: 0,
        }
    }

    fn status(&self) -> SessionStatus {
        match self.phase {
            Phase::Idle => SessionStatus::Idle,
            Phase::Authenticating { .. } => SessionStatus::Authenticating,
            Phase::Authenticated => SessionStatus::Authenticated,
            Phase::Expired => SessionStatus::Expired,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status(),
            has_access_token: self.access_token.is_some(),
            has_refresh_token: self.refresh_token.is_some(),
            pending: match &self.phase {
                Phase::Authenticating { pending, .. } => pending.len(),
                _ => 0,
            },
        }
    }

    /// Leave `next` in place of the current phase, returning the queue if an
    /// attempt was in flight.
    fn finish(&mut self, next: Phase) -> Option<PendingRequestQueue> {
        match mem::replace(&mut self.phase, next) {
            Phase::Authenticating { pending, .. } => Some(pending),
            _ => None,
        }
    }
}

enum Role {
    Leader { refresh_token: String, epoch: u64 },
    Follower(oneshot::Receiver<std::result::Result<String, Rejection>>),
    Replay(String),
    Expire,
}

enum RefreshFailure {
    /// The server refused the refresh token. Retrying cannot help.
    Rejected(String),
    /// Transport error or server-side failure.
    Transient(String),
}

impl RefreshFailure {
    fn reason(self) -> String {
        match self {
            RefreshFailure::Rejected(reason) | RefreshFailure::Transient(reason) => reason,
        }
    }
}

/// Rolls an abandoned attempt back if the future driving it is dropped.
struct InFlight<'a> {
    gateway: &'a Gateway,
    epoch: u64,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(gateway: &'a Gateway, epoch: u64) -> Self {
        Self {
            gateway,
            epoch,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gateway.abandon(self.epoch);
        }
    }
}

/// Authenticated transport shared by every API call of a [`crate::Client`].
pub struct Gateway {
    http: reqwest::Client,
    base_url: Url,
    state: Mutex<SessionGatewayState>,
    store: Arc<dyn TokenStore>,
    events: broadcast::Sender<SessionEvent>,
    max_refresh_attempts: u32,
    refresh_backoff: Duration,
}

impl Gateway {
    pub(crate) fn new(
        http: reqwest::Client,
        base_url: Url,
        store: Arc<dyn TokenStore>,
        max_refresh_attempts: u32,
        refresh_backoff: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            http,
            base_url,
            state: Mutex::new(SessionGatewayState::new()),
            store,
            events,
            max_refresh_attempts: max_refresh_attempts.max(1),
            refresh_backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionGatewayState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Seed the session with a persisted refresh token. Returns whether one
    /// is now held. The status stays idle until a refresh succeeds.
    pub fn restore(&self) -> Result<bool> {
        let token = self.store.load()?;
        let mut guard = self.lock();
        let state = &mut *guard;
        if matches!(state.phase, Phase::Idle) && state.refresh_token.is_none() {
            state.refresh_token = token;
        }
        Ok(state.refresh_token.is_some())
    }

    /// Dispatch a request, attaching the bearer token unless exempt.
    pub async fn send(&self, request: &ApiRequest) -> Result<Response> {
        if request.exempt {
            return self.dispatch(request, None).await;
        }
        let token = {
            let state = self.lock();
            if matches!(state.phase, Phase::Expired) {
                return Err(Error::SessionExhausted);
            }
            state.access_token.clone()
        };
        let response = self.dispatch(request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        self.handle_unauthorized(request, token, response).await
    }

    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response> {
        let url = request_url(&self.base_url, request)?;
        let mut builder = self.http.request(request.method.clone(), url);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        trace!(
            method = %request.method,
            path = %request.path,
            authenticated = token.is_some(),
            "dispatching request"
        );
        Ok(builder.send().await?)
    }

    /// Recover from a 401 on a non-exempt request.
    ///
    /// `sent_with` is the access token the failed attempt carried. The
    /// request is replayed at most once.
    pub async fn handle_unauthorized(
        &self,
        request: &ApiRequest,
        sent_with: Option<String>,
        response: Response,
    ) -> Result<Response> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        let role = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Phase::Authenticating { attempt, pending } = &mut state.phase {
                trace!(?attempt, queued = pending.len() + 1, "joining in-flight attempt");
                Role::Follower(pending.push())
            } else if matches!(state.phase, Phase::Expired) {
                return Err(Error::SessionExhausted);
            } else if let Some(current) = state
                .access_token
                .clone()
                .filter(|current| Some(current) != sent_with.as_ref())
            {
                // Someone refreshed after this request left.
                Role::Replay(current)
            } else if let Some(refresh_token) = state.refresh_token.clone() {
                state.phase = Phase::Authenticating {
                    attempt: AuthAttempt::Refresh,
                    pending: PendingRequestQueue::default(),
                };
                Role::Leader {
                    refresh_token,
                    epoch: state.epoch,
                }
            } else {
                state.access_token = None;
                state.phase = Phase::Expired;
                Role::Expire
            }
        };

        match role {
            Role::Replay(token) => {
                debug!(path = %request.path, "token rotated while request was in flight");
                self.replay(request, &token).await
            }
            Role::Follower(continuation) => {
                debug!(path = %request.path, "queued behind in-flight authentication");
                match continuation.await {
                    Ok(Ok(token)) => self.replay(request, &token).await,
                    Ok(Err(Rejection::Failed(reason))) => Err(Error::RefreshRejected(reason)),
                    Ok(Err(Rejection::Reset)) | Err(_) => Err(Error::SessionReset),
                }
            }
            Role::Expire => {
                self.expired("no refresh token available".to_string(), None);
                Err(Error::Unauthorized { status, body })
            }
            Role::Leader {
                refresh_token,
                epoch,
            } => {
                info!(path = %request.path, "access token rejected, refreshing");
                let mut in_flight = InFlight::new(self, epoch);
                let outcome = self.refresh_with_retries(&refresh_token).await;
                in_flight.disarm();
                match outcome {
                    Ok(pair) => match self.settle_success(epoch, pair) {
                        Some(token) => self.replay(request, &token).await,
                        None => Err(Error::SessionReset),
                    },
                    Err(reason) => {
                        if self.settle_failure(epoch, AuthAttempt::Refresh, reason) {
                            Err(Error::Unauthorized { status, body })
                        } else {
                            Err(Error::SessionReset)
                        }
                    }
                }
            }
        }
    }

    async fn replay(&self, request: &ApiRequest, token: &str) -> Result<Response> {
        let response = self.dispatch(request, Some(token)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(path = %request.path, "request rejected again with a fresh token");
            return Err(Error::Unauthorized { status, body });
        }
        Ok(response)
    }

    async fn refresh_with_retries(&self, refresh_token: &str) -> std::result::Result<TokenPair, String> {
        let mut last = String::new();
        for attempt in 1..=self.max_refresh_attempts {
            debug!(attempt, max = self.max_refresh_attempts, "requesting token refresh");
            match self.request_refresh(refresh_token).await {
                Ok(pair) => return Ok(pair),
                Err(RefreshFailure::Rejected(reason)) => {
                    warn!(attempt, %reason, "refresh token rejected");
                    return Err(reason);
                }
                Err(failure @ RefreshFailure::Transient(_)) => {
                    let reason = failure.reason();
                    warn!(attempt, %reason, "token refresh failed");
                    last = reason;
                    if attempt < self.max_refresh_attempts && !self.refresh_backoff.is_zero() {
                        tokio::time::sleep(self.refresh_backoff).await;
                    }
                }
            }
        }
        Err(format!(
            "refresh failed after {} attempts: {last}",
            self.max_refresh_attempts
        ))
    }

    async fn request_refresh(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<TokenPair, RefreshFailure> {
        let request = ApiRequest::post(paths::REFRESH)
            .unauthenticated()
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })
            .map_err(|err| RefreshFailure::Rejected(err.to_string()))?;
        let response = self
            .dispatch(&request, None)
            .await
            .map_err(|err| RefreshFailure::Transient(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return decode::<TokenPair>(response)
                .await
                .map_err(|err| RefreshFailure::Transient(err.to_string()));
        }
        let (status, detail) = error_detail(response).await;
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RefreshFailure::Rejected(detail))
            }
            _ => Err(RefreshFailure::Transient(format!("{status}: {detail}"))),
        }
    }

    /// Exchange host-provided init data for a token pair.
    pub async fn login(&self, init_data: &str) -> Result<()> {
        let epoch = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if matches!(state.phase, Phase::Authenticating { .. }) {
                return Err(Error::AuthInFlight);
            }
            state.phase = Phase::Authenticating {
                attempt: AuthAttempt::Login,
                pending: PendingRequestQueue::default(),
            };
            state.epoch
        };

        let mut in_flight = InFlight::new(self, epoch);
        let outcome = self.request_login(init_data).await;
        in_flight.disarm();
        match outcome {
            Ok(pair) => match self.settle_success(epoch, pair) {
                Some(_) => Ok(()),
                None => Err(Error::SessionReset),
            },
            Err(err) => {
                self.settle_failure(epoch, AuthAttempt::Login, err.to_string());
                Err(err)
            }
        }
    }

    async fn request_login(&self, init_data: &str) -> Result<TokenPair> {
        let request = ApiRequest::post(paths::LOGIN)
            .unauthenticated()
            .json(&LoginRequest {
                init_data: init_data.to_string(),
            })?;
        let response = self.dispatch(&request, None).await?;
        if !response.status().is_success() {
            let (status, body) = error_detail(response).await;
            return Err(Error::FailedWithBody { status, body });
        }
        decode(response).await
    }

    /// Install a fresh pair and resume everything queued behind the attempt.
    /// Returns `None` when the attempt was torn down meanwhile.
    fn settle_success(&self, epoch: u64, pair: TokenPair) -> Option<String> {
        let pending = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.epoch != epoch {
                debug!("discarding tokens from an abandoned authentication attempt");
                return None;
            }
            state.access_token = Some(pair.access_token.clone());
            state.refresh_token = Some(pair.refresh_token.clone());
            state.finish(Phase::Authenticated)
        };
        if let Err(err) = self.store.save(&pair.refresh_token) {
            warn!(error = %err, "failed to persist refresh token");
        }
        let resumed = pending.map(|queue| queue.resume(&pair.access_token)).unwrap_or(0);
        info!(resumed, "session authenticated");
        self.emit(SessionEvent::Authenticated);
        Some(pair.access_token)
    }

    /// Returns `false` when the attempt was torn down meanwhile.
    fn settle_failure(&self, epoch: u64, attempt: AuthAttempt, reason: String) -> bool {
        if self.lock().epoch != epoch {
            debug!("ignoring failure of an abandoned authentication attempt");
            return false;
        }
        match attempt {
            AuthAttempt::Refresh => self.expired(reason, Some(epoch)),
            AuthAttempt::Login => {
                let pending = {
                    let mut guard = self.lock();
                    let state = &mut *guard;
                    if state.epoch != epoch {
                        return false;
                    }
                    state.access_token = None;
                    state.finish(Phase::Idle)
                };
                let rejected = pending
                    .map(|queue| queue.reject(|| Rejection::Failed(reason.clone())))
                    .unwrap_or(0);
                warn!(rejected, %reason, "login failed");
            }
        }
        true
    }

    /// Enter the terminal expired state and tell the UI, once per cycle.
    fn expired(&self, reason: String, epoch: Option<u64>) {
        let pending = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if epoch.is_some_and(|epoch| epoch != state.epoch) {
                return;
            }
            state.access_token = None;
            state.refresh_token = None;
            state.finish(Phase::Expired)
        };
        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed to clear persisted refresh token");
        }
        let rejected = pending
            .map(|queue| queue.reject(|| Rejection::Failed(reason.clone())))
            .unwrap_or(0);
        warn!(rejected, %reason, "session expired");
        self.emit(SessionEvent::SessionExpired { reason });
    }

    fn abandon(&self, epoch: u64) {
        let pending = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.epoch != epoch || !matches!(state.phase, Phase::Authenticating { .. }) {
                return;
            }
            state.epoch += 1;
            state.finish(Phase::Idle)
        };
        let rejected = pending.map(|queue| queue.reject(|| Rejection::Reset)).unwrap_or(0);
        debug!(rejected, "authentication attempt abandoned");
    }

    /// Drop tokens, the persisted refresh token and any in-flight attempt.
    /// Idempotent.
    pub fn reset(&self) {
        let pending = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let pending = state.finish(Phase::Idle);
            if pending.is_some() {
                state.epoch += 1;
            }
            state.access_token = None;
            state.refresh_token = None;
            pending
        };
        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed to clear persisted refresh token");
        }
        let rejected = pending.map(|queue| queue.reject(|| Rejection::Reset)).unwrap_or(0);
        debug!(rejected, "session reset");
    }

    /// Explicit logout: reset and forget the persisted refresh token.
    pub fn logout(&self) -> Result<()> {
        self.reset();
        self.store.clear()?;
        info!("logged out");
        self.emit(SessionEvent::LoggedOut);
        Ok(())
    }
}

fn request_url(base: &Url, request: &ApiRequest) -> Result<Url> {
    let mut url = base.join(&request.path)?;
    if !request.segments.is_empty() {
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(request.segments.iter());
    }
    if !request.query.is_empty() {
        url.query_pairs_mut().extend_pairs(request.query.iter());
    }
    Ok(url)
}

/// Parse a success body. Transport failures stay `Network`; a body that
/// is not the expected JSON is `InvalidData`.
pub(crate) async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Status and the most useful error text of a failed response.
pub(crate) async fn error_detail(response: Response) -> (StatusCode, String) {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .map(|parsed| parsed.detail)
        .unwrap_or(body);
    (status, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Client, ClientConfig, ErrorKind, MemoryTokenStore};
    use axum::{
        extract::{Path as AxumPath, State as AxumState},
        http::{HeaderMap, StatusCode as AxumStatusCode},
        response::{IntoResponse, Response as AxumResponse},
        routing::{get, post},
        Json, Router,
    };
    use futures::future::join_all;
    use std::{
        net::SocketAddr,
        sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    };
    use tokio::{
        sync::broadcast::error::TryRecvError,
        time::{sleep, Duration},
    };

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum RefreshMode {
        Accept,
        Reject,
        Unavailable,
    }

    struct AuthServer {
        refresh_calls: AtomicUsize,
        me_calls: AtomicUsize,
        issued: AtomicUsize,
        refresh_delay_ms: AtomicU64,
        always_unauthorized: AtomicBool,
        refresh_mode: Mutex<RefreshMode>,
        valid_token: Mutex<Option<String>>,
    }

    impl AuthServer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                refresh_calls: AtomicUsize::new(0),
                me_calls: AtomicUsize::new(0),
                issued: AtomicUsize::new(0),
                refresh_delay_ms: AtomicU64::new(0),
                always_unauthorized: AtomicBool::new(false),
                refresh_mode: Mutex::new(RefreshMode::Accept),
                valid_token: Mutex::new(None),
            })
        }

        fn set_mode(&self, mode: RefreshMode) {
            *self.refresh_mode.lock().unwrap() = mode;
        }

        fn issue(&self) -> Json<serde_json::Value> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            let access = format!("access-{n}");
            *self.valid_token.lock().unwrap() = Some(access.clone());
            Json(serde_json::json!({
                "access_token": access,
                "refresh_token": format!("refresh-{n}"),
            }))
        }
    }

    async fn login(
        AxumState(server): AxumState<Arc<AuthServer>>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> AxumResponse {
        if headers.contains_key("authorization") || body["init_data"] != "good" {
            return (
                AxumStatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"detail": "invalid init data"})),
            )
                .into_response();
        }
        server.issue().into_response()
    }

    async fn refresh(
        AxumState(server): AxumState<Arc<AuthServer>>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> AxumResponse {
        server.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = server.refresh_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        if headers.contains_key("authorization") || body["refresh_token"].as_str().is_none() {
            return AxumStatusCode::BAD_REQUEST.into_response();
        }
        let mode = *server.refresh_mode.lock().unwrap();
        match mode {
            RefreshMode::Accept => server.issue().into_response(),
            RefreshMode::Reject => (
                AxumStatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"detail": "refresh token expired"})),
            )
                .into_response(),
            RefreshMode::Unavailable => AxumStatusCode::SERVICE_UNAVAILABLE.into_response(),
        }
    }

    async fn me(AxumState(server): AxumState<Arc<AuthServer>>, headers: HeaderMap) -> AxumResponse {
        server.me_calls.fetch_add(1, Ordering::SeqCst);
        let presented = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let expected = server
            .valid_token
            .lock()
            .unwrap()
            .as_ref()
            .map(|token| format!("Bearer {token}"));
        if server.always_unauthorized.load(Ordering::SeqCst) || presented.is_none() || presented != expected {
            return AxumStatusCode::UNAUTHORIZED.into_response();
        }
        Json(serde_json::json!({"id": "u1", "username": "alice"})).into_response()
    }

    async fn slow() -> AxumResponse {
        sleep(Duration::from_millis(1500)).await;
        AxumStatusCode::OK.into_response()
    }

    async fn garbled() -> AxumResponse {
        (AxumStatusCode::OK, "not json").into_response()
    }

    async fn echo(AxumPath(id): AxumPath<String>) -> AxumResponse {
        Json(serde_json::json!({ "id": id })).into_response()
    }

    async fn serve_router(router: Router) -> (String, tokio::task::JoinHandle<()>) {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let actual_addr = listener.local_addr().unwrap();
        let base_url = format!("http://{actual_addr}/api/v1/");

        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        sleep(Duration::from_millis(50)).await;
        (base_url, handle)
    }

    async fn setup(
        max_refresh_attempts: u32,
        refresh_token: Option<&str>,
    ) -> (Arc<AuthServer>, Client, tokio::task::JoinHandle<()>) {
        let server = AuthServer::new();
        let api = Router::new()
            .route("/auth/telegram", post(login))
            .route("/auth/refresh", post(refresh))
            .route("/users/me", get(me))
            .route("/slow", get(slow))
            .route("/garbled", get(garbled))
            .route("/echo/:id", get(echo))
            .with_state(server.clone());
        let router = Router::new().nest("/api/v1", api);
        let (base_url, handle) = serve_router(router).await;

        let store: Arc<dyn TokenStore> = match refresh_token {
            Some(token) => Arc::new(MemoryTokenStore::with_token(token)),
            None => Arc::new(MemoryTokenStore::new()),
        };
        let mut config = ClientConfig::default()
            .with_base_url(base_url)
            .with_max_refresh_attempts(max_refresh_attempts)
            .with_refresh_backoff(Duration::ZERO);
        config.request_timeout = Duration::from_millis(600);
        let client = Client::with_config(&config, store).unwrap();
        client.restore().unwrap();
        (server, client, handle)
    }

    #[tokio::test]
    async fn test_refresh_with_only_refresh_token() {
        let (server, client, handle) = setup(3, Some("refresh-0")).await;
        assert_eq!(client.status(), SessionStatus::Idle);
        let mut events = client.subscribe();

        let user = client.current_user().await.unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.status(), SessionStatus::Authenticated);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Authenticated);

        handle.abort();
    }

    #[tokio::test]
    async fn test_concurrent_unauthorized_requests_share_one_refresh() {
        let (server, client, handle) = setup(3, Some("refresh-0")).await;
        server.refresh_delay_ms.store(100, Ordering::SeqCst);

        let results = join_all((0..8).map(|_| client.current_user())).await;
        for result in results {
            assert_eq!(result.unwrap().id, "u1");
        }
        assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);

        // A second wave after the access token is revoked refreshes once more.
        *server.valid_token.lock().unwrap() = Some("revoked".into());
        let results = join_all((0..5).map(|_| client.current_user())).await;
        assert!(results.iter().all(|result| result.is_ok()));
        assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.snapshot().pending, 0);

        handle.abort();
    }

    #[tokio::test]
    async fn test_refresh_failure_rejects_every_waiter() {
        let (server, client, handle) = setup(3, Some("refresh-0")).await;
        server.set_mode(RefreshMode::Reject);
        server.refresh_delay_ms.store(100, Ordering::SeqCst);
        let mut events = client.subscribe();

        let results = join_all((0..6).map(|_| client.current_user())).await;
        assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
        let mut leaders = 0;
        for result in results {
            match result.unwrap_err() {
                Error::Unauthorized { .. } => leaders += 1,
                Error::RefreshRejected(reason) => assert_eq!(reason, "refresh token expired"),
                other => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(leaders, 1);
        assert_eq!(client.status(), SessionStatus::Expired);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SessionExpired {
                reason: "refresh token expired".into()
            }
        );
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        handle.abort();
    }

    #[tokio::test]
    async fn test_transient_refresh_failures_exhaust_attempts() {
        let (server, client, handle) = setup(2, Some("refresh-0")).await;
        server.set_mode(RefreshMode::Unavailable);
        let mut events = client.subscribe();

        let err = client.current_user().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
        assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.status(), SessionStatus::Expired);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::SessionExpired { .. })
        ));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        // Expired is terminal: nothing reaches the server.
        let me_calls = server.me_calls.load(Ordering::SeqCst);
        let err = client.current_user().await.unwrap_err();
        assert!(matches!(err, Error::SessionExhausted));
        assert_eq!(server.me_calls.load(Ordering::SeqCst), me_calls);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        // Until an explicit re-login.
        client.login("good").await.unwrap();
        assert_eq!(client.status(), SessionStatus::Authenticated);
        client.current_user().await.unwrap();

        handle.abort();
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_not_retried() {
        let (server, client, handle) = setup(3, Some("refresh-0")).await;
        server.set_mode(RefreshMode::Reject);

        client.current_user().await.unwrap_err();
        assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn test_replay_happens_at_most_once() {
        let (server, client, handle) = setup(3, Some("refresh-0")).await;
        server.always_unauthorized.store(true, Ordering::SeqCst);

        let err = client.current_user().await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
        assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.me_calls.load(Ordering::SeqCst), 2);
        // The refresh itself worked, so the session is not expired.
        assert_eq!(client.status(), SessionStatus::Authenticated);

        handle.abort();
    }

    #[tokio::test]
    async fn test_missing_refresh_token_expires_session() {
        let (server, client, handle) = setup(3, None).await;
        let mut events = client.subscribe();

        let err = client.current_user().await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
        assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.status(), SessionStatus::Expired);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::SessionExpired { .. })
        ));

        handle.abort();
    }

    #[tokio::test]
    async fn test_network_errors_do_not_refresh() {
        let (server, client, handle) = setup(3, Some("refresh-0")).await;

        let err = client.gateway().send(&ApiRequest::get("slow")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkFailure);
        assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.status(), SessionStatus::Idle);

        handle.abort();
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (_server, client, handle) = setup(3, Some("refresh-0")).await;
        client.current_user().await.unwrap();

        client.gateway().reset();
        let once = client.snapshot();
        client.gateway().reset();
        assert_eq!(client.snapshot(), once);
        assert_eq!(
            once,
            SessionSnapshot {
                status: SessionStatus::Idle,
                has_access_token: false,
                has_refresh_token: false,
                pending: 0,
            }
        );

        handle.abort();
    }

    #[tokio::test]
    async fn test_reset_during_refresh_discards_result() {
        let (server, client, handle) = setup(3, Some("refresh-0")).await;
        server.refresh_delay_ms.store(200, Ordering::SeqCst);
        let mut events = client.subscribe();

        let requests = join_all((0..3).map(|_| client.current_user()));
        let reset = async {
            sleep(Duration::from_millis(80)).await;
            assert_eq!(client.status(), SessionStatus::Authenticating);
            client.gateway().reset();
        };
        let (results, _) = tokio::join!(requests, reset);
        for result in results {
            assert!(matches!(result.unwrap_err(), Error::SessionReset));
        }
        assert_eq!(client.status(), SessionStatus::Idle);
        assert!(!client.snapshot().has_access_token);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        handle.abort();
    }

    #[tokio::test]
    async fn test_login_rejected_while_refresh_in_flight() {
        let (server, client, handle) = setup(3, Some("refresh-0")).await;
        server.refresh_delay_ms.store(150, Ordering::SeqCst);

        let request = client.current_user();
        let login = async {
            sleep(Duration::from_millis(50)).await;
            client.login("good").await
        };
        let (request, login) = tokio::join!(request, login);
        assert!(request.is_ok());
        assert!(matches!(login.unwrap_err(), Error::AuthInFlight));

        handle.abort();
    }

    #[tokio::test]
    async fn test_login_failure_surfaces_server_detail() {
        let (_server, client, handle) = setup(3, None).await;

        match client.login("bad").await.unwrap_err() {
            Error::FailedWithBody { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "invalid init data");
            }
            other => panic!("expected FailedWithBody, got {other:?}"),
        }
        assert_eq!(client.status(), SessionStatus::Idle);

        client.login("good").await.unwrap();
        assert_eq!(client.status(), SessionStatus::Authenticated);

        handle.abort();
    }

    #[tokio::test]
    async fn test_logout_clears_persisted_token() {
        let (_server, client, handle) = setup(3, Some("refresh-0")).await;
        client.current_user().await.unwrap();
        let mut events = client.subscribe();

        client.logout().unwrap();
        assert_eq!(events.try_recv().unwrap(), SessionEvent::LoggedOut);
        assert!(!client.restore().unwrap());
        assert_eq!(client.status(), SessionStatus::Idle);

        handle.abort();
    }

    #[tokio::test]
    async fn test_malformed_success_body_is_invalid_data() {
        let (_server, client, handle) = setup(3, Some("refresh-0")).await;

        let err = client
            .fetch::<serde_json::Value>(ApiRequest::get("garbled"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::Request);

        handle.abort();
    }

    #[test]
    fn test_segments_are_escaped() {
        let base = Url::parse("http://localhost:8000/api/v1/").unwrap();
        let request = ApiRequest::get("fairness/reveal")
            .segment("a/b?c#d")
            .query("page", "1");
        let url = request_url(&base, &request).unwrap();
        assert_eq!(url.path(), "/api/v1/fairness/reveal/a%2Fb%3Fc%23d");
        assert_eq!(url.query(), Some("page=1"));
        assert_eq!(url.fragment(), None);

        let plain = ApiRequest::delete("fairness/commit").segment("s-1");
        assert_eq!(
            request_url(&base, &plain).unwrap().as_str(),
            "http://localhost:8000/api/v1/fairness/commit/s-1"
        );
    }

    #[tokio::test]
    async fn test_segment_reaches_server_intact() {
        let (_server, client, handle) = setup(3, Some("refresh-0")).await;

        let echoed = client
            .fetch::<serde_json::Value>(ApiRequest::get("echo").segment("seed/1?x#y"))
            .await
            .unwrap();
        assert_eq!(echoed["id"], "seed/1?x#y");

        handle.abort();
    }
}
