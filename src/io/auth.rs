//! Credential manager for the remote API
//!
//! `TokenManager::access_token` is the only way to obtain a bearer token.
//! Calls are serialized behind one async mutex so concurrent callers share a
//! single login or refresh. A token close to expiry is refreshed; a failed
//! refresh discards the token and falls back to a full login.

use crate::domain::types::{Envelope, LoginRequest, RefreshRequest, TokenData};
use crate::infra::config::ExternalApp;
use crate::infra::metrics::Metrics;
use crate::io::events::{EventBus, SOURCE_EXTERNAL_APP};
use crate::io::http_retry::{send_with_retry, RetryError, RetryPolicy};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

/// Refresh once the token is this close to expiry
pub const REFRESH_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    #[error("authentication cancelled")]
    Cancelled,
    #[error("rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no refresh token available")]
    NoRefreshToken,
}

impl From<RetryError> for AuthError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Cancelled => AuthError::Cancelled,
            RetryError::Timeout => AuthError::Transport("request timed out".to_string()),
            RetryError::Transport(e) => AuthError::Transport(e.to_string()),
        }
    }
}

/// Login and refresh calls against the remote API
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self) -> Result<TokenData, AuthError>;
    async fn refresh(&self, refresh_token: &str) -> Result<TokenData, AuthError>;
}

/// Validate a login/refresh envelope and pull out its token
pub fn parse_token_envelope(body: &str) -> Result<TokenData, AuthError> {
    let envelope: Envelope<TokenData> =
        serde_json::from_str(body).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
    let message = envelope.message.unwrap_or_default();

    if !envelope.is_successful {
        return Err(AuthError::InvalidResponse(if message.is_empty() {
            "request was not successful".to_string()
        } else {
            message
        }));
    }

    match envelope.data {
        Some(data) if !data.access_token.trim().is_empty() => Ok(data),
        _ => Err(AuthError::InvalidResponse(if message.is_empty() {
            "missing access token".to_string()
        } else {
            message
        })),
    }
}

pub struct HttpAuthApi {
    client: reqwest::Client,
    login_url: String,
    refresh_url: String,
    credentials: LoginRequest,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl HttpAuthApi {
    pub fn new(client: reqwest::Client, app: &ExternalApp, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            client,
            login_url: app.login_url(),
            refresh_url: app.refresh_url(),
            credentials: LoginRequest { client_id: app.client_id.clone(), secret: app.secret.clone() },
            retry: RetryPolicy::from(&app.http),
            shutdown,
        }
    }

    async fn post_token<B>(&self, url: &str, body: &B) -> Result<TokenData, AuthError>
    where
        B: Serialize + Sync,
    {
        let response =
            send_with_retry(self.retry, self.shutdown.clone(), || self.client.post(url).json(body).send()).await?;

        let status = response.status();
        let text = response.text().await.map_err(|e| AuthError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Rejected { status: status.as_u16(), body: text });
        }
        parse_token_envelope(&text)
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self) -> Result<TokenData, AuthError> {
        self.post_token(&self.login_url, &self.credentials).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenData, AuthError> {
        let body = RefreshRequest { refresh_token: refresh_token.to_string() };
        self.post_token(&self.refresh_url, &body).await
    }
}

#[derive(Debug, Clone)]
struct Token {
    access: String,
    refresh: Option<String>,
    expires_at: Instant,
}

impl Token {
    fn from_data(data: TokenData, previous_refresh: Option<String>) -> Self {
        let ttl = Duration::from_secs(data.expire_in_seconds.max(0) as u64);
        let refresh = data.refresh_token.filter(|r| !r.trim().is_empty()).or(previous_refresh);
        Self { access: data.access_token, refresh, expires_at: Instant::now() + ttl }
    }
}

#[derive(Debug, Default)]
enum AuthState {
    #[default]
    Unauthenticated,
    Authenticated(Token),
}

enum Next {
    Login,
    Refresh(Token),
}

pub struct TokenManager {
    api: Arc<dyn AuthApi>,
    state: Mutex<AuthState>,
    refresh_threshold: Duration,
    metrics: Arc<Metrics>,
    events: EventBus,
}

impl TokenManager {
    pub fn new(api: Arc<dyn AuthApi>, metrics: Arc<Metrics>, events: EventBus) -> Self {
        Self { api, state: Mutex::new(AuthState::default()), refresh_threshold: REFRESH_THRESHOLD, metrics, events }
    }

    /// Current access token, logging in or refreshing first when needed
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let next = match &*state {
            AuthState::Authenticated(token) if now >= token.expires_at => Next::Login,
            AuthState::Authenticated(token) if now + self.refresh_threshold >= token.expires_at => {
                Next::Refresh(token.clone())
            }
            AuthState::Authenticated(token) => return Ok(token.access.clone()),
            AuthState::Unauthenticated => Next::Login,
        };

        if let Next::Refresh(current) = next {
            match self.refresh(current).await {
                Ok(token) => {
                    let access = token.access.clone();
                    *state = AuthState::Authenticated(token);
                    return Ok(access);
                }
                Err(AuthError::Cancelled) => return Err(AuthError::Cancelled),
                Err(e) => {
                    warn!(error = %e, "auth_refresh_failed");
                    self.events.log(SOURCE_EXTERNAL_APP, format!("Token refresh failed: {e}"));
                }
            }
        }

        *state = AuthState::Unauthenticated;
        let token = self.login().await?;
        let access = token.access.clone();
        *state = AuthState::Authenticated(token);
        Ok(access)
    }

    /// Forget the held token
    pub async fn clear(&self) {
        *self.state.lock().await = AuthState::Unauthenticated;
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(&*self.state.lock().await, AuthState::Authenticated(t) if Instant::now() < t.expires_at)
    }

    async fn login(&self) -> Result<Token, AuthError> {
        self.events.status(SOURCE_EXTERNAL_APP, "Authenticating");
        self.events.log(SOURCE_EXTERNAL_APP, "Logging in to external application...");

        match self.api.login().await {
            Ok(data) => {
                self.metrics.record_auth_login();
                info!(expires_in = %data.expire_in_seconds, "auth_login_succeeded");
                self.events.status(SOURCE_EXTERNAL_APP, "Authenticated");
                self.events.log(SOURCE_EXTERNAL_APP, "Login successful.");
                Ok(Token::from_data(data, None))
            }
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(e) => {
                self.metrics.record_auth_failure();
                warn!(error = %e, "auth_login_failed");
                self.events.status(SOURCE_EXTERNAL_APP, "Authentication failed");
                self.events.log(SOURCE_EXTERNAL_APP, format!("Login failed: {e}"));
                Err(e)
            }
        }
    }

    async fn refresh(&self, current: Token) -> Result<Token, AuthError> {
        let Some(refresh_token) = current.refresh.filter(|r| !r.trim().is_empty()) else {
            return Err(AuthError::NoRefreshToken);
        };

        self.events.status(SOURCE_EXTERNAL_APP, "Refreshing token");
        self.events.log(SOURCE_EXTERNAL_APP, "Refreshing token...");

        match self.api.refresh(&refresh_token).await {
            Ok(data) => {
                self.metrics.record_auth_refresh();
                info!(expires_in = %data.expire_in_seconds, "auth_token_refreshed");
                self.events.status(SOURCE_EXTERNAL_APP, "Token refreshed");
                self.events.log(SOURCE_EXTERNAL_APP, "Token refreshed successfully.");
                Ok(Token::from_data(data, Some(refresh_token)))
            }
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(e) => {
                self.metrics.record_auth_failure();
                self.events.status(SOURCE_EXTERNAL_APP, "Token refresh failed");
                Err(e)
            }
        }
    }
}
