//! OAuth2 token lifecycle for the CRM API.
//!
//! 1. Reuses the cached access token until 60 s before it expires
//! 2. Refreshes with the refresh-token grant when a refresh token is cached
//! 3. Falls back to the client-credentials grant when refresh fails
//! 4. Persists the token in the state store under `oauth_token`

use std::sync::{Arc, RwLock};

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::storage::{load_json, save_json, RemoteConfig, StateStore};

const TOKEN_KEY: &str = "oauth_token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>, // Unix timestamp
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthToken {
    /// Check if the token is expired (with 60s buffer).
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now().timestamp() > exp - 60,
            None => false,
        }
    }
}

/// Observable authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticating => "authenticating",
            AuthState::Authenticated => "authenticated",
            AuthState::Expired => "expired",
        }
    }
}

/// Client credentials for the token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

impl From<&RemoteConfig> for OAuthCredentials {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Process-wide token cache.
///
/// Locks are held only to swap values, never across a request, so two
/// callers may refresh concurrently; the last response wins.
pub struct TokenManager {
    http: Client,
    credentials: OAuthCredentials,
    store: Arc<dyn StateStore>,
    cache: RwLock<Option<OAuthToken>>,
    authenticating: RwLock<bool>,
}

impl TokenManager {
    /// Create a manager, loading any token persisted by a previous run.
    pub fn new(http: Client, credentials: OAuthCredentials, store: Arc<dyn StateStore>) -> Self {
        let cached = match load_json::<OAuthToken>(store.as_ref(), TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable cached token");
                None
            }
        };
        Self {
            http,
            credentials,
            store,
            cache: RwLock::new(cached),
            authenticating: RwLock::new(false),
        }
    }

    pub fn state(&self) -> AuthState {
        if self.authenticating.read().map(|g| *g).unwrap_or(false) {
            return AuthState::Authenticating;
        }
        match self.cached() {
            None => AuthState::Unauthenticated,
            Some(token) if token.is_expired() => AuthState::Expired,
            Some(_) => AuthState::Authenticated,
        }
    }

    pub fn cached(&self) -> Option<OAuthToken> {
        self.cache.read().ok().and_then(|g| g.clone())
    }

    /// A valid access token, acquiring a new one if needed.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        match self.cached() {
            Some(token) if !token.is_expired() => Ok(token.access_token),
            cached => {
                let refresh = cached.and_then(|t| t.refresh_token);
                Ok(self.acquire(refresh).await?.access_token)
            }
        }
    }

    /// Drop the cached token, locally and in the store.
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.cache.write() {
            *guard = None;
        }
        if let Err(e) = self.store.kv_delete(TOKEN_KEY) {
            tracing::warn!(error = %e, "failed to delete cached token");
        }
    }

    /// Discard any cached token and run a fresh client-credentials exchange.
    pub async fn reauthenticate(&self) -> Result<OAuthToken, AuthError> {
        self.invalidate();
        self.acquire(None).await
    }

    async fn acquire(&self, refresh: Option<String>) -> Result<OAuthToken, AuthError> {
        self.set_authenticating(true);
        let result = self.exchange(refresh).await;
        self.set_authenticating(false);

        let token = result?;
        self.store_token(&token);
        Ok(token)
    }

    async fn exchange(&self, refresh: Option<String>) -> Result<OAuthToken, AuthError> {
        if let Some(refresh) = refresh {
            match self.refresh_grant(&refresh).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    tracing::warn!(error = %e, "token refresh failed, falling back to client credentials");
                    self.invalidate();
                }
            }
        }
        self.client_credentials_grant().await
    }

    async fn refresh_grant(&self, refresh: &str) -> Result<OAuthToken, AuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", refresh),
        ];
        let mut token = self
            .post_form(&params)
            .await
            .map_err(|e| AuthError::TokenRefreshFailed(e.to_string()))?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh.to_string());
        }
        tracing::debug!("access token refreshed");
        Ok(token)
    }

    async fn client_credentials_grant(&self) -> Result<OAuthToken, AuthError> {
        if self.credentials.client_id.is_empty() || self.credentials.client_secret.is_empty() {
            return Err(AuthError::CredentialsNotConfigured);
        }
        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        if let Some(scope) = &self.credentials.scope {
            params.push(("scope", scope.as_str()));
        }
        let token = self.post_form(&params).await?;
        tracing::info!(token_url = %self.credentials.token_url, "obtained access token");
        Ok(token)
    }

    async fn post_form(&self, params: &[(&str, &str)]) -> Result<OAuthToken, AuthError> {
        let resp = self
            .http
            .post(&self.credentials.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(AuthError::TokenRejected {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::InvalidResponse("empty access_token".into()));
        }

        Ok(OAuthToken {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: parsed.expires_in.map(|ei| Utc::now().timestamp() + ei),
            token_type: parsed.token_type.unwrap_or_else(default_token_type),
        })
    }

    fn store_token(&self, token: &OAuthToken) {
        if let Ok(mut guard) = self.cache.write() {
            *guard = Some(token.clone());
        }
        if let Err(e) = save_json(self.store.as_ref(), TOKEN_KEY, token) {
            tracing::warn!(error = %e, "failed to persist access token");
        }
    }

    fn set_authenticating(&self, value: bool) {
        if let Ok(mut guard) = self.authenticating.write() {
            *guard = value;
        }
    }
}
