//! HTTP client for the CRM object API.
//!
//! Upserts are addressed by external id:
//! `PATCH {base_url}/objects/{object}/{external_id_field}/{external_id_value}`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::oauth::{AuthState, OAuthCredentials, TokenManager};
use super::{ConnectionReport, CrmApi, UpsertResult};
use crate::error::{ApiError, ApiErrorKind};
use crate::storage::{RemoteConfig, StateStore};
use crate::transform::SyncPayload;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

impl From<&RemoteConfig> for RetryPolicy {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.backoff_base_ms,
            max_delay_ms: config.backoff_max_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    id: String,
    #[serde(default)]
    created: Option<bool>,
}

/// CRM API client with OAuth and retry handling.
pub struct CrmClient {
    http: Client,
    base_url: String,
    tokens: TokenManager,
    retry: RetryPolicy,
}

impl CrmClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &RemoteConfig, store: Arc<dyn StateStore>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ApiError::permanent(format!("failed to build HTTP client: {e}")))?;
        let tokens = TokenManager::new(http.clone(), OAuthCredentials::from(config), store);
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens,
            retry: RetryPolicy::from(config),
        })
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn upsert_url(&self, object: &str, external_id_field: &str, external_id_value: &str) -> String {
        format!(
            "{}/objects/{}/{}/{}",
            self.base_url,
            urlencoding::encode(object),
            urlencoding::encode(external_id_field),
            urlencoding::encode(external_id_value),
        )
    }

    async fn send_upsert(
        &self,
        url: &str,
        token: &str,
        payload: &SyncPayload,
    ) -> Result<UpsertResult, ApiError> {
        let resp = self
            .http
            .patch(url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        let parsed: UpsertResponse = serde_json::from_str(&body).map_err(|e| {
            ApiError::permanent(format!("unexpected upsert response: {e}"))
                .with_status(status.as_u16())
                .with_body(body.clone())
        })?;
        Ok(UpsertResult {
            created: parsed.created.unwrap_or(status == StatusCode::CREATED),
            remote_id: parsed.id,
        })
    }
}

impl CrmApi for CrmClient {
    async fn upsert(
        &self,
        object: &str,
        external_id_field: &str,
        external_id_value: &str,
        payload: &SyncPayload,
    ) -> Result<UpsertResult, ApiError> {
        let url = self.upsert_url(object, external_id_field, external_id_value);
        let mut attempt = 1;
        let mut reauthenticated = false;

        loop {
            let result = match self.tokens.access_token().await {
                Ok(token) => self.send_upsert(&url, &token, payload).await,
                Err(e) => Err(ApiError::from(e)),
            };

            let err = match result {
                Ok(result) => {
                    tracing::debug!(object, external_id_value, created = result.created, attempt, "upsert succeeded");
                    return Ok(result);
                }
                Err(err) => err,
            };

            if err.status == Some(401) {
                if reauthenticated {
                    return Err(ApiError {
                        kind: ApiErrorKind::Authentication,
                        message: "access token rejected after re-authentication".into(),
                        ..err
                    });
                }
                tracing::info!(object, external_id_value, "access token rejected, re-authenticating");
                self.tokens.invalidate();
                reauthenticated = true;
                continue;
            }

            if err.is_retryable() && attempt < self.retry.max_attempts {
                let delay = self.retry.delay_for(attempt);
                tracing::warn!(
                    object,
                    external_id_value,
                    attempt,
                    status = err.status,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient upsert failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Err(err);
        }
    }

    async fn test_connection(&self) -> ConnectionReport {
        match self.tokens.reauthenticate().await {
            Ok(_) => ConnectionReport::ok("obtained a fresh access token"),
            Err(e) => {
                let kind = if e.is_transient() {
                    ApiErrorKind::Transient
                } else {
                    ApiErrorKind::Authentication
                };
                ConnectionReport::failed(kind, e.to_string())
            }
        }
    }

    fn auth_state(&self) -> AuthState {
        self.tokens.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{save_json, MemoryStore};
    use crate::remote::oauth::OAuthToken;
    use mockito::Matcher;
    use serde_json::json;

    fn config(server: &mockito::Server) -> RemoteConfig {
        RemoteConfig {
            base_url: server.url(),
            token_url: format!("{}/oauth/token", server.url()),
            client_id: "client".into(),
            client_secret: "secret".into(),
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..RemoteConfig::default()
        }
    }

    fn store_with_token(token: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        save_json(
            store.as_ref(),
            "oauth_token",
            &OAuthToken {
                access_token: token.into(),
                refresh_token: None,
                expires_at: None,
                token_type: "Bearer".into(),
            },
        )
        .unwrap();
        store
    }

    fn payload() -> SyncPayload {
        let mut p = SyncPayload::new();
        p.insert("Name".into(), json!("Gravel"));
        p
    }

    const PATH: &str = "/objects/Listing__c/CMS_Record_Id__c/42";

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn upsert_sends_bearer_and_parses_created() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", PATH)
            .match_header("authorization", "Bearer cached")
            .match_body(Matcher::Json(json!({"Name": "Gravel"})))
            .with_status(201)
            .with_body(r#"{"id":"a0B1"}"#)
            .create_async()
            .await;

        let client = CrmClient::new(&config(&server), store_with_token("cached")).unwrap();
        let result = client
            .upsert("Listing__c", "CMS_Record_Id__c", "42", &payload())
            .await
            .unwrap();
        assert_eq!(result.remote_id, "a0B1");
        assert!(result.created);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorized_triggers_single_reauth_and_retry() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let rejected = server
            .mock("PATCH", PATH)
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("PATCH", PATH)
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_body(r#"{"id":"a0B1","created":false}"#)
            .expect(1)
            .create_async()
            .await;

        let client = CrmClient::new(&config(&server), store_with_token("stale")).unwrap();
        let result = client
            .upsert("Listing__c", "CMS_Record_Id__c", "42", &payload())
            .await
            .unwrap();
        assert!(!result.created);
        token.assert_async().await;
        rejected.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn second_unauthorized_is_authentication_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"fresh"}"#)
            .create_async()
            .await;
        let upsert = server
            .mock("PATCH", PATH)
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let client = CrmClient::new(&config(&server), store_with_token("stale")).unwrap();
        let err = client
            .upsert("Listing__c", "CMS_Record_Id__c", "42", &payload())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Authentication);
        assert_eq!(err.status, Some(401));
        upsert.assert_async().await;
    }

    #[tokio::test]
    async fn transient_failures_exhaust_attempts() {
        let mut server = mockito::Server::new_async().await;
        let upsert = server
            .mock("PATCH", PATH)
            .with_status(503)
            .with_body("maintenance")
            .expect(3)
            .create_async()
            .await;

        let client = CrmClient::new(&config(&server), store_with_token("cached")).unwrap();
        let err = client
            .upsert("Listing__c", "CMS_Record_Id__c", "42", &payload())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Transient);
        assert_eq!(err.body.as_deref(), Some("maintenance"));
        upsert.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_are_permanent_and_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let upsert = server
            .mock("PATCH", PATH)
            .with_status(400)
            .with_body(r#"[{"message":"Quantity__c: bad value"}]"#)
            .expect(1)
            .create_async()
            .await;

        let client = CrmClient::new(&config(&server), store_with_token("cached")).unwrap();
        let err = client
            .upsert("Listing__c", "CMS_Record_Id__c", "42", &payload())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Permanent);
        assert!(err.body.unwrap().contains("Quantity__c"));
        upsert.assert_async().await;
    }

    #[tokio::test]
    async fn external_id_is_url_encoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/objects/Listing__c/Ext%20Id/a%2Fb")
            .with_status(200)
            .with_body(r#"{"id":"x"}"#)
            .create_async()
            .await;

        let client = CrmClient::new(&config(&server), store_with_token("cached")).unwrap();
        client
            .upsert("Listing__c", "Ext Id", "a/b", &payload())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn connection_test_distinguishes_auth_from_network() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .with_body("invalid_client")
            .create_async()
            .await;
        let client = CrmClient::new(&config(&server), Arc::new(MemoryStore::new())).unwrap();
        let report = client.test_connection().await;
        assert!(!report.ok);
        assert_eq!(report.kind, Some(ApiErrorKind::Authentication));

        let mut unreachable = config(&server);
        unreachable.token_url = "http://127.0.0.1:9/oauth/token".into();
        let client = CrmClient::new(&unreachable, Arc::new(MemoryStore::new())).unwrap();
        let report = client.test_connection().await;
        assert!(!report.ok);
        assert_eq!(report.kind, Some(ApiErrorKind::Transient));
    }

    #[tokio::test]
    async fn token_endpoint_outage_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/oauth/token")
            .with_status(503)
            .with_body("maintenance")
            .expect(4)
            .create_async()
            .await;
        let upsert = server.mock("PATCH", PATH).expect(0).create_async().await;

        let client = CrmClient::new(&config(&server), Arc::new(MemoryStore::new())).unwrap();
        let err = client
            .upsert("Listing__c", "CMS_Record_Id__c", "42", &payload())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Transient);
        assert_eq!(err.status, Some(503));

        let report = client.test_connection().await;
        assert!(!report.ok);
        assert_eq!(report.kind, Some(ApiErrorKind::Transient));

        token.assert_async().await;
        upsert.assert_async().await;
    }
}
