//! Remote CRM API.
//!
//! [`CrmApi`] is the seam the orchestrator talks to. [`CrmClient`] is the HTTP
//! implementation; [`InMemoryCrm`] keeps objects in memory for tests and dry runs.

pub mod client;
pub mod memory;
pub mod oauth;

pub use client::{CrmClient, RetryPolicy};
pub use memory::InMemoryCrm;
pub use oauth::{AuthState, OAuthCredentials, OAuthToken, TokenManager};

use serde::Serialize;

use crate::error::{ApiError, ApiErrorKind};
use crate::transform::SyncPayload;

/// Result of a successful upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertResult {
    pub remote_id: String,
    pub created: bool,
}

/// Outcome of a connectivity test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub ok: bool,
    /// `authentication` for rejected credentials, `transient` for network trouble.
    pub kind: Option<ApiErrorKind>,
    pub message: String,
}

impl ConnectionReport {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            kind: None,
            message: message.into(),
        }
    }

    pub fn failed(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            kind: Some(kind),
            message: message.into(),
        }
    }

    pub fn is_network_problem(&self) -> bool {
        self.kind == Some(ApiErrorKind::Transient)
    }
}

/// Operations the sync pipeline needs from the CRM.
///
/// Implementations own authentication and retries: an error returned from
/// `upsert` is final for this attempt.
#[allow(async_fn_in_trait)]
pub trait CrmApi {
    /// Create or update the object whose `external_id_field` equals `external_id_value`.
    async fn upsert(
        &self,
        object: &str,
        external_id_field: &str,
        external_id_value: &str,
        payload: &SyncPayload,
    ) -> Result<UpsertResult, ApiError>;

    /// Force a fresh token exchange and report whether it worked.
    async fn test_connection(&self) -> ConnectionReport;

    fn auth_state(&self) -> AuthState;
}
