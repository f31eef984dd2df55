//! In-memory CRM for tests and offline runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use super::{AuthState, ConnectionReport, CrmApi, UpsertResult};
use crate::error::{ApiError, ApiErrorKind};
use crate::transform::SyncPayload;

#[derive(Default)]
struct Inner {
    /// (object, external id value) → (remote id, last payload)
    objects: BTreeMap<(String, String), (String, SyncPayload)>,
    calls: usize,
    failures: VecDeque<ApiError>,
    connection_failure: Option<(ApiErrorKind, String)>,
}

/// Keeps upserted objects keyed by external id.
#[derive(Default)]
pub struct InMemoryCrm {
    inner: Mutex<Inner>,
}

impl InMemoryCrm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next upsert with `err`. Queued failures are used in order.
    pub fn fail_next(&self, err: ApiError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failures.push_back(err);
        }
    }

    pub fn fail_connection(&self, kind: ApiErrorKind, message: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.connection_failure = Some((kind, message.into()));
        }
    }

    /// Number of upsert calls, including failed ones.
    pub fn calls(&self) -> usize {
        self.inner.lock().map(|i| i.calls).unwrap_or(0)
    }

    pub fn object(&self, object: &str, external_id_value: &str) -> Option<SyncPayload> {
        let inner = self.inner.lock().ok()?;
        inner
            .objects
            .get(&(object.to_string(), external_id_value.to_string()))
            .map(|(_, payload)| payload.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CrmApi for InMemoryCrm {
    async fn upsert(
        &self,
        object: &str,
        _external_id_field: &str,
        external_id_value: &str,
        payload: &SyncPayload,
    ) -> Result<UpsertResult, ApiError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ApiError::transient("in-memory CRM lock poisoned"))?;
        inner.calls += 1;
        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }

        let next_id = format!("{object}-{}", inner.objects.len() + 1);
        let key = (object.to_string(), external_id_value.to_string());
        match inner.objects.get_mut(&key) {
            Some((remote_id, stored)) => {
                *stored = payload.clone();
                Ok(UpsertResult {
                    remote_id: remote_id.clone(),
                    created: false,
                })
            }
            None => {
                inner.objects.insert(key, (next_id.clone(), payload.clone()));
                Ok(UpsertResult {
                    remote_id: next_id,
                    created: true,
                })
            }
        }
    }

    async fn test_connection(&self) -> ConnectionReport {
        match self.inner.lock().ok().and_then(|i| i.connection_failure.clone()) {
            Some((kind, message)) => ConnectionReport::failed(kind, message),
            None => ConnectionReport::ok("in-memory CRM"),
        }
    }

    fn auth_state(&self) -> AuthState {
        AuthState::Authenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_is_idempotent_per_external_id() {
        let crm = InMemoryCrm::new();
        let mut payload = SyncPayload::new();
        payload.insert("Name".into(), json!("v1"));

        let first = crm.upsert("Listing__c", "Ext__c", "7", &payload).await.unwrap();
        payload.insert("Name".into(), json!("v2"));
        let second = crm.upsert("Listing__c", "Ext__c", "7", &payload).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.remote_id, second.remote_id);
        assert_eq!(crm.len(), 1);
        assert_eq!(crm.object("Listing__c", "7").unwrap()["Name"], "v2");
    }

    #[tokio::test]
    async fn scripted_failures_are_returned_in_order() {
        let crm = InMemoryCrm::new();
        crm.fail_next(ApiError::transient("timeout"));
        let payload = SyncPayload::new();
        assert!(crm.upsert("Listing__c", "Ext__c", "1", &payload).await.is_err());
        assert!(crm.upsert("Listing__c", "Ext__c", "1", &payload).await.is_ok());
        assert_eq!(crm.calls(), 2);
    }
}
