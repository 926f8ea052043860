//! List fetcher abstraction for bulk reference lookups.
//!
//! This module defines the [`ListFetcher`] trait that repositories use to issue bulk `list`
//! calls, so that resolution logic is testable without a backend.
//!
//! - [`HttpListFetcher`] POSTs the list parameters as JSON to a REST list endpoint.
//! - [`MockListFetcher`] answers from queued responses or from an in-memory dataset and records
//!   every call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use url::Url;

use crate::errors::{Error, Result};
use crate::types::{FilterOperator, ListParams, ListResponse, ReferenceId};

/// Issues bulk list calls for one resource type.
///
/// # Example
/// ```ignore
/// let fetcher = HttpListFetcher::new(url, Some(token), Duration::from_secs(30));
/// let params = ListParams {
///     query: ListQuery::default().with_filter(Filter::any_of("project_id", &ids)),
/// };
/// let response = fetcher.list(&params).await?;
/// ```
#[async_trait]
pub trait ListFetcher: Send + Sync {
    /// List raw resources matching `params`.
    ///
    /// # Errors
    /// Returns an error if the backend is unreachable, answers with a non-success status, or
    /// returns a body that is not a list response.
    async fn list(&self, params: &ListParams) -> Result<ListResponse<Value>>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// List fetcher that POSTs `{"query": ...}` to a REST list endpoint.
#[derive(Clone)]
pub struct HttpListFetcher {
    client: reqwest::Client,
    url: Url,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpListFetcher {
    pub fn new(url: Url, api_token: Option<String>, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), url, api_token, timeout)
    }

    /// Uses an existing client so several fetchers share one connection pool.
    pub fn with_client(client: reqwest::Client, url: Url, api_token: Option<String>, timeout: Duration) -> Self {
        Self {
            client,
            url,
            api_token,
            timeout,
        }
    }
}

impl std::fmt::Debug for HttpListFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpListFetcher")
            .field("url", &self.url.as_str())
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl ListFetcher for HttpListFetcher {
    #[tracing::instrument(skip(self, params), fields(url = %self.url, filters = params.query.filter.len()))]
    async fn list(&self, params: &ListParams) -> Result<ListResponse<Value>> {
        let mut req = self.client.post(self.url.clone()).timeout(self.timeout).json(params);

        // Only add Authorization header if a token is configured
        if let Some(token) = self.api_token.as_deref().filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|e| {
            tracing::error!(url = %self.url, error = %e, "List request failed");
            e
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(url = %self.url, status = status.as_u16(), "List endpoint returned an error status");
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let list: ListResponse<Value> = serde_json::from_slice(&bytes)?;

        tracing::debug!(url = %self.url, results = list.results.len(), "List request completed");

        Ok(list)
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

enum MockReply {
    Ready(Result<ListResponse<Value>>),
    Gated {
        reply: Result<ListResponse<Value>>,
        gate: oneshot::Receiver<()>,
    },
}

/// Mock list fetcher for testing.
///
/// Queued replies are returned in FIFO order. When the queue is empty the mock answers from its
/// dataset: records whose `id_field` matches an `in`/`eq` filter on that field, or every record
/// if the query has no such filter. With neither a queued reply nor a dataset, calls fail.
///
/// # Example
/// ```ignore
/// let mock = MockListFetcher::with_dataset("project_id", vec![json!({"project_id": "p-1", "name": "Alpha"})]);
/// mock.add_response(Err(Error::Status { status: 503, body: String::new() }));
/// ```
#[derive(Clone, Default)]
pub struct MockListFetcher {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    dataset: Arc<Mutex<Option<(String, Vec<Value>)>>>,
    calls: Arc<Mutex<Vec<ListParams>>>,
}

impl MockListFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock that answers from `records`, matched on `id_field`.
    pub fn with_dataset(id_field: impl Into<String>, records: Vec<Value>) -> Self {
        let mock = Self::new();
        *mock.dataset.lock() = Some((id_field.into(), records));
        mock
    }

    /// Replaces the dataset records (e.g. to simulate a renamed resource).
    pub fn set_records(&self, records: Vec<Value>) {
        if let Some((_, current)) = self.dataset.lock().as_mut() {
            *current = records;
        }
    }

    /// Queues a reply for the next call.
    pub fn add_response(&self, reply: Result<ListResponse<Value>>) {
        self.replies.lock().push_back(MockReply::Ready(reply));
    }

    /// Queues a reply that is only returned once the returned trigger fires (or is dropped).
    pub fn add_response_with_trigger(&self, reply: Result<ListResponse<Value>>) -> oneshot::Sender<()> {
        let (trigger, gate) = oneshot::channel();
        self.replies.lock().push_back(MockReply::Gated { reply, gate });
        trigger
    }

    pub fn get_calls(&self) -> Vec<ListParams> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// IDs that call `index` asked for through an `in` filter on `field`.
    pub fn requested_ids(&self, index: usize, field: &str) -> Option<Vec<ReferenceId>> {
        self.calls.lock().get(index).and_then(|params| id_filter(params, field))
    }

    fn answer_from_dataset(&self, params: &ListParams) -> Option<ListResponse<Value>> {
        let dataset = self.dataset.lock();
        let (id_field, records) = dataset.as_ref()?;

        let results: Vec<Value> = match id_filter(params, id_field) {
            Some(ids) => records
                .iter()
                .filter(|record| record.get(id_field).and_then(Value::as_str).is_some_and(|id| ids.iter().any(|i| i == id)))
                .cloned()
                .collect(),
            None => records.clone(),
        };
        let total_count = Some(results.len() as u64);
        Some(ListResponse { results, total_count })
    }
}

#[async_trait]
impl ListFetcher for MockListFetcher {
    async fn list(&self, params: &ListParams) -> Result<ListResponse<Value>> {
        self.calls.lock().push(params.clone());

        let next = self.replies.lock().pop_front();
        match next {
            Some(MockReply::Ready(reply)) => reply,
            Some(MockReply::Gated { reply, gate }) => {
                let _ = gate.await;
                reply
            }
            None => self
                .answer_from_dataset(params)
                .ok_or_else(|| Error::Other(anyhow::anyhow!("No mock response configured for list call"))),
        }
    }
}

/// Extracts the IDs constrained by an `in` or `eq` filter on `field`.
fn id_filter(params: &ListParams, field: &str) -> Option<Vec<ReferenceId>> {
    params.query.filter.iter().find(|f| f.k == field).and_then(|f| match (f.o, &f.v) {
        (FilterOperator::In, Value::Array(values)) => Some(values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
        (FilterOperator::Eq, Value::String(value)) => Some(vec![value.clone()]),
        _ => None,
    })
}
