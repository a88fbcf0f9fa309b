//! Remote data source client.
//!
//! The core treats the remote store purely as `fetch(filter) -> records[]`;
//! this module provides the concrete HTTP implementation plus the boxed
//! fetch-function form the `DataAccessAdapter` consumes, so hosts can swap
//! in any other source (mock, websocket, embedded) without touching the
//! adapter.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::CoreConfig;
use crate::error::FetchError;

/// Filter describing one remote collection: a domain ("posts",
/// "map_spots"), an optional kind/category narrowing, and a result limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub domain: String,
    pub kind: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            kind: None,
            category: None,
            limit: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Stable cache key for this filter, shared by the adapter's cache
    /// lookups and its in-flight coalescing map.
    pub fn cache_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.domain,
            self.kind.as_deref().unwrap_or("all"),
            self.category.as_deref().unwrap_or("all"),
        )
    }
}

/// Sort records newest-first by their `created_at` field, the ordering the
/// remote interface promises. Records without the field sort last.
pub fn normalize_records(mut records: Vec<Value>) -> Vec<Value> {
    records.sort_by(|a, b| {
        let a_created = a.get("created_at").and_then(Value::as_str);
        let b_created = b.get("created_at").and_then(Value::as_str);
        b_created.cmp(&a_created)
    });
    records
}

/// The boxed async fetch function the adapter consumes.
pub type FetchFn<T> =
    Arc<dyn Fn(RecordFilter) -> BoxFuture<'static, Result<Vec<T>, FetchError>> + Send + Sync>;

/// HTTP client for the remote record store.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RemoteClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>, config: &CoreConfig) -> Result<Self, FetchError> {
        let timeout_ms = config.profile().fetch_timeout_ms.max(0) as u64;
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: None,
        })
    }

    /// Create a client with the given bearer token, sharing the connection
    /// pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(FetchError::from_status(status, &body))
        }
    }

    /// Fetch the records matching a filter, newest first.
    pub async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<Value>, FetchError> {
        let url = format!("{}/records", self.base_url);
        let mut query: Vec<(&str, String)> = vec![("domain", filter.domain.clone())];
        if let Some(ref kind) = filter.kind {
            query.push(("kind", kind.clone()));
        }
        if let Some(ref category) = filter.category {
            query.push(("category", category.clone()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }

        let mut request = self.client.get(&url).query(&query);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = Self::check_response(request.send().await?).await?;
        let records: Vec<Value> = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

        debug!(domain = %filter.domain, count = records.len(), "Fetched records");
        Ok(normalize_records(records))
    }

    /// The boxed fetch-function form of this client for one filter shape.
    pub fn fetch_fn(&self) -> FetchFn<Value> {
        let client = self.clone();
        Arc::new(move |filter: RecordFilter| {
            let client = client.clone();
            async move { client.fetch_records(&filter).await }.boxed()
        })
    }
}
