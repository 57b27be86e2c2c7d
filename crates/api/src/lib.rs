//! Tavola public API façade (in-process).
//!
//! Defines the `FeatureSource` seam frontends depend on, its WFS-backed and
//! mock implementations, and the per-grid coordinator that drives paged
//! fetches with switch-latest concurrency.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tavola_core::{DataSource, Feature, FetchResult, Filter, PaginationOptions, SortOptions};
use tavola_schema::{parse_describe, FeatureTypeSchema, SchemaError};
use tavola_wfs::{WfsClient, WfsError};
use tracing::info;

mod coordinator;

pub use coordinator::{GridCoordinator, GridSnapshot};
pub use tavola_core::GridConfig;
pub use tavola_schema::FeatureTypeSchema as Schema;

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("timeout after {0} ms")]
    Timeout(u64),
    #[error("service: {0}")]
    Service(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<WfsError> for ApiError {
    fn from(e: WfsError) -> Self {
        match e {
            WfsError::Timeout(ms) => ApiError::Timeout(ms),
            WfsError::Service(s) => ApiError::Service(s),
            WfsError::Decode(s) => ApiError::Decode(s),
            WfsError::Transport(s) => ApiError::Internal(s),
        }
    }
}

impl From<SchemaError> for ApiError {
    fn from(e: SchemaError) -> Self {
        ApiError::Decode(e.to_string())
    }
}

/// The paged-feature seam: one schema describe, one page fetch. Constructed
/// once and injected into each grid coordinator.
#[async_trait::async_trait]
pub trait FeatureSource: Send + Sync {
    /// Fetch the feature-type schema for a data source.
    async fn describe(&self, source: &DataSource) -> ApiResult<FeatureTypeSchema>;

    /// Fetch one page window of features.
    async fn fetch_page(
        &self,
        source: &DataSource,
        filter: Option<&Filter>,
        pagination: PaginationOptions,
        sort: Option<&SortOptions>,
    ) -> ApiResult<FetchResult>;
}

// ----------------- WFS-backed implementation -----------------

/// `FeatureSource` speaking WFS over HTTP.
pub struct WfsSource {
    client: WfsClient,
}

impl WfsSource {
    pub fn new(config: &GridConfig) -> ApiResult<Self> {
        let client =
            WfsClient::new(config.request_timeout()).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_timeout(timeout: Duration) -> ApiResult<Self> {
        let client = WfsClient::new(timeout).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl FeatureSource for WfsSource {
    async fn describe(&self, source: &DataSource) -> ApiResult<FeatureTypeSchema> {
        let t0 = std::time::Instant::now();
        info!(source = %source.identity(), "api: describe start");
        let raw = self
            .client
            .describe_feature_type(source.derived_url(), &source.name)
            .await?;
        let schema = parse_describe(&raw)?;
        info!(
            attrs = schema.attributes.len(),
            took_ms = %t0.elapsed().as_millis(),
            "api: describe ok"
        );
        Ok(schema)
    }

    async fn fetch_page(
        &self,
        source: &DataSource,
        filter: Option<&Filter>,
        pagination: PaginationOptions,
        sort: Option<&SortOptions>,
    ) -> ApiResult<FetchResult> {
        let props = source.properties.as_ref().map(|p| p.as_slice());
        let result = self
            .client
            .get_features(
                source.derived_url(),
                &source.name,
                filter,
                pagination,
                sort,
                props,
            )
            .await?;
        Ok(result)
    }
}

// ----------------- Mock implementation -----------------

/// In-memory mock source for tests: synthesizes `total` rows, optionally
/// sleeps per call, records every pagination window it was asked for, and
/// can inject queued errors.
pub struct MockSource {
    pub schema: FeatureTypeSchema,
    pub total: u64,
    default_delay: Duration,
    fetch_delays: Mutex<Vec<Duration>>,
    fetch_errors: Mutex<Vec<ApiError>>,
    describe_errors: Mutex<Vec<ApiError>>,
    describe_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    fetch_log: Mutex<Vec<PaginationOptions>>,
}

impl MockSource {
    pub fn new(schema: FeatureTypeSchema, total: u64) -> Self {
        Self {
            schema,
            total,
            default_delay: Duration::ZERO,
            fetch_delays: Mutex::new(Vec::new()),
            fetch_errors: Mutex::new(Vec::new()),
            describe_errors: Mutex::new(Vec::new()),
            describe_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            fetch_log: Mutex::new(Vec::new()),
        }
    }

    /// Schema with a couple of scalar attributes and a geometry, enough for
    /// coordinator tests.
    pub fn default_schema() -> FeatureTypeSchema {
        parse_describe(&serde_json::json!({
            "featureTypes": [{
                "typeName": "mock",
                "properties": [
                    {"name": "geom", "type": "gml:Point"},
                    {"name": "NAME", "type": "xsd:string"},
                    {"name": "VALUE", "type": "xsd:int"}
                ]
            }]
        }))
        .expect("static fixture")
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Queue per-call fetch delays, consumed in order before the default.
    pub fn queue_fetch_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        let mut q = self.fetch_delays.lock().unwrap();
        q.extend(delays);
    }

    /// Queue fetch errors, consumed in call order before any data is served.
    pub fn queue_fetch_errors(&self, errors: impl IntoIterator<Item = ApiError>) {
        let mut q = self.fetch_errors.lock().unwrap();
        q.extend(errors);
    }

    /// Queue describe errors, consumed in call order.
    pub fn queue_describe_errors(&self, errors: impl IntoIterator<Item = ApiError>) {
        let mut q = self.describe_errors.lock().unwrap();
        q.extend(errors);
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_log(&self) -> Vec<PaginationOptions> {
        self.fetch_log.lock().unwrap().clone()
    }

    fn row(&self, n: usize) -> Feature {
        let mut properties = serde_json::Map::new();
        properties.insert("NAME".into(), serde_json::json!(format!("row {n}")));
        properties.insert("VALUE".into(), serde_json::json!(n));
        Feature { id: Some(format!("mock.{n}")), geometry: None, properties }
    }
}

#[async_trait::async_trait]
impl FeatureSource for MockSource {
    async fn describe(&self, _source: &DataSource) -> ApiResult<FeatureTypeSchema> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = {
            let mut q = self.describe_errors.lock().unwrap();
            if q.is_empty() { None } else { Some(q.remove(0)) }
        } {
            return Err(err);
        }
        Ok(self.schema.clone())
    }

    async fn fetch_page(
        &self,
        _source: &DataSource,
        _filter: Option<&Filter>,
        pagination: PaginationOptions,
        _sort: Option<&SortOptions>,
    ) -> ApiResult<FetchResult> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_log.lock().unwrap().push(pagination);
        let delay = {
            let mut q = self.fetch_delays.lock().unwrap();
            if q.is_empty() { self.default_delay } else { q.remove(0) }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = {
            let mut q = self.fetch_errors.lock().unwrap();
            if q.is_empty() { None } else { Some(q.remove(0)) }
        } {
            return Err(err);
        }
        let start = pagination.start_index.min(self.total as usize);
        let end = (pagination.start_index + pagination.max_features).min(self.total as usize);
        Ok(FetchResult {
            features: (start..end).map(|n| self.row(n)).collect(),
            total_features: Some(self.total),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_serves_windows_and_counts_calls() {
        let mock = MockSource::new(MockSource::default_schema(), 45);
        let ds = DataSource::new("http://mock", "mock");
        let page = mock
            .fetch_page(&ds, None, PaginationOptions::new(40, 20), None)
            .await
            .unwrap();
        assert_eq!(page.features.len(), 5);
        assert_eq!(page.total_features, Some(45));
        assert_eq!(mock.fetch_calls(), 1);
        assert_eq!(mock.fetch_log(), vec![PaginationOptions::new(40, 20)]);
    }

    #[tokio::test]
    async fn mock_injects_queued_errors() {
        let mock = MockSource::new(MockSource::default_schema(), 10);
        mock.queue_fetch_errors([ApiError::Timeout(15_000)]);
        let ds = DataSource::new("http://mock", "mock");
        let err = mock
            .fetch_page(&ds, None, PaginationOptions::new(0, 10), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Timeout(15_000)));
        // Queue drained: next call succeeds.
        assert!(mock.fetch_page(&ds, None, PaginationOptions::new(0, 10), None).await.is_ok());
    }
}
