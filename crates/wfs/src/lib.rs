//! Tavola WFS plumbing (Milestone 0) – DescribeFeatureType and paged
//! GetFeature requests with a hard per-request timeout.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Deserialize;
use tavola_core::{Feature, FetchResult, Filter, FilterFormat, PaginationOptions, SortOptions, SortOrder};
use tracing::{debug, info, warn};

pub const WFS_VERSION: &str = "1.1.0";
pub const JSON_OUTPUT_FORMAT: &str = "application/json";

/// Failures are values: the coordinator folds them into grid state instead of
/// letting them tear down the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum WfsError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("service exception: {0}")]
    Service(String),
}

impl From<reqwest::Error> for WfsError {
    fn from(e: reqwest::Error) -> Self {
        WfsError::Transport(e.to_string())
    }
}

/// Stateless request issuer: one network call per method invocation.
#[derive(Debug, Clone)]
pub struct WfsClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl WfsClient {
    pub fn new(timeout: Duration) -> Result<Self, WfsError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, timeout })
    }

    /// Fetch the raw DescribeFeatureType JSON for a feature type.
    pub async fn describe_feature_type(
        &self,
        url: &str,
        type_name: &str,
    ) -> Result<serde_json::Value, WfsError> {
        let t0 = Instant::now();
        let params = describe_params(type_name);
        let fut = self.http.get(url).query(&params).send();
        let resp = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| self.timed_out("describe"))??;
        let body = resp.text().await?;
        let took = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("wfs_describe_ms", took);
        let value = decode_json(&body)?;
        info!(type_name = %type_name, took_ms = %(took as u64), "wfs: describe ok");
        Ok(value)
    }

    /// Issue one paged GetFeature request. CQL filters ride as a query
    /// parameter; OGC XML filters are posted as the request body.
    pub async fn get_features(
        &self,
        url: &str,
        type_name: &str,
        filter: Option<&Filter>,
        pagination: PaginationOptions,
        sort: Option<&SortOptions>,
        properties: Option<&[String]>,
    ) -> Result<FetchResult, WfsError> {
        let t0 = Instant::now();
        let params = feature_params(type_name, filter, pagination, sort, properties);
        let req = match filter {
            Some(f) if f.format == FilterFormat::Ogc => self
                .http
                .post(url)
                .query(&params)
                .header("content-type", "text/xml")
                .body(f.body.clone()),
            _ => self.http.get(url).query(&params),
        };
        counter!("wfs_get_features_total", 1u64);
        let resp = tokio::time::timeout(self.timeout, req.send())
            .await
            .map_err(|_| self.timed_out("get_features"))??;
        let body = resp.text().await?;
        let took = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("wfs_get_features_ms", took);
        let result = decode_feature_collection(&body)?;
        debug!(
            type_name = %type_name,
            start = pagination.start_index,
            limit = pagination.max_features,
            rows = result.features.len(),
            total = ?result.total_features,
            took_ms = %(took as u64),
            "wfs: page fetched"
        );
        Ok(result)
    }

    fn timed_out(&self, what: &str) -> WfsError {
        counter!("wfs_timeouts_total", 1u64);
        warn!(what, timeout_ms = self.timeout.as_millis() as u64, "wfs: request timed out");
        WfsError::Timeout(self.timeout.as_millis() as u64)
    }
}

fn describe_params(type_name: &str) -> Vec<(&'static str, String)> {
    vec![
        ("service", "WFS".to_string()),
        ("version", WFS_VERSION.to_string()),
        ("request", "DescribeFeatureType".to_string()),
        ("typeName", type_name.to_string()),
        ("outputFormat", JSON_OUTPUT_FORMAT.to_string()),
    ]
}

fn feature_params(
    type_name: &str,
    filter: Option<&Filter>,
    pagination: PaginationOptions,
    sort: Option<&SortOptions>,
    properties: Option<&[String]>,
) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("service", "WFS".to_string()),
        ("version", WFS_VERSION.to_string()),
        ("request", "GetFeature".to_string()),
        ("typeName", type_name.to_string()),
        ("outputFormat", JSON_OUTPUT_FORMAT.to_string()),
        ("resultType", "results".to_string()),
        ("startIndex", pagination.start_index.to_string()),
        ("maxFeatures", pagination.max_features.to_string()),
    ];
    if let Some(props) = properties {
        if !props.is_empty() {
            params.push(("propertyName", props.join(",")));
        }
    }
    if let Some(s) = sort {
        params.push(("sortBy", sort_param(s)));
    }
    if let Some(f) = filter {
        if f.format == FilterFormat::Cql {
            params.push(("cql_filter", f.body.clone()));
        }
    }
    params
}

fn sort_param(sort: &SortOptions) -> String {
    let dir = match sort.order {
        SortOrder::Ascending => "A",
        SortOrder::Descending => "D",
    };
    format!("{} {}", sort.sort_by, dir)
}

fn decode_json(body: &str) -> Result<serde_json::Value, WfsError> {
    match serde_json::from_str(body) {
        Ok(v) => Ok(v),
        Err(e) => Err(classify_decode_failure(body, e)),
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollectionReply {
    #[serde(default)]
    features: Vec<Feature>,
    #[serde(rename = "totalFeatures")]
    total_features: Option<u64>,
    // WFS 2.0 servers report the total under numberMatched instead.
    #[serde(rename = "numberMatched")]
    number_matched: Option<u64>,
}

/// Decode a GetFeature reply body, classifying service exception reports.
pub fn decode_feature_collection(body: &str) -> Result<FetchResult, WfsError> {
    match serde_json::from_str::<FeatureCollectionReply>(body) {
        Ok(reply) => Ok(FetchResult {
            features: reply.features,
            total_features: reply.total_features.or(reply.number_matched),
        }),
        Err(e) => Err(classify_decode_failure(body, e)),
    }
}

/// Servers answer malformed or unsupported requests with a 200 carrying an
/// XML exception report; surface those as service errors, not decode noise.
fn classify_decode_failure(body: &str, e: serde_json::Error) -> WfsError {
    if body.contains("ExceptionReport") || body.contains("ServiceException") {
        let snippet: String = body.chars().take(240).collect();
        WfsError::Service(snippet)
    } else {
        WfsError::Decode(e.to_string())
    }
}
