//! Tavola core types (Milestone 0)

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;

pub use config::GridConfig;

/// Property-selection list attached to a data source. Most sources select a
/// handful of attributes, so keep them inline.
pub type PropertyList = SmallVec<[String; 8]>;

/// A remote feature collection endpoint plus selection parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataSource {
    /// Plain service URL (lowest priority).
    pub url: String,
    /// Dedicated search-service URL, when the layer exposes one.
    pub search_url: Option<String>,
    /// Processing-service URL (highest priority).
    pub process_url: Option<String>,
    /// Logical feature-type name, e.g. "topp:states".
    pub name: String,
    /// Attributes to request; `None` means all.
    pub properties: Option<PropertyList>,
}

impl DataSource {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            search_url: None,
            process_url: None,
            name: name.into(),
            properties: None,
        }
    }

    /// Effective endpoint: process URL wins over search URL wins over plain.
    pub fn derived_url(&self) -> &str {
        self.process_url
            .as_deref()
            .or(self.search_url.as_deref())
            .unwrap_or(&self.url)
    }

    /// Cache identity: derived URL + feature-type name.
    pub fn identity(&self) -> String {
        format!("{}#{}", self.derived_url(), self.name)
    }
}

/// Opaque query predicate, passed through to the service unchanged.
///
/// Filters are shared as `Arc<Filter>` and compared by POINTER identity (see
/// [`same_filter`]): two structurally identical filters with different
/// allocations count as different and force a refetch. Intentional; do not
/// replace with structural equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub format: FilterFormat,
    pub body: String,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilterFormat {
    /// CQL text, sent as a `cql_filter` query parameter.
    Cql,
    /// OGC Filter Encoding XML, sent as the request body.
    Ogc,
}

pub type FilterRef = Arc<Filter>;

/// Identity comparison for optional filters.
pub fn same_filter(a: Option<&FilterRef>, b: Option<&FilterRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

/// Inclusive page window requested by a virtualized grid.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRange {
    pub start_page: usize,
    pub end_page: usize,
}

impl PageRange {
    pub fn new(start_page: usize, end_page: usize) -> Self {
        debug_assert!(start_page <= end_page);
        Self { start_page, end_page }
    }

    pub fn single(page: usize) -> Self {
        Self { start_page: page, end_page: page }
    }

    /// Page window covering the visible rows `first_row..first_row + visible_rows`
    /// of a virtualized grid.
    pub fn from_rows(first_row: usize, visible_rows: usize, page_size: usize) -> Self {
        let last_row = first_row + visible_rows.saturating_sub(1);
        Self {
            start_page: first_row / page_size,
            end_page: last_row / page_size,
        }
    }

    pub fn pages(&self) -> usize {
        self.end_page - self.start_page + 1
    }

    pub fn contains(&self, page: usize) -> bool {
        page >= self.start_page && page <= self.end_page
    }

    /// Page halfway through the range, used by eviction distance.
    pub fn mid_page(&self) -> usize {
        self.start_page + (self.end_page - self.start_page) / 2
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<usize> {
        self.start_page..=self.end_page
    }
}

/// Network-level offset/limit derived from a [`PageRange`].
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PaginationOptions {
    pub start_index: usize,
    pub max_features: usize,
}

impl PaginationOptions {
    pub fn new(start_index: usize, max_features: usize) -> Self {
        Self { start_index, max_features }
    }

    /// Zero-size window: nothing to fetch.
    pub fn is_empty(&self) -> bool {
        self.max_features == 0
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortOptions {
    pub sort_by: String,
    pub order: SortOrder,
}

impl SortOptions {
    /// Default sort used when the caller sets none: ascending on the given
    /// attribute. Some WFS servers refuse paged queries without a sort.
    pub fn default_on(attribute: impl Into<String>) -> Self {
        Self { sort_by: attribute.into(), order: SortOrder::Ascending }
    }
}

/// A single vector feature: service id, optional GeoJSON geometry, flat
/// property map.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Feature {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub geometry: Option<serde_json::Value>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// One GetFeature reply page.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FetchResult {
    pub features: Vec<Feature>,
    /// Total matching features, when the service reports it.
    pub total_features: Option<u64>,
}

pub mod prelude {
    pub use super::{
        same_filter, DataSource, Feature, FetchResult, Filter, FilterFormat, FilterRef,
        GridConfig, PageRange, PaginationOptions, SortOptions, SortOrder,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_url_priority() {
        let mut ds = DataSource::new("http://example.com/wfs", "topp:states");
        assert_eq!(ds.derived_url(), "http://example.com/wfs");
        ds.search_url = Some("http://example.com/search".into());
        assert_eq!(ds.derived_url(), "http://example.com/search");
        ds.process_url = Some("http://example.com/wps".into());
        assert_eq!(ds.derived_url(), "http://example.com/wps");
        assert_eq!(ds.identity(), "http://example.com/wps#topp:states");
    }

    #[test]
    fn filters_compare_by_pointer() {
        let a: FilterRef = Arc::new(Filter { format: FilterFormat::Cql, body: "POP > 10".into() });
        let b: FilterRef = Arc::new(Filter { format: FilterFormat::Cql, body: "POP > 10".into() });
        assert!(same_filter(Some(&a), Some(&a.clone())));
        // Structurally identical but a different allocation: different.
        assert!(!same_filter(Some(&a), Some(&b)));
        assert!(same_filter(None, None));
        assert!(!same_filter(Some(&a), None));
    }

    #[test]
    fn page_range_math() {
        let r = PageRange::new(2, 4);
        assert_eq!(r.pages(), 3);
        assert!(r.contains(3));
        assert!(!r.contains(5));
        assert_eq!(r.mid_page(), 3);
        assert_eq!(PageRange::new(0, 4).mid_page(), 2);
    }

    #[test]
    fn visible_rows_map_to_page_windows() {
        // Rows 65..95 with 20-row pages touch pages 3 and 4.
        assert_eq!(PageRange::from_rows(65, 30, 20), PageRange::new(3, 4));
        // A window inside one page stays a single page.
        assert_eq!(PageRange::from_rows(0, 20, 20), PageRange::single(0));
        assert_eq!(PageRange::from_rows(20, 1, 20), PageRange::single(1));
        // Degenerate zero-height viewport still asks for its anchor page.
        assert_eq!(PageRange::from_rows(45, 0, 20), PageRange::single(2));
    }
}
