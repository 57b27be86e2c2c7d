//! Tavola page store (Milestone 0): bounded window of loaded feature pages
//! for a virtualized grid, with distance-based eviction.

#![forbid(unsafe_code)]

use std::cmp::Reverse;

use metrics::{counter, gauge};
use tavola_core::{Feature, FetchResult, GridConfig, PageRange, PaginationOptions};
use tracing::{debug, trace};

/// Bounded, ordered cache of feature pages.
///
/// Resident page indices live in `pages` (sorted); `features` is the parallel
/// slot array with exactly `pages.len() * page_size` entries. Short server
/// pages (the tail of the collection) are padded with `None`, never with rows
/// from another page or filter.
#[derive(Debug, Clone)]
pub struct PageStore {
    page_size: usize,
    max_stored_pages: usize,
    pages: Vec<usize>,
    features: Vec<Option<Feature>>,
    total_features: Option<u64>,
}

impl PageStore {
    pub fn new(page_size: usize, max_stored_pages: usize) -> Self {
        assert!(page_size > 0);
        assert!(max_stored_pages > 0);
        Self {
            page_size,
            max_stored_pages,
            pages: Vec::new(),
            features: Vec::new(),
            total_features: None,
        }
    }

    pub fn from_config(config: &GridConfig) -> Self {
        Self::new(config.page_size, config.max_stored_pages)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn resident_pages(&self) -> &[usize] {
        &self.pages
    }

    pub fn features(&self) -> &[Option<Feature>] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn total_features(&self) -> Option<u64> {
        self.total_features
    }

    pub fn is_resident(&self, page: usize) -> bool {
        self.pages.binary_search(&page).is_ok()
    }

    /// Resolve an absolute row index to its feature, when resident.
    pub fn row(&self, row: usize) -> Option<&Feature> {
        let page = row / self.page_size;
        let slot = self.pages.binary_search(&page).ok()?;
        self.features[slot * self.page_size + row % self.page_size].as_ref()
    }

    /// Contiguous sub-window of `range` still missing from the store: from the
    /// first missing page to the last missing page. Resident pages inside
    /// that window get re-fetched with it. `None` when fully resident.
    pub fn pages_to_load(&self, range: PageRange) -> Option<PageRange> {
        let first = range.iter().find(|p| !self.is_resident(*p))?;
        let last = range
            .iter()
            .rev()
            .find(|p| !self.is_resident(*p))
            .expect("a first missing page implies a last one");
        Some(PageRange::new(first, last))
    }

    /// Offset/limit window covering the missing part of `range`, clipped to
    /// the known total. Zero-size when the range is fully resident.
    pub fn fetch_window(&self, range: PageRange) -> PaginationOptions {
        let Some(missing) = self.pages_to_load(range) else {
            return PaginationOptions::default();
        };
        let start_index = missing.start_page * self.page_size;
        let mut max_features = missing.pages() * self.page_size;
        if let Some(total) = self.total_features {
            let total = total as usize;
            if start_index >= total {
                return PaginationOptions::default();
            }
            max_features = max_features.min(total - start_index);
        }
        PaginationOptions::new(start_index, max_features)
    }

    /// Merge a fetch reply into the store.
    ///
    /// Rows are slotted at the pages implied by `start_index` (always
    /// page-aligned, coming from [`Self::fetch_window`]); then pages are
    /// evicted farthest-first from the midpoint of `requested` until the
    /// store is back under `max_stored_pages`. Pages of `requested` itself
    /// are only evicted if the bound cannot be met otherwise.
    pub fn merge(&mut self, result: &FetchResult, requested: PageRange, start_index: usize) {
        debug_assert_eq!(start_index % self.page_size, 0);
        if let Some(total) = result.total_features {
            self.total_features = Some(total);
        }

        let first_page = start_index / self.page_size;
        let mut inserted = 0usize;
        for (i, chunk) in result.features.chunks(self.page_size).enumerate() {
            self.insert_page(first_page + i, chunk);
            inserted += 1;
        }

        let evicted = self.evict_as_needed(requested);
        counter!("tavola_store_pages_merged", inserted as u64);
        if evicted > 0 {
            counter!("tavola_store_pages_evicted", evicted as u64);
        }
        gauge!("tavola_store_resident_pages", self.pages.len() as f64);
        debug!(
            inserted,
            evicted,
            resident = self.pages.len(),
            total = ?self.total_features,
            "pages merged"
        );
        debug_assert_eq!(self.features.len(), self.pages.len() * self.page_size);
    }

    /// Drop everything. Invoked on any filter, sort or source change: no
    /// partial reuse across predicates.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.features.clear();
        self.total_features = None;
        gauge!("tavola_store_resident_pages", 0.0);
    }

    fn insert_page(&mut self, page: usize, rows: &[Feature]) {
        let padded: Vec<Option<Feature>> = rows
            .iter()
            .cloned()
            .map(Some)
            .chain(std::iter::repeat(None))
            .take(self.page_size)
            .collect();
        match self.pages.binary_search(&page) {
            Ok(slot) => {
                let at = slot * self.page_size;
                self.features.splice(at..at + self.page_size, padded);
            }
            Err(slot) => {
                self.pages.insert(slot, page);
                let at = slot * self.page_size;
                self.features.splice(at..at, padded);
            }
        }
    }

    fn evict_as_needed(&mut self, requested: PageRange) -> usize {
        let mid_page = requested.mid_page();
        let mut evicted = 0usize;
        while self.pages.len() > self.max_stored_pages {
            // Prefer pages outside the just-requested range; fall back to
            // evicting inside it when the range alone exceeds the bound.
            let candidate = pick_farthest(&self.pages, mid_page, Some(requested))
                .or_else(|| pick_farthest(&self.pages, mid_page, None));
            let Some(slot) = candidate else { break };
            let page = self.pages.remove(slot);
            let at = slot * self.page_size;
            self.features.drain(at..at + self.page_size);
            trace!(page, "page evicted");
            evicted += 1;
        }
        evicted
    }
}

/// Slot of the resident page farthest (in page-index distance) from
/// `mid_page`. Ties evict the lower page index, keeping merges deterministic.
fn pick_farthest(pages: &[usize], mid_page: usize, protect: Option<PageRange>) -> Option<usize> {
    pages
        .iter()
        .enumerate()
        .filter(|(_, p)| protect.map_or(true, |r| !r.contains(**p)))
        .max_by_key(|(_, p)| (p.abs_diff(mid_page), Reverse(**p)))
        .map(|(slot, _)| slot)
}
