//! Per-grid coordination: input-change dedup, generation-tagged fetches with
//! switch-latest cancellation, and snapshot publishing.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::counter;
use tavola_core::{
    same_filter, DataSource, Feature, FetchResult, FilterRef, GridConfig, PageRange,
    PaginationOptions, SortOptions,
};
use tavola_schema::{FeatureTypeSchema, SchemaCache};
use tavola_store::PageStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{ApiError, ApiResult, FeatureSource};

/// Immutable grid state handed to the UI layer.
#[derive(Debug, Clone, Default)]
pub struct GridSnapshot {
    pub loading: bool,
    pub error: Option<String>,
    pub schema: Option<Arc<FeatureTypeSchema>>,
    /// Resident page indices, sorted.
    pub pages: Vec<usize>,
    /// Row slots parallel to `pages` (`pages.len() * page_size` entries).
    pub features: Vec<Option<Feature>>,
    pub total_features: Option<u64>,
}

#[derive(Clone)]
struct View {
    source: DataSource,
    filter: Option<FilterRef>,
}

/// Two prop sets are equivalent (no refetch) when the derived identity, the
/// property selection and the filter POINTER are all unchanged.
fn same_view(a: &View, b: &View) -> bool {
    a.source.identity() == b.source.identity()
        && a.source.properties == b.source.properties
        && same_filter(a.filter.as_ref(), b.filter.as_ref())
}

struct State {
    view: Option<View>,
    sort: Option<SortOptions>,
    /// Guards fetch results; bumped on any source/filter/property/sort change.
    data_gen: u64,
    /// Guards describe results; bumped only when the source identity changes.
    schema_gen: u64,
    epoch: u64,
    last_range: PageRange,
    store: PageStore,
    schema_cache: SchemaCache,
    schema: Option<Arc<FeatureTypeSchema>>,
    describe_task: Option<JoinHandle<()>>,
    fetch_task: Option<JoinHandle<()>>,
    inflight: Option<(PageRange, PaginationOptions)>,
    loading_describe: bool,
    loading_fetch: bool,
    describe_error: Option<String>,
    fetch_error: Option<String>,
}

struct Inner {
    source: Arc<dyn FeatureSource>,
    state: Mutex<State>,
    snap: ArcSwap<GridSnapshot>,
    epoch_tx: watch::Sender<u64>,
    // Keeps the channel open so publishes never fail.
    epoch_rx: watch::Receiver<u64>,
}

/// One coordinator per grid instance; owns its page store and schema cache
/// exclusively and discards them on drop. All methods are non-blocking and
/// must be called from within a tokio runtime.
pub struct GridCoordinator {
    inner: Arc<Inner>,
}

impl GridCoordinator {
    pub fn new(source: Arc<dyn FeatureSource>, config: GridConfig) -> Self {
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let inner = Inner {
            source,
            state: Mutex::new(State {
                view: None,
                sort: None,
                data_gen: 0,
                schema_gen: 0,
                epoch: 0,
                last_range: PageRange::single(0),
                store: PageStore::from_config(&config),
                schema_cache: SchemaCache::new(),
                schema: None,
                describe_task: None,
                fetch_task: None,
                inflight: None,
                loading_describe: false,
                loading_fetch: false,
                describe_error: None,
                fetch_error: None,
            }),
            snap: ArcSwap::from_pointee(GridSnapshot::default()),
            epoch_tx,
            epoch_rx,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Current published state.
    pub fn snapshot(&self) -> Arc<GridSnapshot> {
        self.inner.snap.load_full()
    }

    /// Subscribe to snapshot swaps.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.inner.epoch_rx.clone()
    }

    /// Point the grid at a data source + filter. Equivalent inputs are a
    /// no-op; any real change supersedes in-flight work and starts a fresh
    /// describe/data cycle, publishing `{loading: true}` immediately.
    pub fn set_view(&self, source: DataSource, filter: Option<FilterRef>) {
        let mut st = self.inner.state.lock().unwrap();
        let next = View { source, filter };
        if let Some(cur) = &st.view {
            if same_view(cur, &next) {
                debug!("grid: view unchanged, no refetch");
                return;
            }
        }
        let identity = next.source.identity();
        let identity_changed =
            st.view.as_ref().map(|v| v.source.identity()).as_deref() != Some(identity.as_str());

        st.data_gen += 1;
        if let Some(t) = st.fetch_task.take() {
            t.abort();
        }
        st.loading_fetch = false;
        st.inflight = None;
        st.store.clear();
        st.fetch_error = None;

        if identity_changed {
            st.schema_gen += 1;
            if let Some(t) = st.describe_task.take() {
                t.abort();
            }
            st.loading_describe = false;
            st.schema = None;
            st.describe_error = None;
            // A new collection starts back at the top of the grid.
            st.last_range = PageRange::single(0);
        }
        st.view = Some(next.clone());

        // Every schema lookup goes through the cache; only an identity the
        // cache has never answered for triggers a describe request.
        if !(st.loading_describe && !identity_changed) {
            if let Some(hit) = st.schema_cache.get(&identity) {
                counter!("tavola_schema_cache_hits", 1u64);
                st.schema = Some(hit);
            } else {
                st.schema = None;
                st.describe_error = None;
                st.loading_describe = true;
                let h = Inner::spawn_describe(
                    Arc::clone(&self.inner),
                    st.schema_gen,
                    identity,
                    next.source.clone(),
                );
                st.describe_task = Some(h);
            }
        }

        // Describe and first page load run concurrently.
        let range = st.last_range;
        Inner::dispatch_fetch_locked(&self.inner, &mut st, range);
    }

    /// Replace the filter, keeping the current source. Refreshes at the
    /// current scroll window, not at page zero.
    pub fn set_filter(&self, filter: Option<FilterRef>) {
        let source = {
            let st = self.inner.state.lock().unwrap();
            match &st.view {
                Some(v) => v.source.clone(),
                None => return,
            }
        };
        self.set_view(source, filter);
    }

    /// Change the sort. Discards cached pages (their order is stale) and
    /// refreshes at the current scroll window, not at page zero.
    pub fn set_sort(&self, sort: Option<SortOptions>) {
        let mut st = self.inner.state.lock().unwrap();
        st.sort = sort;
        if st.view.is_none() {
            return;
        }
        st.data_gen += 1;
        if let Some(t) = st.fetch_task.take() {
            t.abort();
        }
        st.loading_fetch = false;
        st.inflight = None;
        st.store.clear();
        st.fetch_error = None;
        let range = st.last_range;
        Inner::dispatch_fetch_locked(&self.inner, &mut st, range);
    }

    /// Scroll callback from the virtualized grid: request a page window.
    pub fn more_features(&self, range: PageRange) {
        let mut st = self.inner.state.lock().unwrap();
        if st.view.is_none() {
            return;
        }
        Inner::dispatch_fetch_locked(&self.inner, &mut st, range);
    }

    /// Raw scroll-position callback: translate the visible row window into a
    /// page range and request it.
    pub fn scrolled(&self, first_row: usize, visible_rows: usize) {
        let mut st = self.inner.state.lock().unwrap();
        if st.view.is_none() {
            return;
        }
        let range = PageRange::from_rows(first_row, visible_rows, st.store.page_size());
        Inner::dispatch_fetch_locked(&self.inner, &mut st, range);
    }
}

impl Drop for GridCoordinator {
    fn drop(&mut self) {
        let mut st = self.inner.state.lock().unwrap();
        if let Some(t) = st.fetch_task.take() {
            t.abort();
        }
        if let Some(t) = st.describe_task.take() {
            t.abort();
        }
    }
}

impl Inner {
    /// Publish the current state as a fresh snapshot and bump the epoch.
    fn publish_locked(&self, st: &mut State) {
        st.epoch += 1;
        let snap = GridSnapshot {
            loading: st.loading_fetch || st.loading_describe,
            // A schema failure blocks readiness, so it wins the error slot.
            error: st.describe_error.clone().or_else(|| st.fetch_error.clone()),
            schema: st.schema.clone(),
            pages: st.store.resident_pages().to_vec(),
            features: st.store.features().to_vec(),
            total_features: st.store.total_features(),
        };
        self.snap.store(Arc::new(snap));
        let _ = self.epoch_tx.send(st.epoch);
    }

    /// Record `range` as the current scroll window and fetch whatever part of
    /// it is missing. A zero-size window publishes from cache without any
    /// network call; an identical in-flight request is coalesced; anything
    /// else supersedes the previous fetch (switch-latest).
    fn dispatch_fetch_locked(inner: &Arc<Inner>, st: &mut State, range: PageRange) {
        st.last_range = range;
        let Some(view) = st.view.clone() else { return };
        let window = st.store.fetch_window(range);
        if window.is_empty() {
            debug!(start = range.start_page, end = range.end_page, "grid: range resident, no fetch");
            st.inflight = None;
            inner.publish_locked(st);
            return;
        }
        if st.loading_fetch && st.inflight == Some((range, window)) {
            debug!("grid: identical fetch already in flight, coalesced");
            return;
        }
        if let Some(t) = st.fetch_task.take() {
            t.abort();
        }
        st.loading_fetch = true;
        st.inflight = Some((range, window));
        let gen = st.data_gen;
        let sort = st.sort.clone();
        let schema = st.schema.clone();
        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            let result = run_fetch(&task_inner, &view, window, sort, schema).await;
            let mut st = task_inner.state.lock().unwrap();
            if st.data_gen != gen {
                counter!("tavola_stale_results_discarded", 1u64);
                debug!("grid: stale fetch result discarded");
                return;
            }
            st.loading_fetch = false;
            st.inflight = None;
            match result {
                Ok(page) => {
                    st.store.merge(&page, range, window.start_index);
                    st.fetch_error = None;
                }
                Err(e) => {
                    // Not retried; the next scroll/filter/sort issues a
                    // fresh request.
                    st.fetch_error = Some(e.to_string());
                }
            }
            task_inner.publish_locked(&mut st);
        });
        st.fetch_task = Some(handle);
        inner.publish_locked(st);
    }

    fn spawn_describe(
        inner: Arc<Inner>,
        gen: u64,
        identity: String,
        source: DataSource,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let t0 = Instant::now();
            let result = inner.source.describe(&source).await;
            let mut st = inner.state.lock().unwrap();
            if st.schema_gen != gen {
                debug!("grid: stale describe discarded");
                return;
            }
            st.loading_describe = false;
            match result {
                Ok(schema) => {
                    let schema = st.schema_cache.put(identity, schema);
                    st.schema = Some(schema);
                    st.describe_error = None;
                    info!(took_ms = %t0.elapsed().as_millis(), "grid: schema ready");
                }
                Err(e) => {
                    // Describe failures surface as grid errors and are not
                    // retried until the inputs change again.
                    st.describe_error = Some(e.to_string());
                }
            }
            inner.publish_locked(&mut st);
        })
    }
}

/// One fetch, with the sortless-paging workaround: servers that refuse a
/// paged query without a sort get one retry ordered on the first schema
/// attribute.
async fn run_fetch(
    inner: &Arc<Inner>,
    view: &View,
    window: PaginationOptions,
    sort: Option<SortOptions>,
    schema: Option<Arc<FeatureTypeSchema>>,
) -> ApiResult<FetchResult> {
    let filter = view.filter.as_deref();
    match inner
        .source
        .fetch_page(&view.source, filter, window, sort.as_ref())
        .await
    {
        Err(ApiError::Service(msg)) if sort.is_none() => {
            let attr = schema
                .as_ref()
                .and_then(|s| s.first_attribute())
                .map(str::to_string);
            let Some(attr) = attr else {
                return Err(ApiError::Service(msg));
            };
            info!(attr = %attr, "grid: retrying page fetch with default sort");
            let fallback = SortOptions::default_on(attr);
            inner
                .source
                .fetch_page(&view.source, filter, window, Some(&fallback))
                .await
        }
        other => other,
    }
}
