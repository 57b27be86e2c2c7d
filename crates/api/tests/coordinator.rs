#![forbid(unsafe_code)]

//! Coordinator behavior: dedup, switch-latest, refresh-at-scroll, timeout
//! recovery and the residency bound, all against the mock source.

use std::sync::Arc;
use std::time::Duration;

use tavola_api::{ApiError, FeatureSource, GridCoordinator, MockSource};
use tavola_core::{DataSource, Filter, FilterFormat, FilterRef, GridConfig, PageRange, SortOptions};

fn config() -> GridConfig {
    GridConfig { page_size: 20, max_stored_pages: 5, request_timeout_ms: 15_000 }
}

fn source() -> DataSource {
    DataSource::new("http://mock.example/wfs", "mock")
}

fn cql(body: &str) -> FilterRef {
    Arc::new(Filter { format: FilterFormat::Cql, body: body.into() })
}

fn grid(total: u64, cfg: GridConfig) -> (Arc<MockSource>, GridCoordinator) {
    let mock = Arc::new(MockSource::new(MockSource::default_schema(), total));
    let src: Arc<dyn FeatureSource> = mock.clone();
    (mock, GridCoordinator::new(src, cfg))
}

/// Wait for the coordinator to leave the loading state.
async fn settle(coordinator: &GridCoordinator) {
    for _ in 0..400 {
        if !coordinator.snapshot().loading {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("coordinator never settled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_cycle_loads_schema_and_first_page() {
    let (mock, coordinator) = grid(100, config());
    mock.queue_fetch_delays([Duration::from_millis(50)]);
    coordinator.set_view(source(), None);
    // The accepted input change publishes a loading state immediately.
    assert!(coordinator.snapshot().loading);
    settle(&coordinator).await;

    let snap = coordinator.snapshot();
    assert!(snap.error.is_none());
    assert!(snap.schema.is_some());
    assert_eq!(snap.pages, vec![0]);
    assert_eq!(snap.features.len(), 20);
    assert_eq!(snap.total_features, Some(100));
    assert_eq!(mock.describe_calls(), 1);
    assert_eq!(mock.fetch_calls(), 1);
    assert_eq!(snap.features[0].as_ref().unwrap().id.as_deref(), Some("mock.0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resident_range_issues_no_second_fetch() {
    let (mock, coordinator) = grid(100, config());
    coordinator.set_view(source(), None);
    settle(&coordinator).await;
    assert_eq!(mock.fetch_calls(), 1);

    // Same range again: fully resident, so no network call.
    coordinator.more_features(PageRange::new(0, 0));
    settle(&coordinator).await;
    assert_eq!(mock.fetch_calls(), 1);
    assert_eq!(coordinator.snapshot().pages, vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn equivalent_views_do_not_refetch() {
    let (mock, coordinator) = grid(100, config());
    let filter = cql("VALUE > 3");
    coordinator.set_view(source(), Some(filter.clone()));
    settle(&coordinator).await;
    assert_eq!(mock.fetch_calls(), 1);

    // Identical source, identical filter pointer: a no-op.
    coordinator.set_view(source(), Some(filter.clone()));
    settle(&coordinator).await;
    assert_eq!(mock.fetch_calls(), 1);
    assert_eq!(mock.describe_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filter_identity_governs_refetch_and_schema_stays_cached() {
    let (mock, coordinator) = grid(100, config());
    coordinator.set_view(source(), Some(cql("VALUE > 3")));
    settle(&coordinator).await;
    assert_eq!(mock.describe_calls(), 1);
    assert_eq!(mock.fetch_calls(), 1);

    // Structurally identical filter, different allocation: refetches data,
    // but the unchanged identity answers the schema from cache.
    coordinator.set_view(source(), Some(cql("VALUE > 3")));
    settle(&coordinator).await;
    assert_eq!(mock.fetch_calls(), 2);
    assert_eq!(mock.describe_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newer_range_supersedes_older_in_flight_fetch() {
    let (mock, coordinator) = grid(1000, config());
    coordinator.set_view(source(), None);
    settle(&coordinator).await;

    // Old request dawdles; new one is quick. Only the new range may land.
    mock.queue_fetch_delays([Duration::from_millis(150), Duration::from_millis(10)]);
    coordinator.more_features(PageRange::new(0, 1));
    coordinator.more_features(PageRange::new(2, 3));
    settle(&coordinator).await;
    // Give the superseded fetch every chance to land if it wrongly could.
    tokio::time::sleep(Duration::from_millis(250)).await;

    let snap = coordinator.snapshot();
    assert!(snap.pages.contains(&2) && snap.pages.contains(&3));
    assert!(!snap.pages.contains(&1), "superseded range leaked into state");
    let last = *mock.fetch_log().last().unwrap();
    assert_eq!(last.start_index, 40);
    assert_eq!(last.max_features, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sort_refreshes_at_the_current_scroll_window() {
    let (mock, coordinator) = grid(1000, config());
    coordinator.set_view(source(), None);
    settle(&coordinator).await;

    // Scrolled to page 3 with that fetch still in flight...
    mock.queue_fetch_delays([Duration::from_millis(200), Duration::ZERO]);
    coordinator.more_features(PageRange::single(3));
    // ...a sort fires: the refreshed request must target page 3, not page 0.
    coordinator.set_sort(Some(SortOptions::default_on("NAME")));
    settle(&coordinator).await;

    let last = *mock.fetch_log().last().unwrap();
    assert_eq!(last.start_index, 60);
    assert_eq!(last.max_features, 20);
    let snap = coordinator.snapshot();
    assert_eq!(snap.pages, vec![3]);
    assert_eq!(snap.features[0].as_ref().unwrap().id.as_deref(), Some("mock.60"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_surfaces_as_error_and_merges_nothing() {
    let (mock, coordinator) = grid(100, config());
    mock.queue_fetch_errors([ApiError::Timeout(15_000)]);
    coordinator.set_view(source(), None);
    settle(&coordinator).await;

    let snap = coordinator.snapshot();
    let err = snap.error.as_deref().expect("timeout must surface");
    assert!(err.contains("timeout after 15000 ms"), "got: {err}");
    assert!(snap.pages.is_empty());
    assert!(snap.features.is_empty());
    assert_eq!(snap.total_features, None);

    // Recoverable: the next user-triggered scroll succeeds and clears it.
    coordinator.more_features(PageRange::single(0));
    settle(&coordinator).await;
    let snap = coordinator.snapshot();
    assert!(snap.error.is_none());
    assert_eq!(snap.pages, vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn describe_failure_blocks_readiness_but_not_page_data() {
    let (mock, coordinator) = grid(100, config());
    mock.queue_describe_errors([ApiError::Service("describe boom".into())]);
    coordinator.set_view(source(), None);
    settle(&coordinator).await;

    let snap = coordinator.snapshot();
    assert!(snap.schema.is_none());
    assert!(snap.error.as_deref().unwrap().contains("describe boom"));
    // Page fetch is not gated on the schema and still merged.
    assert_eq!(snap.pages, vec![0]);

    // An input change retries the describe; this one succeeds.
    coordinator.set_filter(Some(cql("VALUE > 1")));
    settle(&coordinator).await;
    let snap = coordinator.snapshot();
    assert!(snap.schema.is_some());
    assert!(snap.error.is_none());
    assert_eq!(mock.describe_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resident_pages_never_exceed_the_bound() {
    let cfg = GridConfig { page_size: 10, max_stored_pages: 3, request_timeout_ms: 15_000 };
    let (_mock, coordinator) = grid(1000, cfg);
    coordinator.set_view(source(), None);
    settle(&coordinator).await;

    for page in 1..12usize {
        coordinator.more_features(PageRange::single(page));
        settle(&coordinator).await;
        let snap = coordinator.snapshot();
        assert!(snap.pages.len() <= 3, "bound exceeded at page {page}: {:?}", snap.pages);
        assert_eq!(snap.features.len(), snap.pages.len() * 10);
    }
    assert!(coordinator.snapshot().pages.contains(&11));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scroll_positions_translate_to_page_windows() {
    let (mock, coordinator) = grid(1000, config());
    coordinator.set_view(source(), None);
    settle(&coordinator).await;

    // Rows 65..95 at 20 rows per page touch pages 3 and 4.
    coordinator.scrolled(65, 30);
    settle(&coordinator).await;
    let snap = coordinator.snapshot();
    assert!(snap.pages.contains(&3) && snap.pages.contains(&4));
    let last = *mock.fetch_log().last().unwrap();
    assert_eq!(last.start_index, 60);
    assert_eq!(last.max_features, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn epoch_channel_signals_every_publish() {
    let (_mock, coordinator) = grid(100, config());
    let rx = coordinator.subscribe_epoch();
    assert_eq!(*rx.borrow(), 0);
    coordinator.set_view(source(), None);
    settle(&coordinator).await;
    assert!(*rx.borrow() > 0);
}
