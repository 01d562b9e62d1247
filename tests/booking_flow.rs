use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use futures::FutureExt;
use fleetbook::lookup::StaticAssetLookup;
use fleetbook::query::{Filter, Pipeline, Sort};
use fleetbook::store::{RecordingStore, StoreError};
use fleetbook::token::SeededTokens;
use fleetbook::{
    BookingRepository, BookingService, Config, DocumentStore, EngineStore, FixedClock, Interval, Ms, RepositoryError, ServiceError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn day(year: i32, month: u32, day: u32) -> Ms {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .expect("valid date")
        .timestamp_millis()
}

fn span(from: (u32, u32), to: (u32, u32)) -> Interval {
    Interval::new(day(2123, from.0, from.1), day(2123, to.0, to.1))
}

struct Harness {
    store: Arc<EngineStore>,
    service: BookingService,
}

fn harness_with(config: Config, assets: &[&str]) -> Harness {
    init_tracing();
    let store = Arc::new(EngineStore::open(&config).unwrap());
    let repo = BookingRepository::new(store.clone(), &config).with_tokens(Arc::new(SeededTokens::new(42)));
    let clock = Arc::new(FixedClock::new(day(2100, 1, 1)));
    let service = BookingService::new(
        repo,
        Arc::new(StaticAssetLookup::with_assets(assets.iter().copied())),
        clock,
        &config,
    );
    Harness { store, service }
}

fn harness(assets: &[&str]) -> Harness {
    harness_with(Config::default(), assets)
}

fn repository(h: &Harness) -> BookingRepository {
    BookingRepository::new(h.store.clone(), &Config::default())
}

fn test_data_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("fleetbook_test_flow").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

// ── Scenarios ────────────────────────────────────────────

#[tokio::test]
async fn overlapping_booking_conflicts_touching_does_not() {
    let h = harness(&["X"]);
    let first = h.service.book("X", "cust1", span((1, 1), (2, 1))).await.unwrap();
    assert_eq!(first.customer_id, "cust1");

    let err = h.service.book("X", "cust2", span((1, 15), (1, 20))).await.unwrap_err();
    assert_eq!(err, ServiceError::Conflict("X".into()));
    assert_eq!(err.kind(), "conflict");

    h.service.book("X", "cust2", span((2, 1), (3, 1))).await.unwrap();
}

#[tokio::test]
async fn unavailable_assets_cover_overlapping_windows_only() {
    let h = harness(&["X"]);
    h.service.book("X", "cust1", span((1, 1), (2, 1))).await.unwrap();

    assert_eq!(h.service.unavailable_assets(span((1, 10), (1, 12))).await.unwrap(), ["X"]);
    assert!(h.service.unavailable_assets(span((3, 1), (4, 1))).await.unwrap().is_empty());
}

#[tokio::test]
async fn customer_overview_limits_globally_and_orders_documents() {
    let h = harness(&["X", "Y"]);
    h.service.book("X", "cust2", span((1, 2), (1, 3))).await.unwrap();
    h.service.book("X", "cust1", span((1, 5), (1, 6))).await.unwrap();
    h.service.book("Y", "cust1", span((1, 20), (1, 21))).await.unwrap();
    h.service.book("Y", "cust1", span((1, 1), (1, 2))).await.unwrap();
    h.service.book("Y", "cust1", span((1, 10), (1, 11))).await.unwrap();

    let limited = h.service.customer_overview("cust1", Some(2)).await.unwrap();
    let total: usize = limited.iter().map(|a| a.bookings.len()).sum();
    assert_eq!(total, 2);
    let shape: Vec<(&str, Vec<Ms>)> = limited
        .iter()
        .map(|a| (a.asset_id.as_str(), a.bookings.iter().map(|b| b.interval.start).collect()))
        .collect();
    assert_eq!(shape, [("Y", vec![day(2123, 1, 1)]), ("X", vec![day(2123, 1, 5)])]);

    let all = h.service.customer_overview("cust1", None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].asset_id, "Y");
    let y_starts: Vec<Ms> = all[0].bookings.iter().map(|b| b.interval.start).collect();
    assert_eq!(y_starts, [day(2123, 1, 1), day(2123, 1, 10), day(2123, 1, 20)]);
    assert!(all.iter().flat_map(|a| &a.bookings).all(|b| b.customer_id == "cust1"));

    // a limit of zero means no limit
    assert_eq!(h.service.customer_overview("cust1", Some(0)).await.unwrap(), all);
    assert!(h.service.customer_overview("nobody", Some(5)).await.unwrap().is_empty());
}

#[tokio::test]
async fn descending_overview_orders_by_latest_booking() {
    let h = harness(&["X", "Y"]);
    h.service.book("X", "c", span((1, 5), (1, 6))).await.unwrap();
    h.service.book("Y", "c", span((1, 1), (1, 2))).await.unwrap();
    h.service.book("Y", "c", span((1, 20), (1, 21))).await.unwrap();

    let pipeline = Pipeline::array_flatten_filter_limit(
        "bookings",
        &Filter::eq("customer_id", "c"),
        None,
        Some(&Sort::desc("start")),
    );
    let docs = h.store.aggregate("cars", &pipeline).await.unwrap();
    let ids: Vec<_> = docs.iter().map(|d| d["_id"].as_str().unwrap()).collect();
    assert_eq!(ids, ["Y", "X"]);
    assert_eq!(docs[0]["bookings"][0]["start"], day(2123, 1, 20));
}

#[tokio::test]
async fn first_booking_creates_the_asset_document() {
    let h = harness(&[]);
    let repo = repository(&h);
    assert_eq!(h.store.engine().document_count("cars"), 0);

    let booking = repo.create_booking("NEW", "cust9", span((6, 1), (6, 2))).await.unwrap();
    assert_eq!(h.store.engine().document_count("cars"), 1);
    assert!(repo.get_unavailable_assets(span((6, 1), (7, 1))).await.unwrap().contains(&"NEW".to_string()));
    assert_eq!(repo.get_booking(&booking.id).await.unwrap(), booking);
}

#[tokio::test]
async fn store_failure_is_not_a_conflict() {
    init_tracing();
    let store = Arc::new(RecordingStore::new());
    store.push_update_one(Err(StoreError::Unavailable("connection refused".into())));
    let repo = BookingRepository::new(store, &Config::default());

    let err = repo.create_booking("X", "c", span((1, 1), (1, 2))).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Store(StoreError::Unavailable(_))));
    assert!(!matches!(err, RepositoryError::Conflict { .. }));
}

// ── Properties ───────────────────────────────────────────

#[tokio::test]
async fn unavailable_assets_is_idempotent() {
    let h = harness(&["A", "B", "C"]);
    for (asset, from, to) in [("A", (1, 1), (1, 5)), ("B", (1, 3), (1, 9)), ("C", (2, 1), (2, 2))] {
        h.service.book(asset, "c", span(from, to)).await.unwrap();
    }
    let window = span((1, 4), (1, 6));
    let once: BTreeSet<String> = h.service.unavailable_assets(window).await.unwrap().into_iter().collect();
    let twice: BTreeSet<String> = h.service.unavailable_assets(window).await.unwrap().into_iter().collect();
    assert_eq!(once, twice);
    assert_eq!(once, BTreeSet::from(["A".to_string(), "B".to_string()]));
}

#[tokio::test]
async fn booking_lookup_and_customer_listing() {
    let h = harness(&["X", "Y"]);
    let late = h.service.book("X", "cust1", span((3, 1), (3, 2))).await.unwrap();
    let early = h.service.book("Y", "cust1", span((1, 1), (1, 2))).await.unwrap();
    h.service.book("Y", "cust2", span((2, 1), (2, 2))).await.unwrap();

    assert_eq!(h.service.booking(&late.id).await.unwrap(), late);
    assert_eq!(
        h.service.booking("missing").await.unwrap_err(),
        ServiceError::BookingNotFound("missing".into())
    );

    let ids: Vec<String> = h
        .service
        .customer_bookings("cust1")
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, [early.id, late.id]);
    assert!(h.service.customer_bookings("nobody").await.unwrap().is_empty());
}

#[tokio::test]
async fn availability_and_access_grants() {
    let h = harness(&["X", "Y"]);
    let booking = h.service.book("X", "cust1", span((1, 10), (1, 20))).await.unwrap();

    let window = span((1, 12), (1, 14));
    assert!(!h.service.check_availability("X", window).await.unwrap().available);
    assert!(h.service.check_availability("Y", window).await.unwrap().available);

    let grant = h.service.grant_access(&booking.id, span((1, 1), (1, 15))).await.unwrap();
    assert_eq!(grant.interval, span((1, 10), (1, 15)));
    assert_eq!(grant.token.len(), 32);
    assert!(!format!("{grant:?}").contains(&grant.token));

    let stored = h.service.booking(&booking.id).await.unwrap();
    assert_eq!(stored.access, Some(grant));

    let outside = span((2, 1), (2, 2));
    assert_eq!(
        h.service.grant_access(&booking.id, outside).await.unwrap_err(),
        ServiceError::InvalidInterval(outside)
    );
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_overlapping_bookings_admit_exactly_one() {
    let h = Arc::new(harness(&["X"]));
    let attempts = (0..32).map(|i| {
        let h = h.clone();
        async move {
            // all windows contain Jan 15
            let start = 1 + (i % 10);
            h.service
                .book("X", &format!("cust{i}"), span((1, start), (1, 15 + start)))
                .await
        }
    });
    let handles: Vec<_> = attempts.map(tokio::spawn).collect();
    let results = futures::future::join_all(handles).await;

    let mut ok = 0;
    for r in results {
        match r.unwrap() {
            Ok(_) => ok += 1,
            Err(ServiceError::Conflict(asset)) => assert_eq!(asset, "X"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_bookings_on_distinct_assets_all_succeed() {
    let assets: Vec<String> = (0..24).map(|i| format!("VIN{i}")).collect();
    let ids: Vec<&str> = assets.iter().map(String::as_str).collect();
    let h = Arc::new(harness(&ids));

    let handles: Vec<_> = assets
        .iter()
        .cloned()
        .map(|asset| {
            let h = h.clone();
            tokio::spawn(async move { h.service.book(&asset, "c", span((5, 1), (5, 8))).await })
        })
        .collect();
    for r in futures::future::join_all(handles).await {
        r.unwrap().unwrap();
    }
    let unavailable = h.service.unavailable_assets(span((5, 2), (5, 3))).await.unwrap();
    assert_eq!(unavailable.len(), 24);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn bookings_survive_reopen() {
    let config = Config {
        data_dir: Some(test_data_dir("reopen")),
        ..Config::default()
    };
    let booking = {
        let h = harness_with(config.clone(), &["X"]);
        let b = h.service.book("X", "cust1", span((1, 1), (1, 2))).await.unwrap();
        h.service.grant_access(&b.id, span((1, 1), (1, 2))).await.unwrap();
        b
    };

    let h = harness_with(config, &["X"]);
    let restored = h.service.booking(&booking.id).await.unwrap();
    assert_eq!(restored.interval, booking.interval);
    assert!(restored.access.is_some());
    assert_eq!(
        h.service.book("X", "cust2", span((1, 1), (1, 3))).await.unwrap_err(),
        ServiceError::Conflict("X".into())
    );
}

#[tokio::test]
async fn abandoned_booking_matches_state_after_reopen() {
    let config = Config {
        data_dir: Some(test_data_dir("abandoned")),
        ..Config::default()
    };
    let window = span((2, 1), (2, 2));
    let before = {
        let h = harness_with(config.clone(), &["X"]);
        let repo = repository(&h);
        repo.create_booking("X", "c1", span((1, 1), (1, 2))).await.unwrap();

        // dropped at its first suspension point, as an elapsed timeout would be
        let abandoned = repo.create_booking("X", "c2", window).now_or_never();
        assert!(abandoned.is_none());
        repo.get_unavailable_assets(window).await.unwrap()
    };

    let h = harness_with(config, &["X"]);
    let after = repository(&h).get_unavailable_assets(window).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(after, vec!["X".to_string()]);
}
