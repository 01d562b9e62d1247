//! Booking orchestration: validates requests, consults the asset inventory
//! and delegates persistence to the [`BookingRepository`].
//!
//! Validation always runs in the same order: interval shape, the past check
//! (writes only), the asset lookup, then the repository.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::Config;
use crate::lookup::{AssetDetails, AssetLookup, LookupError};
use crate::model::{AccessGrant, AssetBookings, Booking, Interval, Ms};
use crate::observability::record_service_error;
use crate::repository::{BookingRepository, RepositoryError};
use crate::store::StoreError;

/// Source of "now" for the past check.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(now: Ms) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: Ms) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> Ms {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// `start` is not before `end`, or the window misses the booking entirely.
    InvalidInterval(Interval),
    IntervalInPast { start: Ms, now: Ms },
    AssetNotFound(String),
    BookingNotFound(String),
    /// The asset already has an overlapping booking.
    Conflict(String),
    Store(StoreError),
    /// The asset lookup answered with something other than details or "not found".
    CollaboratorAssertionFailed(String),
}

impl ServiceError {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidInterval(_) => "invalid_interval",
            ServiceError::IntervalInPast { .. } => "interval_in_past",
            ServiceError::AssetNotFound(_) => "asset_not_found",
            ServiceError::BookingNotFound(_) => "booking_not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Store(_) => "store",
            ServiceError::CollaboratorAssertionFailed(_) => "collaborator_assertion_failed",
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::InvalidInterval(i) => {
                write!(f, "invalid interval [{}, {})", i.start, i.end)
            }
            ServiceError::IntervalInPast { start, now } => {
                write!(f, "interval starts at {start}, before now ({now})")
            }
            ServiceError::AssetNotFound(id) => write!(f, "asset {id} not found"),
            ServiceError::BookingNotFound(id) => write!(f, "booking {id} not found"),
            ServiceError::Conflict(id) => write!(f, "asset {id} already has an overlapping booking"),
            ServiceError::Store(e) => write!(f, "{e}"),
            ServiceError::CollaboratorAssertionFailed(msg) => {
                write!(f, "asset lookup assertion failed: {msg}")
            }
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Conflict { asset_id } => ServiceError::Conflict(asset_id),
            RepositoryError::BookingNotFound { booking_id } => ServiceError::BookingNotFound(booking_id),
            RepositoryError::Store(e) => ServiceError::Store(e),
        }
    }
}

/// Answer of [`BookingService::check_availability`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub asset: AssetDetails,
    pub available: bool,
}

fn observe<T>(operation: &'static str, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
    if let Err(e) = &result {
        record_service_error(e);
        match e {
            ServiceError::Store(_) | ServiceError::CollaboratorAssertionFailed(_) => {
                warn!(operation, kind = e.kind(), error = %e, "booking request failed");
            }
            _ => debug!(operation, kind = e.kind(), error = %e, "booking request rejected"),
        }
    }
    result
}

pub struct BookingService {
    repository: BookingRepository,
    assets: Arc<dyn AssetLookup>,
    clock: Arc<dyn Clock>,
    access_token_len: usize,
}

impl BookingService {
    pub fn new(
        repository: BookingRepository,
        assets: Arc<dyn AssetLookup>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            repository,
            assets,
            clock,
            access_token_len: config.access_token_len,
        }
    }

    pub fn repository(&self) -> &BookingRepository {
        &self.repository
    }

    fn validate(interval: Interval) -> Result<(), ServiceError> {
        if interval.is_valid() {
            Ok(())
        } else {
            Err(ServiceError::InvalidInterval(interval))
        }
    }

    fn not_in_past(&self, interval: Interval) -> Result<(), ServiceError> {
        let now = self.clock.now_ms();
        if interval.start < now {
            return Err(ServiceError::IntervalInPast {
                start: interval.start,
                now,
            });
        }
        Ok(())
    }

    async fn lookup_asset(&self, asset_id: &str) -> Result<AssetDetails, ServiceError> {
        match self.assets.lookup(asset_id).await {
            Ok(details) => Ok(details),
            Err(LookupError::NotFound) => Err(ServiceError::AssetNotFound(asset_id.to_string())),
            Err(LookupError::Unexpected { status, detail }) => Err(ServiceError::CollaboratorAssertionFailed(
                format!("lookup of {asset_id} answered {status}: {detail}"),
            )),
        }
    }

    async fn try_book(&self, asset_id: &str, customer_id: &str, interval: Interval) -> Result<Booking, ServiceError> {
        Self::validate(interval)?;
        self.not_in_past(interval)?;
        self.lookup_asset(asset_id).await?;
        Ok(self.repository.create_booking(asset_id, customer_id, interval).await?)
    }

    async fn try_check_availability(&self, asset_id: &str, interval: Interval) -> Result<Availability, ServiceError> {
        Self::validate(interval)?;
        let asset = self.lookup_asset(asset_id).await?;
        let unavailable = self.repository.get_unavailable_assets(interval).await?;
        let available = !unavailable.iter().any(|id| *id == asset.asset_id);
        Ok(Availability { asset, available })
    }

    async fn try_grant_access(&self, booking_id: &str, window: Interval) -> Result<AccessGrant, ServiceError> {
        Self::validate(window)?;
        let booking = self.repository.get_booking(booking_id).await?;
        let interval = window
            .restrict_to(&booking.interval)
            .ok_or(ServiceError::InvalidInterval(window))?;
        let grant = AccessGrant {
            token: self.repository.tokens().token(self.access_token_len),
            interval,
        };
        self.repository.attach_access_grant(booking_id, &grant).await?;
        Ok(grant)
    }

    /// Book `interval` on an existing asset.
    pub async fn book(&self, asset_id: &str, customer_id: &str, interval: Interval) -> Result<Booking, ServiceError> {
        observe("book", self.try_book(asset_id, customer_id, interval).await)
    }

    /// Assets booked at some point of `interval`. Past windows are allowed.
    pub async fn unavailable_assets(&self, interval: Interval) -> Result<Vec<String>, ServiceError> {
        let result = match Self::validate(interval) {
            Ok(()) => self
                .repository
                .get_unavailable_assets(interval)
                .await
                .map_err(ServiceError::from),
            Err(e) => Err(e),
        };
        observe("unavailable_assets", result)
    }

    /// Whether `asset_id` is free for the whole of `interval`.
    pub async fn check_availability(&self, asset_id: &str, interval: Interval) -> Result<Availability, ServiceError> {
        observe("check_availability", self.try_check_availability(asset_id, interval).await)
    }

    pub async fn booking(&self, booking_id: &str) -> Result<Booking, ServiceError> {
        let result = self.repository.get_booking(booking_id).await.map_err(ServiceError::from);
        observe("booking", result)
    }

    pub async fn customer_overview(
        &self,
        customer_id: &str,
        limit: Option<u64>,
    ) -> Result<Vec<AssetBookings>, ServiceError> {
        let result = self
            .repository
            .customer_overview(customer_id, limit)
            .await
            .map_err(ServiceError::from);
        observe("customer_overview", result)
    }

    pub async fn customer_bookings(&self, customer_id: &str) -> Result<Vec<Booking>, ServiceError> {
        let result = self
            .repository
            .get_bookings_for_customer(customer_id)
            .await
            .map_err(ServiceError::from);
        observe("customer_bookings", result)
    }

    /// Issue a fresh access token for the booking, valid for `window`
    /// restricted to the booking's own interval.
    pub async fn grant_access(&self, booking_id: &str, window: Interval) -> Result<AccessGrant, ServiceError> {
        observe("grant_access", self.try_grant_access(booking_id, window).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::StaticAssetLookup;
    use crate::store::{RecordedCall, RecordingStore};
    use crate::token::SeededTokens;
    use serde_json::json;

    const NOW: Ms = 1_000_000;

    fn service(store: Arc<RecordingStore>, lookup: StaticAssetLookup) -> BookingService {
        let config = Config::default();
        let repo = BookingRepository::new(store, &config).with_tokens(Arc::new(SeededTokens::new(9)));
        BookingService::new(repo, Arc::new(lookup), Arc::new(FixedClock::new(NOW)), &config)
    }

    #[tokio::test]
    async fn validation_runs_before_any_io() {
        let store = Arc::new(RecordingStore::new());
        let svc = service(store.clone(), StaticAssetLookup::new());

        let inverted = Interval::new(NOW + 20, NOW + 10);
        assert_eq!(
            svc.book("X", "c", inverted).await.unwrap_err(),
            ServiceError::InvalidInterval(inverted)
        );
        assert_eq!(
            svc.book("X", "c", Interval::new(NOW - 1, NOW + 10)).await.unwrap_err(),
            ServiceError::IntervalInPast { start: NOW - 1, now: NOW }
        );
        // unknown asset with a valid interval is the lookup's verdict
        assert_eq!(
            svc.book("X", "c", Interval::new(NOW, NOW + 10)).await.unwrap_err(),
            ServiceError::AssetNotFound("X".into())
        );
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn unexpected_lookup_is_collaborator_failure() {
        let mut lookup = StaticAssetLookup::new();
        lookup.fail(
            "X",
            LookupError::Unexpected {
                status: 500,
                detail: "boom".into(),
            },
        );
        let svc = service(Arc::new(RecordingStore::new()), lookup);
        let err = svc.book("X", "c", Interval::new(NOW, NOW + 1)).await.unwrap_err();
        assert_eq!(err.kind(), "collaborator_assertion_failed");
    }

    #[tokio::test]
    async fn repository_outcomes_are_not_rewritten() {
        let store = Arc::new(RecordingStore::new());
        store.push_update_one(Err(StoreError::DuplicateKey {
            collection: "cars".into(),
            key: "X".into(),
        }));
        store.push_update_one(Err(StoreError::Timeout {
            operation: "update_one",
            after: std::time::Duration::from_millis(5),
        }));
        let svc = service(store, StaticAssetLookup::with_assets(["X"]));
        let i = Interval::new(NOW, NOW + 10);
        assert_eq!(svc.book("X", "c", i).await.unwrap_err(), ServiceError::Conflict("X".into()));
        assert!(matches!(
            svc.book("X", "c", i).await.unwrap_err(),
            ServiceError::Store(StoreError::Timeout { .. })
        ));
        assert!(svc.book("X", "c", i).await.is_ok());
    }

    #[tokio::test]
    async fn queries_accept_past_windows() {
        let store = Arc::new(RecordingStore::new());
        store.push_find(Ok(vec![json!({"_id": "X"})]));
        let svc = service(store, StaticAssetLookup::new());
        let assets = svc.unavailable_assets(Interval::new(0, 10)).await.unwrap();
        assert_eq!(assets, ["X"]);
    }

    #[tokio::test]
    async fn availability_reflects_unavailable_set() {
        let store = Arc::new(RecordingStore::new());
        store.push_find(Ok(vec![json!({"_id": "X"})]));
        let svc = service(store, StaticAssetLookup::with_assets(["X", "Y"]));
        let i = Interval::new(NOW, NOW + 10);
        assert!(!svc.check_availability("X", i).await.unwrap().available);
        let y = svc.check_availability("Y", i).await.unwrap();
        assert!(y.available);
        assert_eq!(y.asset.asset_id, "Y");
        assert_eq!(
            svc.check_availability("Z", i).await.unwrap_err(),
            ServiceError::AssetNotFound("Z".into())
        );
    }

    #[tokio::test]
    async fn grant_is_restricted_to_booking() {
        let store = Arc::new(RecordingStore::new());
        let booking = json!({"_id": "X", "bookings": [{"id": "b1", "customer_id": "c", "start": 100, "end": 200}]});
        store.push_find_one(Ok(Some(booking.clone())));
        store.push_find_one(Ok(Some(booking)));
        let svc = service(store.clone(), StaticAssetLookup::new());

        let grant = svc.grant_access("b1", Interval::new(50, 150)).await.unwrap();
        assert_eq!(grant.interval, Interval::new(100, 150));
        assert_eq!(grant.token.len(), 32);
        let Some(RecordedCall::UpdateOne { update, .. }) = store.last_call() else {
            panic!("expected the grant to be attached");
        };
        assert_eq!(update, crate::query::Update::set("bookings.$.access", json!(grant)));

        let disjoint = Interval::new(300, 400);
        assert_eq!(
            svc.grant_access("b1", disjoint).await.unwrap_err(),
            ServiceError::InvalidInterval(disjoint)
        );
        assert_eq!(
            svc.grant_access("b2", Interval::new(1, 2)).await.unwrap_err(),
            ServiceError::BookingNotFound("b2".into())
        );
    }

    #[test]
    fn fixed_clock_moves_only_when_set() {
        let clock = FixedClock::new(5);
        assert_eq!(clock.now_ms(), 5);
        clock.set(7);
        assert_eq!(clock.now_ms(), 7);
        assert!(SystemClock.now_ms() > 0);
    }
}
