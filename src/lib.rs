//! Conflict-free booking of time-bounded asset rentals.
//!
//! Bookings of one asset live in a single document. A booking is created by
//! one conditional upsert that matches the asset only when no existing booking
//! overlaps the new interval, so two overlapping bookings can never both land,
//! without transactions or locks above the store.
//!
//! Layers, bottom up: [`model`] values, the [`query`] algebra, the embedded
//! document [`engine`] with its [`wal`], the [`store`] port, the
//! [`repository`], and the [`service`] orchestrator.

pub mod compactor;
pub mod config;
pub mod engine;
pub mod lookup;
pub mod model;
pub mod observability;
pub mod query;
pub mod repository;
pub mod service;
pub mod store;
pub mod token;
pub mod wal;

pub use config::Config;
pub use model::{AccessGrant, AssetBookings, Booking, Interval, Ms};
pub use repository::{BookingRepository, RepositoryError};
pub use service::{Availability, BookingService, Clock, FixedClock, ServiceError, SystemClock};
pub use store::{DocumentStore, EngineStore, RecordingStore, StoreError};
