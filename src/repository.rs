//! Booking persistence on top of a [`DocumentStore`].
//!
//! Bookings live inside one document per asset (see [`AssetBookings`]).
//! Creating a booking is a single conditional upsert: the store matches the
//! asset only if none of its bookings overlaps the new interval, and pushes
//! the booking in the same atomic step. When the match fails because of an
//! overlap, the upsert falls back to inserting a fresh document with the same
//! `_id`, which the store rejects as a duplicate key. That rejection, and only
//! at this call site, means "conflicting booking".

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::model::{AccessGrant, AssetBookings, Booking, Interval};
use crate::observability::{BOOKING_CONFLICTS_TOTAL, BOOKINGS_CREATED_TOTAL};
use crate::query::{Filter, ID_FIELD, Pipeline, Projection, Sort, Update};
use crate::store::{Document, DocumentStore, FindOptions, StoreError, Upsert};
use crate::token::{ThreadRngTokens, TokenSource};

const BOOKINGS: &str = "bookings";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The asset already has a booking overlapping the requested interval.
    Conflict { asset_id: String },
    BookingNotFound { booking_id: String },
    Store(StoreError),
}

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepositoryError::Conflict { asset_id } => {
                write!(f, "asset {asset_id} already has an overlapping booking")
            }
            RepositoryError::BookingNotFound { booking_id } => write!(f, "booking {booking_id} not found"),
            RepositoryError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RepositoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RepositoryError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for RepositoryError {
    fn from(e: StoreError) -> Self {
        RepositoryError::Store(e)
    }
}

fn decode<T: DeserializeOwned>(doc: Document) -> Result<T, RepositoryError> {
    serde_json::from_value(doc).map_err(|e| RepositoryError::Store(StoreError::Decode(e.to_string())))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, RepositoryError> {
    serde_json::to_value(value).map_err(|e| RepositoryError::Store(StoreError::Encode(e.to_string())))
}

/// Elements of `bookings` overlapping `interval` under the open rule.
fn overlapping(interval: &Interval) -> Filter {
    Filter::and([Filter::lt("start", interval.end), Filter::gt("end", interval.start)])
}

fn with_booking(booking_id: &str) -> Filter {
    Filter::elem_match(BOOKINGS, Filter::eq("id", booking_id))
}

pub struct BookingRepository {
    store: Arc<dyn DocumentStore>,
    tokens: Arc<dyn TokenSource>,
    collection: String,
    booking_id_len: usize,
}

impl BookingRepository {
    pub fn new(store: Arc<dyn DocumentStore>, config: &Config) -> Self {
        Self {
            store,
            tokens: Arc::new(ThreadRngTokens),
            collection: config.collection.clone(),
            booking_id_len: config.booking_id_len,
        }
    }

    /// Replace the source of booking identifiers.
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    pub(crate) fn tokens(&self) -> &Arc<dyn TokenSource> {
        &self.tokens
    }

    /// Book `interval` on `asset_id` for `customer_id`.
    ///
    /// The first successful booking of an asset creates its document; there
    /// is no separate "create asset" step.
    pub async fn create_booking(
        &self,
        asset_id: &str,
        customer_id: &str,
        interval: Interval,
    ) -> Result<Booking, RepositoryError> {
        let booking = Booking::new(self.tokens.token(self.booking_id_len), customer_id, interval);
        let filter = Filter::and([
            Filter::eq(ID_FIELD, asset_id),
            Filter::not(Filter::elem_match(BOOKINGS, overlapping(&interval))),
        ]);
        let element = encode(&booking)?;
        let update = Update::push(BOOKINGS, element);

        match self
            .store
            .update_one(&self.collection, &filter, &update, Upsert::Yes)
            .await
        {
            Ok(outcome) => {
                metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
                info!(
                    asset_id,
                    booking_id = %booking.id,
                    customer_id,
                    created_asset = outcome.upserted_id.is_some(),
                    "booking created"
                );
                Ok(booking)
            }
            Err(StoreError::DuplicateKey { .. }) => {
                metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
                debug!(asset_id, customer_id, "booking rejected: overlapping booking exists");
                Err(RepositoryError::Conflict {
                    asset_id: asset_id.to_string(),
                })
            }
            Err(e) => Err(RepositoryError::Store(e)),
        }
    }

    /// Identities of assets with at least one booking overlapping `interval`.
    pub async fn get_unavailable_assets(&self, interval: Interval) -> Result<Vec<String>, RepositoryError> {
        let filter = Filter::elem_match(BOOKINGS, overlapping(&interval));
        let docs = self
            .store
            .find(&self.collection, &filter, &FindOptions::projected(Projection::IdOnly))
            .await?;
        docs.into_iter()
            .map(|doc| match doc.get(ID_FIELD) {
                Some(Value::String(id)) => Ok(id.clone()),
                _ => Err(RepositoryError::Store(StoreError::Decode(
                    "asset document without a string _id".into(),
                ))),
            })
            .collect()
    }

    pub async fn get_booking(&self, booking_id: &str) -> Result<Booking, RepositoryError> {
        let doc = self
            .store
            .find_one(&self.collection, &with_booking(booking_id), Some(&Projection::field(BOOKINGS)))
            .await?;
        let not_found = || RepositoryError::BookingNotFound {
            booking_id: booking_id.to_string(),
        };
        let asset: AssetBookings = decode(doc.ok_or_else(not_found)?)?;
        asset
            .bookings
            .into_iter()
            .find(|b| b.id == booking_id)
            .ok_or_else(not_found)
    }

    /// Assets holding bookings of `customer_id`, each with only that customer's
    /// bookings in ascending start order. A positive `limit` caps the number
    /// of bookings across all assets; assets are ordered by their earliest
    /// returned booking.
    pub async fn customer_overview(
        &self,
        customer_id: &str,
        limit: Option<u64>,
    ) -> Result<Vec<AssetBookings>, RepositoryError> {
        let pipeline = Pipeline::array_flatten_filter_limit(
            BOOKINGS,
            &Filter::eq("customer_id", customer_id),
            limit,
            Some(&Sort::asc("start")),
        );
        let docs = self.store.aggregate(&self.collection, &pipeline).await?;
        docs.into_iter().map(decode).collect()
    }

    /// Every booking of `customer_id` across all assets, earliest first.
    pub async fn get_bookings_for_customer(&self, customer_id: &str) -> Result<Vec<Booking>, RepositoryError> {
        let mut bookings: Vec<Booking> = self
            .customer_overview(customer_id, None)
            .await?
            .into_iter()
            .flat_map(|asset| asset.bookings)
            .collect();
        // documents are ordered by their first booking only
        bookings.sort_by_key(|b| b.interval.start);
        Ok(bookings)
    }

    /// Store `grant` on the booking, replacing any previous grant.
    pub async fn attach_access_grant(&self, booking_id: &str, grant: &AccessGrant) -> Result<(), RepositoryError> {
        let value = encode(grant)?;
        let outcome = self
            .store
            .update_one(
                &self.collection,
                &with_booking(booking_id),
                &Update::set(format!("{BOOKINGS}.$.access"), value),
                Upsert::No,
            )
            .await?;
        if outcome.matched == 0 {
            return Err(RepositoryError::BookingNotFound {
                booking_id: booking_id.to_string(),
            });
        }
        info!(booking_id, "access grant attached");
        Ok(())
    }
}
