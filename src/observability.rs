use crate::service::ServiceError;

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "fleetbook_bookings_created_total";

/// Counter: booking attempts rejected because of an overlapping booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "fleetbook_booking_conflicts_total";

/// Counter: orchestrator errors. Labels: kind.
pub const SERVICE_ERRORS_TOTAL: &str = "fleetbook_service_errors_total";

// ── Store ───────────────────────────────────────────────────────

/// Histogram: document store call latency in seconds. Labels: op.
pub const STORE_OP_DURATION_SECONDS: &str = "fleetbook_store_op_duration_seconds";

/// Counter: failed document store calls. Labels: op.
pub const STORE_ERRORS_TOTAL: &str = "fleetbook_store_errors_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetbook_wal_flush_batch_size";

/// Count an orchestrator error under its kind label.
pub fn record_service_error(err: &ServiceError) {
    metrics::counter!(SERVICE_ERRORS_TOTAL, "kind" => err.kind()).increment(1);
}
