use std::net::SocketAddr;

use crate::engine::BookingError;

// ── Arbitration ─────────────────────────────────────────────────

/// Counter: bookings admitted.
pub const BOOKINGS_ADMITTED_TOTAL: &str = "booker_bookings_admitted_total";

/// Counter: booking attempts refused. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "booker_bookings_rejected_total";

/// Counter: bookings moved to CANCELLED.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "booker_bookings_cancelled_total";

/// Histogram: gate wait + check + insert, in seconds.
pub const ARBITRATION_DURATION_SECONDS: &str = "booker_arbitration_duration_seconds";

/// Gauge: attempts waiting for an admission permit.
pub const ADMISSION_WAITING: &str = "booker_admission_waiting";

// ── Expiration sweep ────────────────────────────────────────────

/// Counter: bookings moved to EXPIRED.
pub const SWEEP_EXPIRED_TOTAL: &str = "booker_sweep_expired_total";

/// Counter: failed sweeps (whole-run) and failed per-booking updates. Labels: scope.
pub const SWEEP_FAILURES_TOTAL: &str = "booker_sweep_failures_total";

/// Histogram: sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "booker_sweep_duration_seconds";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "booker_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "booker_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Short label for a refused booking.
pub fn rejection_label(err: &BookingError) -> &'static str {
    match err {
        BookingError::NotFound(_) => "not_found",
        BookingError::Conflict(_) => "conflict",
        BookingError::InvalidInput(_) => "invalid_input",
        BookingError::ResourceUnavailable(_) => "resource_unavailable",
        BookingError::HasBookings(_) => "has_bookings",
        BookingError::AlreadyExists(_) => "already_exists",
        BookingError::Unavailable(_) => "store_unavailable",
    }
}
