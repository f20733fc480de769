mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::{ConflictArbiter, LockGranularity};
pub use error::BookingError;

pub(crate) use conflict::now_ms;

use std::sync::Arc;

use ulid::Ulid;

use crate::config::Config;
use crate::model::Ms;
use crate::store::{IdentityStore, IntervalStore};

/// Input to [`BookingService::create`]. Bounds are Unix milliseconds and the
/// span is closed on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub user_id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

/// The booking facade: admission goes through the arbiter, everything else
/// goes straight to the stores.
pub struct BookingService {
    pub(super) bookings: Arc<dyn IntervalStore>,
    pub(super) identities: Arc<dyn IdentityStore>,
    pub(super) arbiter: ConflictArbiter,
}

impl BookingService {
    pub fn new(
        bookings: Arc<dyn IntervalStore>,
        identities: Arc<dyn IdentityStore>,
        admission_permits: usize,
        granularity: LockGranularity,
    ) -> Self {
        let arbiter = ConflictArbiter::new(
            bookings.clone(),
            identities.clone(),
            admission_permits,
            granularity,
        );
        Self {
            bookings,
            identities,
            arbiter,
        }
    }

    pub fn from_config(
        bookings: Arc<dyn IntervalStore>,
        identities: Arc<dyn IdentityStore>,
        config: &Config,
    ) -> Self {
        Self::new(
            bookings,
            identities,
            config.admission_permits,
            config.lock_granularity,
        )
    }

    pub fn arbiter(&self) -> &ConflictArbiter {
        &self.arbiter
    }
}
