use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::locks::{KeyedGuard, KeyedLocks};
use crate::model::*;
use crate::observability::*;
use crate::store::{IdentityStore, IntervalStore};

use super::BookingError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, BookingError> {
    use crate::limits::*;
    if start >= end {
        return Err(BookingError::InvalidInput("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(BookingError::InvalidInput("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(BookingError::InvalidInput("booking too long"));
    }
    Ok(Span::new(start, end))
}

/// Scope of the mutual exclusion around check-and-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockGranularity {
    /// One critical section shared by every resource.
    Global,
    /// One critical section per resource.
    #[default]
    PerResource,
}

impl std::str::FromStr for LockGranularity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(LockGranularity::Global),
            "resource" | "per-resource" | "per_resource" => Ok(LockGranularity::PerResource),
            _ => Err(()),
        }
    }
}

/// Held across the overlap read and the insert; dropping it ends the
/// critical section.
pub(crate) struct CriticalSection<'a> {
    _global: Option<MutexGuard<'a, ()>>,
    _resource: Option<KeyedGuard<'a>>,
}

struct WaitingGauge;

impl WaitingGauge {
    fn enter() -> Self {
        metrics::gauge!(ADMISSION_WAITING).increment(1.0);
        WaitingGauge
    }
}

impl Drop for WaitingGauge {
    fn drop(&mut self) {
        metrics::gauge!(ADMISSION_WAITING).decrement(1.0);
    }
}

/// State the critical sections run against. Owned by spawned tasks, so a
/// section always runs to completion even when its caller goes away.
struct Sections {
    bookings: Arc<dyn IntervalStore>,
    identities: Arc<dyn IdentityStore>,
    granularity: LockGranularity,
    global: Mutex<()>,
    per_resource: KeyedLocks,
}

impl Sections {
    async fn enter(&self, resource_id: Ulid) -> CriticalSection<'_> {
        match self.granularity {
            LockGranularity::Global => CriticalSection {
                _global: Some(self.global.lock().await),
                _resource: None,
            },
            LockGranularity::PerResource => CriticalSection {
                _global: None,
                _resource: Some(self.per_resource.lock(resource_id).await),
            },
        }
    }

    async fn check_and_insert(
        &self,
        user_id: Ulid,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Booking, BookingError> {
        let user = self
            .identities
            .find_user_by_id(user_id)
            .await?
            .ok_or(BookingError::NotFound(user_id))?;
        let resource = self
            .identities
            .find_resource_by_id(resource_id)
            .await?
            .ok_or(BookingError::NotFound(resource_id))?;
        if !resource.available {
            return Err(BookingError::ResourceUnavailable(resource.id));
        }

        if let Some(existing) = self.bookings.find_overlap(resource.id, span).await? {
            return Err(BookingError::Conflict(existing));
        }
        let booking = self
            .bookings
            .insert(NewBooking {
                user_id: user.id,
                resource_id: resource.id,
                span,
            })
            .await?;
        Ok(booking)
    }
}

fn section_lost(e: JoinError) -> BookingError {
    BookingError::Unavailable(format!("critical section did not finish: {e}"))
}

/// Admits a booking iff no ACTIVE booking on the same resource overlaps it.
///
/// Two layers guard each attempt:
/// 1. A counting semaphore bounds how many attempts are in flight at once
///    (backpressure only).
/// 2. A mutex, global or per resource, makes the overlap read and the insert
///    one atomic step. This is what keeps ACTIVE bookings disjoint.
///
/// Once a permit is granted, the section runs on its own task holding both
/// guards. Dropping the caller's future never releases the lock between the
/// overlap read and the insert becoming visible.
pub struct ConflictArbiter {
    sections: Arc<Sections>,
    gate: Arc<Semaphore>,
    permits: usize,
}

impl ConflictArbiter {
    pub fn new(
        bookings: Arc<dyn IntervalStore>,
        identities: Arc<dyn IdentityStore>,
        permits: usize,
        granularity: LockGranularity,
    ) -> Self {
        let permits = permits.max(1);
        Self {
            sections: Arc::new(Sections {
                bookings,
                identities,
                granularity,
                global: Mutex::new(()),
                per_resource: KeyedLocks::new(),
            }),
            gate: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    pub fn capacity(&self) -> usize {
        self.permits
    }

    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn granularity(&self) -> LockGranularity {
        self.sections.granularity
    }

    /// Run `work` inside the critical section covering `resource_id`, for
    /// anything that must not interleave with an admission on that resource.
    /// `work` runs to completion on its own task.
    pub(crate) async fn exclusive<T, F, Fut>(&self, resource_id: Ulid, work: F) -> Result<T, BookingError>
    where
        F: FnOnce(Arc<dyn IdentityStore>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BookingError>> + Send + 'static,
        T: Send + 'static,
    {
        let sections = self.sections.clone();
        tokio::spawn(async move {
            let _section = sections.enter(resource_id).await;
            work(sections.identities.clone()).await
        })
        .await
        .map_err(section_lost)?
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, BookingError> {
        let _waiting = WaitingGauge::enter();
        self.gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BookingError::Unavailable("admission gate closed".into()))
    }

    pub async fn try_book(
        &self,
        user_id: Ulid,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Booking, BookingError> {
        let started = Instant::now();
        let result = self.admit_and_insert(user_id, resource_id, span).await;
        metrics::histogram!(ARBITRATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(booking) => {
                metrics::counter!(BOOKINGS_ADMITTED_TOTAL).increment(1);
                debug!(
                    "admitted booking {} on {resource_id} [{}, {}]",
                    booking.id, span.start, span.end
                );
            }
            Err(e) => {
                metrics::counter!(BOOKINGS_REJECTED_TOTAL, "reason" => rejection_label(e))
                    .increment(1);
                if matches!(e, BookingError::Unavailable(_)) {
                    warn!("booking on {resource_id} failed: {e}");
                } else {
                    debug!("booking on {resource_id} refused: {e}");
                }
            }
        }
        result
    }

    async fn admit_and_insert(
        &self,
        user_id: Ulid,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Booking, BookingError> {
        let permit = self.admit().await?;
        let sections = self.sections.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _section = sections.enter(resource_id).await;
            sections.check_and_insert(user_id, resource_id, span).await
        })
        .await
        .map_err(section_lost)?
    }
}
