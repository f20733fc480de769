use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::engine::{now_ms, BookingService};
use crate::model::Ms;
use crate::observability::*;

/// Tally of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// ACTIVE bookings whose end was before the cutoff.
    pub examined: usize,
    pub expired: usize,
    /// Made terminal by a concurrent writer before the sweep got to them.
    pub skipped: usize,
    pub failed: usize,
}

/// Run one sweep against `now`. Returns `None` when the ended bookings could
/// not even be listed; that failure is logged and the next tick retries.
pub async fn sweep_once(service: &BookingService, now: Ms) -> Option<SweepReport> {
    let started = Instant::now();
    let result = service.expire_ended(now).await;
    metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    match result {
        Ok(report) => {
            info!(
                "sweep expired {} of {} ended bookings ({} skipped, {} failed)",
                report.expired, report.examined, report.skipped, report.failed
            );
            Some(report)
        }
        Err(e) => {
            metrics::counter!(SWEEP_FAILURES_TOTAL, "scope" => "sweep").increment(1);
            error!("expiration sweep failed: {e}");
            None
        }
    }
}

/// Background task that expires ended bookings once per `period`. The first
/// sweep runs immediately.
pub async fn run_sweeper(service: Arc<BookingService>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sweep_once(&service, now_ms()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BookingRequest, LockGranularity};
    use crate::model::*;
    use crate::store::MemoryStore;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    async fn seeded() -> (Arc<BookingService>, Ulid, Ulid) {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(BookingService::new(
            store.clone(),
            store,
            5,
            LockGranularity::PerResource,
        ));
        let user = service
            .create_user(NewUser {
                name: "Sweep".into(),
                first_name: None,
                phone: None,
                email: "sweep@example.com".into(),
                password_hash: "x".into(),
                role: None,
            })
            .await
            .unwrap();
        let resource = service
            .create_resource(NewResource {
                name: "Room".into(),
                kind: "room".into(),
                description: None,
                location: None,
            })
            .await
            .unwrap();
        (service, user.id, resource.id)
    }

    #[tokio::test]
    async fn sweep_once_reports_expired() {
        let (service, user_id, resource_id) = seeded().await;
        let now = now_ms();
        let past = service
            .create(BookingRequest {
                user_id,
                resource_id,
                start: now - 3 * H,
                end: now - 2 * H,
            })
            .await
            .unwrap();
        service
            .create(BookingRequest {
                user_id,
                resource_id,
                start: now + H,
                end: now + 2 * H,
            })
            .await
            .unwrap();

        let report = sweep_once(&service, now).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 1,
                expired: 1,
                skipped: 0,
                failed: 0
            }
        );
        let past = service.get(past.id).await.unwrap().unwrap();
        assert_eq!(past.status, BookingStatus::Expired);

        let again = sweep_once(&service, now).await.unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn background_sweeper_expires_without_being_asked() {
        let (service, user_id, resource_id) = seeded().await;
        let now = now_ms();
        let booking = service
            .create(BookingRequest {
                user_id,
                resource_id,
                start: now - 2 * H,
                end: now - H,
            })
            .await
            .unwrap();

        let task = tokio::spawn(run_sweeper(service.clone(), Duration::from_millis(20)));
        let mut status = BookingStatus::Active;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = service.get(booking.id).await.unwrap().unwrap().status;
            if status == BookingStatus::Expired {
                break;
            }
        }
        task.abort();
        assert_eq!(status, BookingStatus::Expired);
    }
}
