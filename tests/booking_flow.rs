use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use booker::engine::{BookingError, BookingRequest, BookingService, LockGranularity};
use booker::model::*;
use booker::store::WalStore;
use booker::sweeper::sweep_once;

const H: Ms = 3_600_000;
const DAY: Ms = 1_767_225_600_000;

// ── Test infrastructure ──────────────────────────────────────

fn test_wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("booker_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("bookings.wal")
}

fn open(path: &PathBuf) -> (Arc<WalStore>, BookingService) {
    let store = Arc::new(WalStore::open(path.clone()).unwrap());
    let service = BookingService::new(store.clone(), store.clone(), 5, LockGranularity::PerResource);
    (store, service)
}

async fn seed(service: &BookingService) -> (User, Resource) {
    let user = service
        .create_user(NewUser {
            name: "Martin".into(),
            first_name: Some("Lea".into()),
            phone: Some("+33 6 00 00 00 00".into()),
            email: "lea.martin@example.com".into(),
            password_hash: "$2a$10$abcdef".into(),
            role: None,
        })
        .await
        .unwrap();
    let resource = service
        .create_resource(NewResource {
            name: "Salle Curie".into(),
            kind: "meeting_room".into(),
            description: Some("12 seats, projector".into()),
            location: Some("Building B".into()),
        })
        .await
        .unwrap();
    (user, resource)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn bookings_survive_restart() {
    let path = test_wal_path();
    let (user, resource, kept, cancelled, expired) = {
        let (_store, service) = open(&path);
        let (user, resource) = seed(&service).await;
        let book = |start, end| BookingRequest {
            user_id: user.id,
            resource_id: resource.id,
            start,
            end,
        };
        let kept = service.create(book(DAY + 10 * H, DAY + 11 * H)).await.unwrap();
        let cancelled = service.create(book(DAY + 12 * H, DAY + 13 * H)).await.unwrap();
        let expired = service.create(book(DAY + 2 * H, DAY + 3 * H)).await.unwrap();
        assert!(service.cancel(cancelled.id).await.unwrap());
        service.expire_ended(DAY + 4 * H).await.unwrap();
        (user, resource, kept, cancelled, expired)
    };

    let (_store, service) = open(&path);
    assert_eq!(service.get_user(user.id).await.unwrap(), Some(user.clone()));
    assert_eq!(
        service.find_user_by_email("LEA.MARTIN@example.com").await.unwrap().map(|u| u.id),
        Some(user.id)
    );
    assert_eq!(service.get_resource(resource.id).await.unwrap(), Some(resource.clone()));

    let status = |b: Option<Booking>| b.map(|b| b.status);
    assert_eq!(status(service.get(kept.id).await.unwrap()), Some(BookingStatus::Active));
    assert_eq!(
        status(service.get(cancelled.id).await.unwrap()),
        Some(BookingStatus::Cancelled)
    );
    assert_eq!(status(service.get(expired.id).await.unwrap()), Some(BookingStatus::Expired));

    // The replayed index still arbitrates.
    let clash = service
        .create(BookingRequest {
            user_id: user.id,
            resource_id: resource.id,
            start: DAY + 11 * H,
            end: DAY + 12 * H,
        })
        .await;
    assert_eq!(clash, Err(BookingError::Conflict(kept.id)));
}

#[tokio::test]
async fn compaction_keeps_state_and_shrinks_the_log() {
    let path = test_wal_path();
    let (user, resource) = {
        let (store, service) = open(&path);
        let (user, resource) = seed(&service).await;
        for i in 0..10 {
            let booking = service
                .create(BookingRequest {
                    user_id: user.id,
                    resource_id: resource.id,
                    start: DAY + i * H,
                    end: DAY + i * H + H / 2,
                })
                .await
                .unwrap();
            if i % 2 == 0 {
                service.cancel(booking.id).await.unwrap();
            }
        }
        let before = std::fs::metadata(&path).unwrap().len();
        assert_eq!(store.appends_since_compact().await, 17);

        store.compact().await.unwrap();
        assert_eq!(store.appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
        (user, resource)
    };

    let (_store, service) = open(&path);
    assert_eq!(service.list_by_user(user.id).await.unwrap().len(), 10);
    assert_eq!(service.count_by_status(BookingStatus::Cancelled).await.unwrap(), 5);
    assert_eq!(service.count_by_status(BookingStatus::Active).await.unwrap(), 5);
    assert_eq!(
        service.delete_resource(resource.id).await,
        Err(BookingError::HasBookings(resource.id))
    );
}

#[tokio::test]
async fn sweep_on_durable_store_is_idempotent() {
    let path = test_wal_path();
    let (_store, service) = open(&path);
    let (user, resource) = seed(&service).await;
    let now = DAY + 48 * H;
    service
        .create(BookingRequest {
            user_id: user.id,
            resource_id: resource.id,
            start: DAY,
            end: DAY + H,
        })
        .await
        .unwrap();

    let first = sweep_once(&service, now).await.unwrap();
    assert_eq!(first.expired, 1);
    let snapshot = service.list_all().await.unwrap();

    let second = sweep_once(&service, now).await.unwrap();
    assert_eq!(second.expired, 0);
    assert_eq!(service.list_all().await.unwrap(), snapshot);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_on_durable_store_admit_one() {
    let path = test_wal_path();
    let (_store, service) = open(&path);
    let (user, resource) = seed(&service).await;
    let service = Arc::new(service);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let service = service.clone();
            let (user_id, resource_id) = (user.id, resource.id);
            tokio::spawn(async move {
                service
                    .create(BookingRequest {
                        user_id,
                        resource_id,
                        start: DAY,
                        end: DAY + H,
                    })
                    .await
            })
        })
        .collect();
    let outcomes: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, BookingError::Conflict(_))));
    drop(service);

    let (_store, reopened) = open(&path);
    assert_eq!(reopened.list_by_resource(resource.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn abandoned_create_is_durable_and_still_blocks() {
    use futures::FutureExt;

    let path = test_wal_path();
    let (user, resource) = {
        let (_store, service) = open(&path);
        let (user, resource) = seed(&service).await;
        let book = |start, end| BookingRequest {
            user_id: user.id,
            resource_id: resource.id,
            start,
            end,
        };

        // The caller goes away before the log write is acknowledged.
        assert!(service.create(book(DAY, DAY + H)).now_or_never().is_none());

        let clash = service.create(book(DAY + H / 2, DAY + 2 * H)).await;
        let live = service.list_by_resource(resource.id).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(clash, Err(BookingError::Conflict(live[0].id)));
        (user, resource)
    };

    let (_store, service) = open(&path);
    let replayed = service.list_by_resource(resource.id).await.unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].user_id, user.id);
    assert_eq!(replayed[0].status, BookingStatus::Active);
}

#[tokio::test]
async fn abandoned_cancel_matches_after_restart() {
    use futures::FutureExt;

    let path = test_wal_path();
    let (booking, seen) = {
        let (store, service) = open(&path);
        let (user, resource) = seed(&service).await;
        let booking = service
            .create(BookingRequest {
                user_id: user.id,
                resource_id: resource.id,
                start: DAY,
                end: DAY + H,
            })
            .await
            .unwrap();

        assert!(service.cancel(booking.id).now_or_never().is_none());
        // Acked after every append queued before it.
        store.appends_since_compact().await;
        let seen = service.get(booking.id).await.unwrap().map(|b| b.status);
        assert_eq!(seen, Some(BookingStatus::Cancelled));
        assert!(!service.cancel(booking.id).await.unwrap());
        (booking, seen)
    };

    let (_store, service) = open(&path);
    assert_eq!(service.get(booking.id).await.unwrap().map(|b| b.status), seen);
}
