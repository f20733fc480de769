use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::locks::KeyedLocks;
use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::memory::{MemoryStore, StatusPlan};
use super::{IdentityStore, IntervalStore, StoreError, Transition};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    /// Acked with whether the event changed state once it is synced and applied.
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<bool>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<bool>>);

/// Owns the journal and is the only writer of the in-memory state behind a
/// [`WalStore`]. Each wakeup drains every append already queued, commits them
/// with a single fsync, then applies them in journal order before acking. A
/// non-append command ends the batch and runs after it.
///
/// Memory is therefore always the replay of the synced journal, whether or
/// not the caller that queued an event is still waiting for the ack.
async fn wal_writer_loop(mut wal: Wal, mem: Arc<MemoryStore>, mut rx: mpsc::Receiver<WalCommand>) {
    let mut halted: Option<String> = None;
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, &mem, cmd, &mut halted);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mem, batch, &mut halted);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, &mem, cmd, &mut halted);
        }
    }
    debug!("booking journal writer stopped");
}

fn halted_error(reason: &str) -> io::Error {
    io::Error::other(format!("booking journal halted: {reason}"))
}

fn commit_batch(wal: &mut Wal, mem: &MemoryStore, batch: Vec<PendingAppend>, halted: &mut Option<String>) {
    if let Some(reason) = halted.as_deref() {
        for (_, tx) in batch {
            let _ = tx.send(Err(halted_error(reason)));
        }
        return;
    }

    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = write_batch(wal, &batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            for (event, tx) in batch {
                let applied = mem.apply_event(&event);
                let _ = tx.send(Ok(applied));
            }
        }
        Err(e) => {
            error!("booking journal write failed, dropping batch of {}: {e}", batch.len());
            // None of the batch may survive on disk: its callers all get Err.
            if let Err(cut) = wal.rollback() {
                error!("could not roll back {}, refusing further writes: {cut}", wal.path().display());
                *halted = Some(cut.to_string());
            }
            for (_, tx) in batch {
                let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string())));
            }
        }
    }
}

fn write_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    for (event, _) in batch {
        wal.append_buffered(event)?;
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, mem: &MemoryStore, cmd: WalCommand, halted: &mut Option<String>) {
    match cmd {
        WalCommand::Compact { response } => {
            if let Some(reason) = halted.as_deref() {
                let _ = response.send(Err(halted_error(reason)));
                return;
            }
            let snapshot = mem.snapshot();
            let result = Wal::write_compact_file(wal.path(), &snapshot).and_then(|()| {
                wal.swap_compact_file().inspect_err(|e| {
                    error!("journal swap failed, refusing further writes: {e}");
                    *halted = Some(e.to_string());
                })
            });
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Durable store: every mutation is journaled, fsynced, then applied to an
/// embedded [`MemoryStore`] by the journal writer. Reads never touch the file.
pub struct WalStore {
    mem: Arc<MemoryStore>,
    wal_tx: mpsc::Sender<WalCommand>,
    path: PathBuf,
    status_locks: KeyedLocks,
    identity_lock: Mutex<()>,
}

impl WalStore {
    /// Replay the journal at `path` and start its writer task. Needs a running
    /// tokio runtime.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&path)?;
        let wal = Wal::open(&path)?;

        let mem = Arc::new(MemoryStore::new());
        for event in &events {
            mem.apply_event(event);
        }
        info!("replayed {} events from {}", events.len(), path.display());

        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, mem.clone(), wal_rx));

        Ok(Self {
            mem,
            wal_tx,
            path,
            status_locks: KeyedLocks::new(),
            identity_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an event and wait for the writer's ack. Once queued, the event is
    /// committed and applied even if this future is dropped.
    async fn persist(&self, event: Event) -> Result<bool, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL error: {e}")))
    }

    /// Rewrite the journal as a snapshot of the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction: {e}")))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Compact the log whenever enough appends have piled up since the last run.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(COMPACT_CHECK_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let appended = store.appends_since_compact().await;
        if appended < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted {} after {appended} appends", store.path().display()),
            Err(e) => warn!("compaction of {} failed: {e}", store.path().display()),
        }
    }
}

#[async_trait]
impl IntervalStore for WalStore {
    async fn insert(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let booking = self.mem.plan_booking(booking);
        self.persist(Event::BookingCreated { booking: booking.clone() })
            .await?;
        Ok(booking)
    }

    async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<Transition, StoreError> {
        let _g = self.status_locks.lock(id).await;
        match self.mem.plan_status(id, status) {
            StatusPlan::Skip(t) => Ok(t),
            StatusPlan::Write(event) => {
                if self.persist(event).await? {
                    return Ok(Transition::Applied);
                }
                Ok(match self.mem.booking(&id) {
                    Some(b) => Transition::Unchanged(b.status),
                    None => Transition::Missing,
                })
            }
        }
    }

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.mem.booking(&id))
    }

    async fn find_by_user(&self, user_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        Ok(self.mem.bookings_of_user(&user_id))
    }

    async fn find_by_resource(&self, resource_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        Ok(self.mem.bookings_of_resource(&resource_id))
    }

    async fn find_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, StoreError> {
        Ok(self.mem.bookings_matching(|b| b.status == status))
    }

    async fn find_all(&self) -> Result<Vec<Booking>, StoreError> {
        Ok(self.mem.bookings_matching(|_| true))
    }

    async fn find_ending_before(&self, t: Ms) -> Result<Vec<Booking>, StoreError> {
        Ok(self.mem.bookings_matching(|b| b.is_active() && b.span.ends_before(t)))
    }

    async fn find_overlap(&self, resource_id: Ulid, span: Span) -> Result<Option<Ulid>, StoreError> {
        Ok(self.mem.first_active_overlap(&resource_id, &span))
    }

    async fn count_by_status(&self, status: BookingStatus) -> Result<u64, StoreError> {
        self.mem.count_by_status(status).await
    }
}

#[async_trait]
impl IdentityStore for WalStore {
    async fn find_user_by_id(&self, id: Ulid) -> Result<Option<User>, StoreError> {
        Ok(self.mem.user(&id))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.mem.user_by_email(email))
    }

    async fn find_resource_by_id(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.mem.resource(&id))
    }

    async fn resource_has_any_booking(&self, resource_id: Ulid) -> Result<bool, StoreError> {
        Ok(self.mem.has_bookings(&resource_id))
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        let _g = self.identity_lock.lock().await;
        let user = self.mem.plan_user(user)?;
        if !self.persist(Event::UserCreated { user: user.clone() }).await? {
            return Err(StoreError::Duplicate(format!("email {}", user.email)));
        }
        Ok(user)
    }

    async fn set_user_role(&self, id: Ulid, role: Role) -> Result<(), StoreError> {
        let event = self.mem.plan_role(id, role)?;
        self.persist(event).await.map(drop)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.mem.users())
    }

    async fn count_users(&self) -> Result<u64, StoreError> {
        Ok(self.mem.user_count() as u64)
    }

    async fn insert_resource(&self, resource: NewResource) -> Result<Resource, StoreError> {
        let resource = self.mem.plan_resource(resource);
        self.persist(Event::ResourceCreated { resource: resource.clone() })
            .await?;
        Ok(resource)
    }

    async fn set_resource_available(&self, id: Ulid, available: bool) -> Result<(), StoreError> {
        let event = self.mem.plan_availability(id, available)?;
        self.persist(event).await.map(drop)
    }

    async fn delete_resource(&self, id: Ulid) -> Result<(), StoreError> {
        let event = self.mem.plan_resource_delete(id)?;
        self.persist(event).await.map(drop)
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, StoreError> {
        Ok(self.mem.resources())
    }

    async fn count_resources(&self) -> Result<u64, StoreError> {
        Ok(self.mem.resource_count() as u64)
    }
}
