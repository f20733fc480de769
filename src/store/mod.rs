//! Persistence seams for the booking core.
//!
//! `IntervalStore` holds booking records, `IdentityStore` holds users and
//! resources. The service only talks to these traits, so one process can run
//! on the write-ahead-logged store while tests swap in [`MemoryStore`] or a
//! fault-injecting fake.

mod durable;
mod memory;

pub use durable::{run_compactor, WalStore};
pub use memory::MemoryStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or failed to persist.
    Unavailable(String),
    NotFound(Ulid),
    /// A uniqueness constraint was violated (e.g. user email).
    Duplicate(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::Duplicate(what) => write!(f, "duplicate: {what}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Outcome of a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The booking was ACTIVE and now holds the requested status.
    Applied,
    /// The booking was already terminal; it keeps this status.
    Unchanged(BookingStatus),
    Missing,
}

#[async_trait]
pub trait IntervalStore: Send + Sync {
    /// Persist a new ACTIVE booking and assign its id.
    async fn insert(&self, booking: NewBooking) -> Result<Booking, StoreError>;

    /// Atomically move an ACTIVE booking to `status`. Terminal bookings are
    /// left as they are, so the first terminal write wins.
    async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<Transition, StoreError>;

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;
    async fn find_by_user(&self, user_id: Ulid) -> Result<Vec<Booking>, StoreError>;
    async fn find_by_resource(&self, resource_id: Ulid) -> Result<Vec<Booking>, StoreError>;
    async fn find_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, StoreError>;
    async fn find_all(&self) -> Result<Vec<Booking>, StoreError>;

    /// ACTIVE bookings whose span ended strictly before `t`.
    async fn find_ending_before(&self, t: Ms) -> Result<Vec<Booking>, StoreError>;

    /// First ACTIVE booking on `resource_id` overlapping `span` (closed bounds).
    async fn find_overlap(&self, resource_id: Ulid, span: Span) -> Result<Option<Ulid>, StoreError>;

    async fn exists_overlap(&self, resource_id: Ulid, span: Span) -> Result<bool, StoreError> {
        Ok(self.find_overlap(resource_id, span).await?.is_some())
    }

    async fn count_by_status(&self, status: BookingStatus) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_user_by_id(&self, id: Ulid) -> Result<Option<User>, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_resource_by_id(&self, id: Ulid) -> Result<Option<Resource>, StoreError>;

    /// True if any booking, whatever its status, references the resource.
    async fn resource_has_any_booking(&self, resource_id: Ulid) -> Result<bool, StoreError>;

    /// Fails with `Duplicate` if the email is taken.
    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError>;
    async fn set_user_role(&self, id: Ulid, role: Role) -> Result<(), StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
    async fn count_users(&self) -> Result<u64, StoreError>;

    async fn insert_resource(&self, resource: NewResource) -> Result<Resource, StoreError>;
    async fn set_resource_available(&self, id: Ulid, available: bool) -> Result<(), StoreError>;
    /// Unconditional; the booking guard is the caller's job.
    async fn delete_resource(&self, id: Ulid) -> Result<(), StoreError>;
    async fn list_resources(&self) -> Result<Vec<Resource>, StoreError>;
    async fn count_resources(&self) -> Result<u64, StoreError>;
}
