use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// A referenced user, resource or booking does not exist.
    NotFound(Ulid),
    /// Overlaps the ACTIVE booking with this id.
    Conflict(Ulid),
    InvalidInput(&'static str),
    /// The resource exists but is flagged as not bookable.
    ResourceUnavailable(Ulid),
    /// Deletion refused: the resource still has bookings.
    HasBookings(Ulid),
    AlreadyExists(String),
    /// The backing store could not serve the request.
    Unavailable(String),
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::NotFound(id) => write!(f, "not found: {id}"),
            BookingError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            BookingError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            BookingError::ResourceUnavailable(id) => {
                write!(f, "resource {id} is not available for booking")
            }
            BookingError::HasBookings(id) => {
                write!(f, "cannot delete resource {id}: has bookings")
            }
            BookingError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            BookingError::Unavailable(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::NotFound(id),
            StoreError::Duplicate(what) => BookingError::AlreadyExists(what),
            unavailable @ StoreError::Unavailable(_) => {
                BookingError::Unavailable(unavailable.to_string())
            }
        }
    }
}
