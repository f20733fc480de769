use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Closed interval `[start, end]`.
///
/// Both bounds belong to the interval, so a span ending at `t` and another
/// starting at `t` overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `s1 <= e2 && e1 >= s2`
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn ends_before(&self, t: Ms) -> bool {
        self.end < t
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BookingStatus::Active)
    }

    /// ACTIVE may move to either terminal state; terminal states never move.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        self == BookingStatus::Active && next.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }
}

/// A booking the arbiter has admitted but the store has not yet numbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBooking {
    pub user_id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Client,
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "CLIENT" => Ok(Role::Client),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub first_name: Option<String>,
    pub phone: Option<String>,
    pub email: String,
    /// Opaque credential hash; hashing happens before the core sees it.
    pub password_hash: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub name: String,
    pub first_name: Option<String>,
    pub phone: Option<String>,
    pub email: String,
    pub password_hash: String,
    /// Defaults to `Role::Client` when absent.
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
    pub available: bool,
    pub description: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResource {
    pub name: String,
    pub kind: String,
    pub description: Option<String>,
    pub location: Option<String>,
}

/// The event types, flat, no nesting beyond whole records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated {
        user: User,
    },
    UserRoleChanged {
        id: Ulid,
        role: Role,
    },
    ResourceCreated {
        resource: Resource,
    },
    ResourceAvailabilityChanged {
        id: Ulid,
        available: bool,
    },
    ResourceDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
    },
}
