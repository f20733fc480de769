use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::{IdentityStore, IntervalStore, StoreError, Transition};

/// Result of checking a status change against current state.
pub(crate) enum StatusPlan {
    Write(Event),
    Skip(Transition),
}

/// Booking and identity tables held in concurrent maps.
///
/// All mutations go through [`MemoryStore::apply_event`], which is also how
/// [`super::WalStore`] rebuilds state from its log.
pub struct MemoryStore {
    bookings: DashMap<Ulid, Booking>,
    /// resource id → `(span, booking id)` sorted by `span.start`
    by_resource: DashMap<Ulid, Vec<(Span, Ulid)>>,
    by_user: DashMap<Ulid, Vec<Ulid>>,
    users: DashMap<Ulid, User>,
    /// lowercased email → user id
    emails: DashMap<String, Ulid>,
    resources: DashMap<Ulid, Resource>,
    /// Serializes email-uniqueness check and insert when used standalone.
    identity_write: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_bookings(mut v: Vec<Booking>) -> Vec<Booking> {
    v.sort_by_key(|b| (b.span.start, b.id));
    v
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            by_resource: DashMap::new(),
            by_user: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            resources: DashMap::new(),
            identity_write: Mutex::new(()),
        }
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(&email.to_lowercase())?;
        self.user(&id)
    }

    pub fn resource(&self, id: &Ulid) -> Option<Resource> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn bookings_of_resource(&self, resource_id: &Ulid) -> Vec<Booking> {
        let ids: Vec<Ulid> = match self.by_resource.get(resource_id) {
            Some(slots) => slots.iter().map(|(_, id)| *id).collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.booking(id)).collect()
    }

    pub fn bookings_of_user(&self, user_id: &Ulid) -> Vec<Booking> {
        let ids = match self.by_user.get(user_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        sort_bookings(ids.iter().filter_map(|id| self.booking(id)).collect())
    }

    pub fn bookings_matching(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        sort_bookings(
            self.bookings
                .iter()
                .filter(|e| pred(e.value()))
                .map(|e| e.value().clone())
                .collect(),
        )
    }

    pub fn has_bookings(&self, resource_id: &Ulid) -> bool {
        self.by_resource
            .get(resource_id)
            .is_some_and(|slots| !slots.is_empty())
    }

    /// First ACTIVE booking on the resource whose span overlaps `span`.
    /// Binary search skips everything starting after `span.end`.
    pub fn first_active_overlap(&self, resource_id: &Ulid, span: &Span) -> Option<Ulid> {
        let slots = self.by_resource.get(resource_id)?;
        let right_bound = slots.partition_point(|(s, _)| s.start <= span.end);
        slots[..right_bound]
            .iter()
            .filter(|(s, _)| s.end >= span.start)
            .map(|(_, id)| *id)
            .find(|id| self.bookings.get(id).is_some_and(|b| b.is_active()))
    }

    pub fn users(&self) -> Vec<User> {
        let mut v: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        v.sort_by_key(|u| u.id);
        v
    }

    pub fn resources(&self) -> Vec<Resource> {
        let mut v: Vec<Resource> = self.resources.iter().map(|e| e.value().clone()).collect();
        v.sort_by_key(|r| r.id);
        v
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    // ── Planning: validate against current state ─────────────

    pub(crate) fn plan_booking(&self, new: NewBooking) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: new.user_id,
            resource_id: new.resource_id,
            span: new.span,
            status: BookingStatus::Active,
        }
    }

    pub(crate) fn plan_status(&self, id: Ulid, status: BookingStatus) -> StatusPlan {
        match self.bookings.get(&id) {
            None => StatusPlan::Skip(Transition::Missing),
            Some(b) if !b.status.can_transition_to(status) => {
                StatusPlan::Skip(Transition::Unchanged(b.status))
            }
            Some(_) => StatusPlan::Write(Event::BookingStatusChanged { id, status }),
        }
    }

    pub(crate) fn plan_user(&self, new: NewUser) -> Result<User, StoreError> {
        if self.emails.contains_key(&new.email.to_lowercase()) {
            return Err(StoreError::Duplicate(format!("email {}", new.email)));
        }
        Ok(User {
            id: Ulid::new(),
            name: new.name,
            first_name: new.first_name,
            phone: new.phone,
            email: new.email,
            password_hash: new.password_hash,
            role: new.role.unwrap_or(Role::Client),
        })
    }

    pub(crate) fn plan_role(&self, id: Ulid, role: Role) -> Result<Event, StoreError> {
        if !self.users.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(Event::UserRoleChanged { id, role })
    }

    pub(crate) fn plan_resource(&self, new: NewResource) -> Resource {
        Resource {
            id: Ulid::new(),
            name: new.name,
            kind: new.kind,
            available: true,
            description: new.description,
            location: new.location,
        }
    }

    pub(crate) fn plan_availability(&self, id: Ulid, available: bool) -> Result<Event, StoreError> {
        if !self.resources.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(Event::ResourceAvailabilityChanged { id, available })
    }

    pub(crate) fn plan_resource_delete(&self, id: Ulid) -> Result<Event, StoreError> {
        if !self.resources.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(Event::ResourceDeleted { id })
    }

    // ── Event application ────────────────────────────────────

    /// Apply one event. Returns false, leaving state untouched, when a status
    /// change found the booking missing or already terminal, or when a new
    /// user's email already belongs to someone else.
    pub fn apply_event(&self, event: &Event) -> bool {
        match event {
            Event::UserCreated { user } => {
                match self.emails.entry(user.email.to_lowercase()) {
                    Entry::Occupied(owner) if *owner.get() != user.id => return false,
                    Entry::Occupied(_) => {}
                    Entry::Vacant(slot) => {
                        slot.insert(user.id);
                    }
                }
                self.users.insert(user.id, user.clone());
            }
            Event::UserRoleChanged { id, role } => {
                if let Some(mut u) = self.users.get_mut(id) {
                    u.role = *role;
                }
            }
            Event::ResourceCreated { resource } => {
                self.resources.insert(resource.id, resource.clone());
            }
            Event::ResourceAvailabilityChanged { id, available } => {
                if let Some(mut r) = self.resources.get_mut(id) {
                    r.available = *available;
                }
            }
            Event::ResourceDeleted { id } => {
                self.resources.remove(id);
                self.by_resource.remove(id);
            }
            Event::BookingCreated { booking } => {
                self.bookings.insert(booking.id, booking.clone());
                {
                    let mut slots = self.by_resource.entry(booking.resource_id).or_default();
                    let pos = slots.partition_point(|(s, _)| s.start <= booking.span.start);
                    slots.insert(pos, (booking.span, booking.id));
                }
                self.by_user.entry(booking.user_id).or_default().push(booking.id);
            }
            Event::BookingStatusChanged { id, status } => {
                let Some(mut b) = self.bookings.get_mut(id) else {
                    return false;
                };
                if !b.status.can_transition_to(*status) {
                    return false;
                }
                b.status = *status;
            }
        }
        true
    }

    /// Minimal event list that recreates the current state.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.users.len() + self.resources.len() + self.bookings.len());
        events.extend(self.users().into_iter().map(|user| Event::UserCreated { user }));
        events.extend(
            self.resources()
                .into_iter()
                .map(|resource| Event::ResourceCreated { resource }),
        );
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));
        events
    }

    fn apply_status(&self, id: Ulid, status: BookingStatus) -> Transition {
        match self.plan_status(id, status) {
            StatusPlan::Skip(t) => t,
            StatusPlan::Write(event) => {
                if self.apply_event(&event) {
                    Transition::Applied
                } else {
                    // Lost a race with another terminal write.
                    match self.booking(&id) {
                        Some(b) => Transition::Unchanged(b.status),
                        None => Transition::Missing,
                    }
                }
            }
        }
    }

    fn identity_write(&self) -> std::sync::MutexGuard<'_, ()> {
        self.identity_write
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl IntervalStore for MemoryStore {
    async fn insert(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let booking = self.plan_booking(booking);
        self.apply_event(&Event::BookingCreated { booking: booking.clone() });
        Ok(booking)
    }

    async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<Transition, StoreError> {
        Ok(self.apply_status(id, status))
    }

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.booking(&id))
    }

    async fn find_by_user(&self, user_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        Ok(self.bookings_of_user(&user_id))
    }

    async fn find_by_resource(&self, resource_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        Ok(self.bookings_of_resource(&resource_id))
    }

    async fn find_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, StoreError> {
        Ok(self.bookings_matching(|b| b.status == status))
    }

    async fn find_all(&self) -> Result<Vec<Booking>, StoreError> {
        Ok(self.bookings_matching(|_| true))
    }

    async fn find_ending_before(&self, t: Ms) -> Result<Vec<Booking>, StoreError> {
        Ok(self.bookings_matching(|b| b.is_active() && b.span.ends_before(t)))
    }

    async fn find_overlap(&self, resource_id: Ulid, span: Span) -> Result<Option<Ulid>, StoreError> {
        Ok(self.first_active_overlap(&resource_id, &span))
    }

    async fn count_by_status(&self, status: BookingStatus) -> Result<u64, StoreError> {
        Ok(self.bookings.iter().filter(|e| e.value().status == status).count() as u64)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_user_by_id(&self, id: Ulid) -> Result<Option<User>, StoreError> {
        Ok(self.user(&id))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.user_by_email(email))
    }

    async fn find_resource_by_id(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.resource(&id))
    }

    async fn resource_has_any_booking(&self, resource_id: Ulid) -> Result<bool, StoreError> {
        Ok(self.has_bookings(&resource_id))
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        let _w = self.identity_write();
        let user = self.plan_user(user)?;
        if !self.apply_event(&Event::UserCreated { user: user.clone() }) {
            return Err(StoreError::Duplicate(format!("email {}", user.email)));
        }
        Ok(user)
    }

    async fn set_user_role(&self, id: Ulid, role: Role) -> Result<(), StoreError> {
        let event = self.plan_role(id, role)?;
        self.apply_event(&event);
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.users())
    }

    async fn count_users(&self) -> Result<u64, StoreError> {
        Ok(self.user_count() as u64)
    }

    async fn insert_resource(&self, resource: NewResource) -> Result<Resource, StoreError> {
        let resource = self.plan_resource(resource);
        self.apply_event(&Event::ResourceCreated { resource: resource.clone() });
        Ok(resource)
    }

    async fn set_resource_available(&self, id: Ulid, available: bool) -> Result<(), StoreError> {
        let event = self.plan_availability(id, available)?;
        self.apply_event(&event);
        Ok(())
    }

    async fn delete_resource(&self, id: Ulid) -> Result<(), StoreError> {
        let event = self.plan_resource_delete(id)?;
        self.apply_event(&event);
        Ok(())
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, StoreError> {
        Ok(self.resources())
    }

    async fn count_resources(&self) -> Result<u64, StoreError> {
        Ok(self.resource_count() as u64)
    }
}
