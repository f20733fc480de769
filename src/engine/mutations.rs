use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::*;
use crate::store::Transition;
use crate::sweeper::SweepReport;

use super::conflict::validate_span;
use super::{BookingError, BookingRequest, BookingService};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), BookingError> {
    if value.len() > max {
        return Err(BookingError::InvalidInput(what));
    }
    Ok(())
}

fn check_opt_len(value: &Option<String>, max: usize, what: &'static str) -> Result<(), BookingError> {
    match value {
        Some(v) => check_len(v, max, what),
        None => Ok(()),
    }
}

impl BookingService {
    /// Create an ACTIVE booking, or explain why not.
    pub async fn create(&self, req: BookingRequest) -> Result<Booking, BookingError> {
        let span = match validate_span(req.start, req.end) {
            Ok(span) => span,
            Err(e) => {
                metrics::counter!(BOOKINGS_REJECTED_TOTAL, "reason" => rejection_label(&e))
                    .increment(1);
                return Err(e);
            }
        };
        self.arbiter.try_book(req.user_id, req.resource_id, span).await
    }

    /// Move a booking to CANCELLED. Returns `Ok(false)` when the booking is
    /// unknown or already terminal; a terminal status is never overwritten.
    pub async fn cancel(&self, id: Ulid) -> Result<bool, BookingError> {
        match self.bookings.update_status(id, BookingStatus::Cancelled).await? {
            Transition::Applied => {
                metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
                info!("cancelled booking {id}");
                Ok(true)
            }
            Transition::Unchanged(status) => {
                debug!("cancel of {id} ignored: already {status}");
                Ok(false)
            }
            Transition::Missing => {
                debug!("cancel of unknown booking {id}");
                Ok(false)
            }
        }
    }

    /// Mark every ACTIVE booking whose end lies strictly before `now` as
    /// EXPIRED. A failed update is logged and counted; the rest still run.
    pub async fn expire_ended(&self, now: Ms) -> Result<SweepReport, BookingError> {
        let ended = self.bookings.find_ending_before(now).await?;
        let mut report = SweepReport {
            examined: ended.len(),
            ..SweepReport::default()
        };

        for booking in ended {
            match self.bookings.update_status(booking.id, BookingStatus::Expired).await {
                Ok(Transition::Applied) => {
                    report.expired += 1;
                    metrics::counter!(SWEEP_EXPIRED_TOTAL).increment(1);
                }
                Ok(Transition::Unchanged(_)) | Ok(Transition::Missing) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!(SWEEP_FAILURES_TOTAL, "scope" => "booking").increment(1);
                    warn!("could not expire booking {}: {e}", booking.id);
                }
            }
        }
        Ok(report)
    }

    // ── Users ────────────────────────────────────────────────────

    pub async fn create_user(&self, new: NewUser) -> Result<User, BookingError> {
        if new.name.trim().is_empty() {
            return Err(BookingError::InvalidInput("name is required"));
        }
        if new.email.trim().is_empty() || !new.email.contains('@') {
            return Err(BookingError::InvalidInput("invalid email"));
        }
        check_len(&new.name, MAX_NAME_LEN, "name too long")?;
        check_len(&new.email, MAX_EMAIL_LEN, "email too long")?;
        check_opt_len(&new.first_name, MAX_NAME_LEN, "first name too long")?;
        check_opt_len(&new.phone, MAX_PHONE_LEN, "phone too long")?;

        let user = self.identities.insert_user(new).await?;
        info!("created user {} ({:?})", user.id, user.role);
        Ok(user)
    }

    pub async fn update_user_role(&self, id: Ulid, role: Role) -> Result<(), BookingError> {
        self.identities.set_user_role(id, role).await?;
        info!("user {id} is now {role:?}");
        Ok(())
    }

    // ── Resources ────────────────────────────────────────────────

    pub async fn create_resource(&self, new: NewResource) -> Result<Resource, BookingError> {
        if new.name.trim().is_empty() {
            return Err(BookingError::InvalidInput("name is required"));
        }
        check_len(&new.name, MAX_NAME_LEN, "name too long")?;
        check_len(&new.kind, MAX_KIND_LEN, "kind too long")?;
        check_opt_len(&new.description, MAX_DESCRIPTION_LEN, "description too long")?;
        check_opt_len(&new.location, MAX_NAME_LEN, "location too long")?;

        let resource = self.identities.insert_resource(new).await?;
        info!("created resource {} ({})", resource.id, resource.kind);
        Ok(resource)
    }

    pub async fn set_resource_available(&self, id: Ulid, available: bool) -> Result<(), BookingError> {
        // Serialized with admissions so no booking lands after the flag flips.
        self.arbiter
            .exclusive(id, move |identities| async move {
                identities.set_resource_available(id, available).await?;
                Ok::<_, BookingError>(())
            })
            .await?;
        info!("resource {id} available={available}");
        Ok(())
    }

    /// Delete a resource that has never been booked. Any booking, whatever
    /// its status, blocks deletion.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), BookingError> {
        self.arbiter
            .exclusive(id, move |identities| async move {
                if identities.find_resource_by_id(id).await?.is_none() {
                    return Err(BookingError::NotFound(id));
                }
                if identities.resource_has_any_booking(id).await? {
                    return Err(BookingError::HasBookings(id));
                }
                identities.delete_resource(id).await?;
                Ok(())
            })
            .await?;
        info!("deleted resource {id}");
        Ok(())
    }
}
