use ulid::Ulid;

use crate::model::*;

use super::{BookingError, BookingService};

impl BookingService {
    pub async fn get(&self, id: Ulid) -> Result<Option<Booking>, BookingError> {
        Ok(self.bookings.find_by_id(id).await?)
    }

    /// Every booking of the user, in any status, ordered by start.
    pub async fn list_by_user(&self, user_id: Ulid) -> Result<Vec<Booking>, BookingError> {
        Ok(self.bookings.find_by_user(user_id).await?)
    }

    pub async fn list_by_resource(&self, resource_id: Ulid) -> Result<Vec<Booking>, BookingError> {
        Ok(self.bookings.find_by_resource(resource_id).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<Booking>, BookingError> {
        Ok(self.bookings.find_all().await?)
    }

    pub async fn list_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, BookingError> {
        Ok(self.bookings.find_by_status(status).await?)
    }

    pub async fn count_by_status(&self, status: BookingStatus) -> Result<u64, BookingError> {
        Ok(self.bookings.count_by_status(status).await?)
    }

    pub async fn get_user(&self, id: Ulid) -> Result<Option<User>, BookingError> {
        Ok(self.identities.find_user_by_id(id).await?)
    }

    /// Case-insensitive lookup.
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, BookingError> {
        Ok(self.identities.find_user_by_email(email).await?)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, BookingError> {
        Ok(self.identities.list_users().await?)
    }

    pub async fn count_users(&self) -> Result<u64, BookingError> {
        Ok(self.identities.count_users().await?)
    }

    pub async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, BookingError> {
        Ok(self.identities.find_resource_by_id(id).await?)
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, BookingError> {
        Ok(self.identities.list_resources().await?)
    }

    pub async fn count_resources(&self) -> Result<u64, BookingError> {
        Ok(self.identities.count_resources().await?)
    }
}
