use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, Store};

impl<S: Store> Engine<S> {
    pub async fn get_listing(&self, id: Ulid) -> Result<Listing, EngineError> {
        self.store.get_listing(id).await
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.get_booking(id).await
    }

    /// All bookings on a listing ordered by start, cancelled ones included.
    pub async fn bookings_for_listing(
        &self,
        listing_id: Ulid,
    ) -> Result<Vec<Booking>, EngineError> {
        self.store.bookings_for_listing(listing_id).await
    }

    pub async fn get_payment(&self, id: Ulid) -> Result<Payment, EngineError> {
        self.store.get_payment(id).await
    }

    pub async fn payments_for_booking(
        &self,
        booking_id: Ulid,
    ) -> Result<Vec<Payment>, EngineError> {
        self.store.payments_for_booking(booking_id).await
    }
}
