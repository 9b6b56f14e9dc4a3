//! Storage capabilities the engine is written against.
//!
//! Every method on [`ListingRepo`] and [`ReservationRepo`] either runs as its
//! own auto-committed unit (when called on the store) or joins the enclosing
//! transaction (when called on a [`Transaction`]). Core logic is generic over
//! both, so the same code path serves plain and compose operations.

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Transaction isolation, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsolationLevel {
    /// Reads see the latest committed state and take no lasting lock.
    ReadCommitted,
    /// The first read of a listing locks it until the transaction ends.
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn locks_on_read(self) -> bool {
        self >= IsolationLevel::RepeatableRead
    }
}

#[async_trait]
pub trait ListingRepo: Send + Sync {
    async fn get_listing(&self, id: Ulid) -> Result<Listing, EngineError>;
}

#[async_trait]
pub trait ReservationRepo: Send + Sync {
    async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError>;

    /// Every booking on the listing, cancelled ones included, ordered by start.
    async fn bookings_for_listing(&self, listing_id: Ulid) -> Result<Vec<Booking>, EngineError>;

    /// Bookings for the given ids, in input order. Unknown ids are NotFound.
    async fn bookings_by_ids(&self, ids: &[Ulid]) -> Result<Vec<Booking>, EngineError>;

    /// Insert with a storage-assigned id. Fails with `Conflict` when the
    /// range overlaps an active booking on the listing.
    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, EngineError>;

    /// Bulk insert; all rows or none.
    async fn insert_bookings(&self, bookings: Vec<NewBooking>) -> Result<Vec<Booking>, EngineError>;

    /// Replace the stored row. The overlap constraint is enforced against
    /// the other bookings of the listing.
    async fn update_booking(&self, booking: &Booking) -> Result<(), EngineError>;

    /// Remove the booking and its payments.
    async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError>;

    async fn set_booking_paid(&self, id: Ulid, is_paid: bool) -> Result<(), EngineError>;

    async fn get_payment(&self, id: Ulid) -> Result<Payment, EngineError>;

    async fn payments_for_booking(&self, booking_id: Ulid) -> Result<Vec<Payment>, EngineError>;

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, EngineError>;

    /// Bulk insert; all rows or none.
    async fn insert_payments(&self, payments: Vec<NewPayment>) -> Result<Vec<Payment>, EngineError>;

    async fn update_payment(&self, payment: &Payment) -> Result<(), EngineError>;

    async fn delete_payment(&self, id: Ulid) -> Result<(), EngineError>;
}

/// An open unit of work. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait Transaction: ListingRepo + ReservationRepo + Sized {
    /// Lock the given listings up front, in a deadlock-free order.
    async fn lock_listings(&self, listing_ids: &[Ulid]) -> Result<(), EngineError>;

    async fn commit(self) -> Result<(), EngineError>;

    async fn rollback(self);
}

#[async_trait]
pub trait Transactor: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Tx, EngineError>;
}

/// Everything the engine needs from storage.
pub trait Store: ListingRepo + ReservationRepo + Transactor {}

impl<T: ListingRepo + ReservationRepo + Transactor> Store for T {}
