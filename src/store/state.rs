use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

/// Entity-index maintenance produced by applying an event. The listing is
/// implied by the state the event was applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexChange {
    Map(Ulid),
    Unmap(Ulid),
}

/// Everything stored for one listing. A listing's bookings and their
/// payments live together so one lock covers a whole reservation.
#[derive(Debug, Clone)]
pub struct ListingState {
    pub listing: Listing,
    /// All bookings, cancelled ones included, sorted by `range.start`.
    pub bookings: Vec<Booking>,
    /// Payments for this listing's bookings, in insertion order.
    pub payments: Vec<Payment>,
}

impl ListingState {
    pub fn new(listing: Listing) -> Self {
        Self {
            listing,
            bookings: Vec::new(),
            payments: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by range.start.
    fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.range.start <= booking.range.start);
        self.bookings.insert(pos, booking);
    }

    fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn payment(&self, id: Ulid) -> Option<&Payment> {
        self.payments.iter().find(|p| p.id == id)
    }

    pub fn payments_for(&self, booking_id: Ulid) -> impl Iterator<Item = &Payment> {
        self.payments.iter().filter(move |p| p.booking_id == booking_id)
    }

    /// Active bookings whose range overlaps `query`.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &StayRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.range.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.occupies() && b.range.end > query.start)
    }

    /// The exclusion constraint: no active booking other than `ignore` may
    /// share a night with `range`.
    pub fn check_no_overlap(
        &self,
        range: &StayRange,
        ignore: Option<Ulid>,
    ) -> Result<(), EngineError> {
        match self.overlapping(range).find(|b| Some(b.id) != ignore) {
            Some(existing) => Err(EngineError::Conflict {
                listing_id: self.listing.id,
                range: *range,
                existing: Some(existing.id),
                position: None,
            }),
            None => Ok(()),
        }
    }

    /// Apply an event (no locking; caller holds the lock). Events are
    /// validated before they are recorded, so applying never fails.
    pub(crate) fn apply(&mut self, event: &Event) -> Vec<IndexChange> {
        match event {
            Event::ListingPut { listing } => {
                self.listing = listing.clone();
                Vec::new()
            }
            Event::BookingCreated { booking } => {
                self.insert_booking(booking.clone());
                vec![IndexChange::Map(booking.id)]
            }
            Event::BookingUpdated { booking } => {
                self.remove_booking(booking.id);
                self.insert_booking(booking.clone());
                Vec::new()
            }
            Event::BookingDeleted { id, .. } => {
                self.remove_booking(*id);
                let mut changes = vec![IndexChange::Unmap(*id)];
                self.payments.retain(|p| {
                    if p.booking_id == *id {
                        changes.push(IndexChange::Unmap(p.id));
                        false
                    } else {
                        true
                    }
                });
                changes
            }
            Event::BookingPaidSet { id, is_paid, .. } => {
                if let Some(b) = self.bookings.iter_mut().find(|b| b.id == *id) {
                    b.is_paid = *is_paid;
                }
                Vec::new()
            }
            Event::PaymentCreated { payment, .. } => {
                self.payments.push(payment.clone());
                vec![IndexChange::Map(payment.id)]
            }
            Event::PaymentUpdated { payment, .. } => {
                if let Some(p) = self.payments.iter_mut().find(|p| p.id == payment.id) {
                    *p = payment.clone();
                }
                Vec::new()
            }
            Event::PaymentDeleted { id, .. } => {
                self.payments.retain(|p| p.id != *id);
                vec![IndexChange::Unmap(*id)]
            }
        }
    }

    /// Events that recreate this state from nothing.
    pub fn snapshot_events(&self, out: &mut Vec<Event>) {
        out.push(Event::ListingPut {
            listing: self.listing.clone(),
        });
        for booking in &self.bookings {
            out.push(Event::BookingCreated {
                booking: booking.clone(),
            });
        }
        for payment in &self.payments {
            out.push(Event::PaymentCreated {
                listing_id: self.listing.id,
                payment: payment.clone(),
            });
        }
    }
}
