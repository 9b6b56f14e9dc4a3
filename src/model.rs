use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open stay `[start, end)` in calendar days. The end date is the
/// check-out day and is not occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StayRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl StayRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Whole days between start and end. Zero or negative for empty ranges.
    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_date(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }
}

impl fmt::Display for StayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The storage-side view of a listing: just what booking needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Ulid,
    pub host_id: Ulid,
    pub nightly_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub listing_id: Ulid,
    /// Denormalized from the listing when the booking was made.
    pub host_id: Ulid,
    pub guest_id: Ulid,
    pub range: StayRange,
    pub total_price: Decimal,
    /// Derived: true iff some payment for this booking is completed.
    pub is_paid: bool,
    /// Cancelled bookings keep their row but release their dates.
    pub cancelled: bool,
}

impl Booking {
    /// Whether this booking still holds its dates on the listing.
    pub fn occupies(&self) -> bool {
        !self.cancelled
    }
}

/// A booking as handed to storage, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub listing_id: Ulid,
    pub host_id: Ulid,
    pub guest_id: Ulid,
    pub range: StayRange,
    pub total_price: Decimal,
}

/// One candidate in a booking request (single or batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub listing_id: Ulid,
    pub guest_id: Ulid,
    pub range: StayRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Completed,
    Failed,
    /// Written only by cancel-with-refund.
    Refunded,
    /// Any other caller-supplied status ("pending", "authorized", ...).
    Other(String),
}

impl PaymentStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => PaymentStatus::Completed,
            "failed" => PaymentStatus::Failed,
            "refunded" => PaymentStatus::Refunded,
            other => PaymentStatus::Other(other.to_string()),
        }
    }

    pub fn pending() -> Self {
        PaymentStatus::Other("pending".to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Other(s) => s,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PaymentStatus::Completed)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub amount: Decimal,
    pub method: String,
    pub status: PaymentStatus,
    pub reference: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// A payment as handed to storage, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub booking_id: Ulid,
    pub amount: Decimal,
    pub method: String,
    pub status: PaymentStatus,
    pub reference: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Caller input for creating a payment. Amount, reference and settlement
/// time are derived from the status where the status dictates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub booking_id: Ulid,
    pub method: String,
    pub status: PaymentStatus,
    pub amount: Option<Decimal>,
    pub reference: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentRequest {
    pub fn new(booking_id: Ulid, method: impl Into<String>, status: PaymentStatus) -> Self {
        Self {
            booking_id,
            method: method.into(),
            status,
            amount: None,
            reference: None,
            settled_at: None,
        }
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }
}

/// Caller input for updating a payment. The booking is never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub method: Option<String>,
    pub amount: Option<Decimal>,
    pub reference: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentUpdate {
    pub fn status(status: PaymentStatus) -> Self {
        Self {
            status,
            method: None,
            amount: None,
            reference: None,
            settled_at: None,
        }
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingWithPayment {
    pub booking_id: Ulid,
    pub payment_id: Ulid,
}

/// The event types. Flat, no nesting. A WAL entry is the list of events
/// committed by one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ListingPut {
        listing: Listing,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        booking: Booking,
    },
    BookingDeleted {
        id: Ulid,
        listing_id: Ulid,
    },
    BookingPaidSet {
        id: Ulid,
        listing_id: Ulid,
        is_paid: bool,
    },
    PaymentCreated {
        listing_id: Ulid,
        payment: Payment,
    },
    PaymentUpdated {
        listing_id: Ulid,
        payment: Payment,
    },
    PaymentDeleted {
        id: Ulid,
        listing_id: Ulid,
    },
}

impl Event {
    pub fn listing_id(&self) -> Ulid {
        match self {
            Event::ListingPut { listing } => listing.id,
            Event::BookingCreated { booking } | Event::BookingUpdated { booking } => {
                booking.listing_id
            }
            Event::BookingDeleted { listing_id, .. }
            | Event::BookingPaidSet { listing_id, .. }
            | Event::PaymentCreated { listing_id, .. }
            | Event::PaymentUpdated { listing_id, .. }
            | Event::PaymentDeleted { listing_id, .. } => *listing_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn range_basics() {
        let r = StayRange::new(day(1), day(3));
        assert_eq!(r.nights(), 2);
        assert!(!r.is_empty());
        assert!(r.contains_date(day(1)));
        assert!(r.contains_date(day(2)));
        assert!(!r.contains_date(day(3))); // half-open
    }

    #[test]
    fn range_overlap() {
        let a = StayRange::new(day(1), day(3));
        let b = StayRange::new(day(2), day(4));
        let c = StayRange::new(day(3), day(5));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn range_containing_another_overlaps() {
        let outer = StayRange::new(day(1), day(10));
        let inner = StayRange::new(day(4), day(5));
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn empty_and_inverted_ranges() {
        assert!(StayRange::new(day(3), day(3)).is_empty());
        assert!(StayRange::new(day(5), day(3)).is_empty());
        assert_eq!(StayRange::new(day(5), day(3)).nights(), -2);
    }

    #[test]
    fn status_parse_and_display() {
        assert_eq!(PaymentStatus::parse("completed"), PaymentStatus::Completed);
        assert_eq!(PaymentStatus::parse("failed"), PaymentStatus::Failed);
        assert_eq!(PaymentStatus::parse("refunded"), PaymentStatus::Refunded);
        assert_eq!(
            PaymentStatus::parse("authorized"),
            PaymentStatus::Other("authorized".into())
        );
        assert_eq!(PaymentStatus::pending().to_string(), "pending");
        assert!(!PaymentStatus::parse("Completed").is_completed()); // case-sensitive
    }

    #[test]
    fn event_serialization_roundtrip() {
        let booking_id = Ulid::new();
        let event = Event::PaymentCreated {
            listing_id: Ulid::new(),
            payment: Payment {
                id: Ulid::new(),
                booking_id,
                amount: Decimal::new(19999, 2),
                method: "card".into(),
                status: PaymentStatus::Completed,
                reference: Some(format!("TXN-{booking_id}-1")),
                settled_at: Some(Utc::now()),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
