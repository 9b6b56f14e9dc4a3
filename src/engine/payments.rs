//! The payment state machine.
//!
//! A payment's amount, settlement time and reference follow from its status:
//!
//! | status    | amount                  | settled_at / reference        |
//! |-----------|-------------------------|-------------------------------|
//! | completed | booking total           | kept if given, else assigned  |
//! | failed    | zero                    | cleared                       |
//! | other     | given, `0 < a <= total` | kept if given                 |
//!
//! `refunded` is written only by cancel-with-refund. After every payment
//! write the parent booking's settled flag is recomputed.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::{MAX_BATCH_SIZE, MAX_METHOD_LEN, MAX_REFERENCE_LEN};
use crate::model::*;

use super::{Engine, EngineError, IsolationLevel, ReservationRepo, Store, Transaction};

/// Caller-supplied values the status may or may not honour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Terms {
    pub amount: Option<Decimal>,
    pub reference: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// What actually gets stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub amount: Decimal,
    pub reference: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
}

pub(super) fn generate_reference(booking_id: Ulid) -> String {
    format!("TXN-{booking_id}-{}", Ulid::new())
}

/// Apply the state machine. `prior` is the stored payment on update; its
/// values fill in what the caller left out.
pub fn settle(
    status: &PaymentStatus,
    booking: &Booking,
    requested: Terms,
    prior: Option<&Payment>,
    now: DateTime<Utc>,
) -> Result<Settlement, EngineError> {
    let prior_reference = || prior.and_then(|p| p.reference.clone());
    let prior_settled_at = || prior.and_then(|p| p.settled_at);
    match status {
        PaymentStatus::Completed => Ok(Settlement {
            amount: booking.total_price,
            reference: Some(
                requested
                    .reference
                    .or_else(prior_reference)
                    .unwrap_or_else(|| generate_reference(booking.id)),
            ),
            settled_at: Some(requested.settled_at.or_else(prior_settled_at).unwrap_or(now)),
        }),
        PaymentStatus::Failed => Ok(Settlement {
            amount: Decimal::ZERO,
            reference: None,
            settled_at: None,
        }),
        PaymentStatus::Refunded => Err(EngineError::validation(
            "status refunded is reserved for cancellations",
        )),
        PaymentStatus::Other(name) => {
            if name.trim().is_empty() {
                return Err(EngineError::validation("payment status must not be empty"));
            }
            let amount = requested
                .amount
                .or(prior.map(|p| p.amount))
                .ok_or_else(|| {
                    EngineError::validation(format!("status {name} requires an amount"))
                })?;
            if amount <= Decimal::ZERO || amount > booking.total_price {
                return Err(EngineError::validation(format!(
                    "amount {amount} must be above zero and at most the booking total {}",
                    booking.total_price
                )));
            }
            Ok(Settlement {
                amount,
                reference: requested.reference.or_else(prior_reference),
                settled_at: requested.settled_at.or_else(prior_settled_at),
            })
        }
    }
}

pub(super) fn validate_method(method: &str) -> Result<(), EngineError> {
    if method.trim().is_empty() {
        return Err(EngineError::validation("payment method must not be empty"));
    }
    if method.len() > MAX_METHOD_LEN {
        return Err(EngineError::validation("payment method too long"));
    }
    Ok(())
}

fn validate_reference(reference: Option<&str>) -> Result<(), EngineError> {
    if let Some(r) = reference
        && r.len() > MAX_REFERENCE_LEN
    {
        return Err(EngineError::validation("payment reference too long"));
    }
    Ok(())
}

fn ensure_open(booking: &Booking) -> Result<(), EngineError> {
    if booking.cancelled {
        return Err(EngineError::validation(format!(
            "booking {} is cancelled",
            booking.id
        )));
    }
    Ok(())
}

/// Set the booking's settled flag from its payments. Returns the new value.
pub(super) async fn recompute_settled<R>(repo: &R, booking_id: Ulid) -> Result<bool, EngineError>
where
    R: ReservationRepo + ?Sized,
{
    let payments = repo.payments_for_booking(booking_id).await?;
    let is_paid = payments.iter().any(|p| p.status.is_completed());
    repo.set_booking_paid(booking_id, is_paid).await?;
    debug!("booking {booking_id} settled={is_paid} ({} payments)", payments.len());
    Ok(is_paid)
}

/// Build the row for a new payment on `booking`.
fn new_payment(
    booking: &Booking,
    request: PaymentRequest,
    now: DateTime<Utc>,
) -> Result<NewPayment, EngineError> {
    validate_method(&request.method)?;
    validate_reference(request.reference.as_deref())?;
    ensure_open(booking)?;
    let terms = Terms {
        amount: request.amount,
        reference: request.reference,
        settled_at: request.settled_at,
    };
    let settlement = settle(&request.status, booking, terms, None, now)?;
    Ok(NewPayment {
        booking_id: booking.id,
        amount: settlement.amount,
        method: request.method,
        status: request.status,
        reference: settlement.reference,
        settled_at: settlement.settled_at,
    })
}

fn log_payment(payment: &Payment) {
    if payment.status.is_completed() {
        info!(
            "payment {} settled booking {} ({})",
            payment.id, payment.booking_id, payment.amount
        );
    } else {
        debug!(
            "payment {} on booking {} is {}",
            payment.id, payment.booking_id, payment.status
        );
    }
}

async fn create_in<X: Transaction>(
    tx: &X,
    request: PaymentRequest,
) -> Result<Payment, EngineError> {
    let booking = tx.get_booking(request.booking_id).await?;
    let row = new_payment(&booking, request, Utc::now())?;
    let payment = tx.insert_payment(row).await?;
    recompute_settled(tx, booking.id).await?;
    log_payment(&payment);
    Ok(payment)
}

pub(super) async fn update_in<X: Transaction>(
    tx: &X,
    id: Ulid,
    update: PaymentUpdate,
) -> Result<Payment, EngineError> {
    let prior = tx.get_payment(id).await?;
    let booking = tx.get_booking(prior.booking_id).await?;
    ensure_open(&booking)?;
    let method = update.method.unwrap_or_else(|| prior.method.clone());
    validate_method(&method)?;
    validate_reference(update.reference.as_deref())?;
    let terms = Terms {
        amount: update.amount,
        reference: update.reference,
        settled_at: update.settled_at,
    };
    let settlement = settle(&update.status, &booking, terms, Some(&prior), Utc::now())?;
    let payment = Payment {
        id,
        booking_id: prior.booking_id,
        amount: settlement.amount,
        method,
        status: update.status,
        reference: settlement.reference,
        settled_at: settlement.settled_at,
    };
    tx.update_payment(&payment).await?;
    recompute_settled(tx, payment.booking_id).await?;
    log_payment(&payment);
    Ok(payment)
}

async fn delete_in<X: Transaction>(tx: &X, id: Ulid) -> Result<(), EngineError> {
    let payment = tx.get_payment(id).await?;
    tx.delete_payment(id).await?;
    recompute_settled(tx, payment.booking_id).await?;
    info!("payment {id} deleted from booking {}", payment.booking_id);
    Ok(())
}

async fn batch_in<X: Transaction>(
    tx: &X,
    requests: Vec<PaymentRequest>,
) -> Result<usize, EngineError> {
    let booking_ids: Vec<Ulid> = requests.iter().map(|r| r.booking_id).collect();
    // Find the listings unlocked, lock them in order, then read for real.
    let listing_ids: Vec<Ulid> = tx
        .bookings_by_ids(&booking_ids)
        .await?
        .iter()
        .map(|b| b.listing_id)
        .collect();
    tx.lock_listings(&listing_ids).await?;
    let bookings = tx.bookings_by_ids(&booking_ids).await?;

    let now = Utc::now();
    let mut rows = Vec::with_capacity(requests.len());
    for (position, (request, booking)) in requests.into_iter().zip(&bookings).enumerate() {
        let row = new_payment(booking, request, now).map_err(|e| match e {
            EngineError::Validation(msg) => {
                EngineError::Validation(format!("batch payment {position}: {msg}"))
            }
            other => other,
        })?;
        rows.push(row);
    }
    let inserted = tx.insert_payments(rows).await?.len();

    let mut seen = HashSet::new();
    for booking_id in booking_ids {
        if seen.insert(booking_id) {
            recompute_settled(tx, booking_id).await?;
        }
    }
    info!("batch inserted {inserted} payments across {} bookings", seen.len());
    Ok(inserted)
}

impl<S: Store> Engine<S> {
    pub async fn create_payment(&self, request: PaymentRequest) -> Result<Payment, EngineError> {
        self.transact("create_payment", async {
            let tx = self.store.begin(IsolationLevel::RepeatableRead).await?;
            let result = create_in(&tx, request).await;
            Ok((tx, result))
        })
        .await
    }

    /// Move a payment to a new status. The booking it belongs to never changes.
    pub async fn update_payment(
        &self,
        id: Ulid,
        update: PaymentUpdate,
    ) -> Result<Payment, EngineError> {
        self.transact("update_payment", async {
            let tx = self.store.begin(IsolationLevel::RepeatableRead).await?;
            let result = update_in(&tx, id, update).await;
            Ok((tx, result))
        })
        .await
    }

    pub async fn delete_payment(&self, id: Ulid) -> Result<(), EngineError> {
        self.transact("delete_payment", async {
            let tx = self.store.begin(IsolationLevel::RepeatableRead).await?;
            let result = delete_in(&tx, id).await;
            Ok((tx, result))
        })
        .await
    }

    /// Import many payments at once, all or none. Each booking touched is
    /// recomputed once. Returns the number inserted.
    pub async fn batch_create_payments(
        &self,
        requests: Vec<PaymentRequest>,
    ) -> Result<usize, EngineError> {
        if requests.is_empty() {
            return Ok(0);
        }
        self.transact("batch_create_payments", async {
            if requests.len() > MAX_BATCH_SIZE {
                return Err(EngineError::validation(format!(
                    "batch of {} payments exceeds the limit of {MAX_BATCH_SIZE}",
                    requests.len()
                )));
            }
            let tx = self.store.begin(IsolationLevel::ReadCommitted).await?;
            let result = batch_in(&tx, requests).await;
            Ok((tx, result))
        })
        .await
    }

    /// Re-derive a booking's settled flag from its payments.
    pub async fn recompute_settled(&self, booking_id: Ulid) -> Result<bool, EngineError> {
        self.transact("recompute_settled", async {
            let tx = self.store.begin(IsolationLevel::RepeatableRead).await?;
            let result = recompute_settled(&tx, booking_id).await;
            Ok((tx, result))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn booking(total: i64) -> Booking {
        let day = |d| NaiveDate::from_ymd_opt(2025, 1, d).unwrap();
        Booking {
            id: Ulid::new(),
            listing_id: Ulid::new(),
            host_id: Ulid::new(),
            guest_id: Ulid::new(),
            range: StayRange::new(day(1), day(3)),
            total_price: Decimal::from(total),
            is_paid: false,
            cancelled: false,
        }
    }

    fn stored(
        booking: &Booking,
        status: PaymentStatus,
        amount: i64,
        reference: Option<&str>,
    ) -> Payment {
        Payment {
            id: Ulid::new(),
            booking_id: booking.id,
            amount: Decimal::from(amount),
            method: "card".into(),
            status,
            reference: reference.map(String::from),
            settled_at: Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn completed_takes_total_and_assigns_reference() {
        let b = booking(200);
        let terms = Terms {
            amount: Some(Decimal::from(5)),
            ..Terms::default()
        };
        let s = settle(&PaymentStatus::Completed, &b, terms, None, now()).unwrap();
        assert_eq!(s.amount, Decimal::from(200));
        assert_eq!(s.settled_at, Some(now()));
        let reference = s.reference.unwrap();
        assert!(reference.starts_with(&format!("TXN-{}-", b.id)));
    }

    #[test]
    fn completed_keeps_given_and_prior_values() {
        let b = booking(200);
        let given = Terms {
            reference: Some("bank-77".into()),
            ..Terms::default()
        };
        let s = settle(&PaymentStatus::Completed, &b, given, None, now()).unwrap();
        assert_eq!(s.reference.as_deref(), Some("bank-77"));

        let prior = stored(&b, PaymentStatus::pending(), 50, Some("auth-1"));
        let s = settle(
            &PaymentStatus::Completed,
            &b,
            Terms::default(),
            Some(&prior),
            now(),
        )
        .unwrap();
        assert_eq!(s.reference.as_deref(), Some("auth-1"));
        assert_eq!(s.settled_at, prior.settled_at);
    }

    #[test]
    fn references_are_unique() {
        let b = booking(200);
        let r1 = generate_reference(b.id);
        let r2 = generate_reference(b.id);
        assert_ne!(r1, r2);
    }

    #[test]
    fn failed_clears_everything() {
        let b = booking(200);
        let prior = stored(&b, PaymentStatus::Completed, 200, Some("TXN-x"));
        let terms = Terms {
            amount: Some(Decimal::from(200)),
            reference: Some("keep-me".into()),
            settled_at: Some(now()),
        };
        let s = settle(&PaymentStatus::Failed, &b, terms, Some(&prior), now()).unwrap();
        assert_eq!(
            s,
            Settlement {
                amount: Decimal::ZERO,
                reference: None,
                settled_at: None
            }
        );
    }

    #[test]
    fn other_status_bounds_amount() {
        let b = booking(200);
        let status = PaymentStatus::parse("authorized");
        let with = |a: i64| Terms {
            amount: Some(Decimal::from(a)),
            ..Terms::default()
        };
        assert_eq!(settle(&status, &b, with(200), None, now()).unwrap().amount, Decimal::from(200));
        assert_eq!(settle(&status, &b, with(1), None, now()).unwrap().amount, Decimal::from(1));
        for bad in [0, -5, 201] {
            assert!(matches!(
                settle(&status, &b, with(bad), None, now()),
                Err(EngineError::Validation(_))
            ));
        }
    }

    #[test]
    fn other_status_needs_an_amount_on_create() {
        let b = booking(200);
        let err = settle(&PaymentStatus::pending(), &b, Terms::default(), None, now()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn other_status_carries_prior_values_on_update() {
        let b = booking(200);
        let prior = stored(&b, PaymentStatus::pending(), 80, Some("auth-9"));
        let s = settle(
            &PaymentStatus::parse("authorized"),
            &b,
            Terms::default(),
            Some(&prior),
            now(),
        )
        .unwrap();
        assert_eq!(s.amount, Decimal::from(80));
        assert_eq!(s.reference.as_deref(), Some("auth-9"));
        assert_eq!(s.settled_at, prior.settled_at);
    }

    #[test]
    fn refunded_is_reserved() {
        let b = booking(200);
        let err = settle(&PaymentStatus::Refunded, &b, Terms::default(), None, now()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn method_and_reference_limits() {
        assert!(validate_method("card").is_ok());
        assert!(validate_method("  ").is_err());
        assert!(validate_method(&"m".repeat(MAX_METHOD_LEN + 1)).is_err());
        assert!(validate_reference(None).is_ok());
        assert!(validate_reference(Some(&"r".repeat(MAX_REFERENCE_LEN + 1))).is_err());
    }
}
