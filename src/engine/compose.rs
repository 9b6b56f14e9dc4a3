//! Multi-entity operations that commit or fail as one transaction.
//!
//! Each runs at `RepeatableRead`: the first read of a listing locks it, so
//! nothing can book over the checked dates before the insert commits.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::bookings::insert_checked;
use super::payments::{recompute_settled, settle, update_in, validate_method, Terms};
use super::{Engine, EngineError, IsolationLevel, Store, Transaction};

fn refund_reference(booking_id: Ulid) -> String {
    format!("RFD-{booking_id}-{}", Ulid::new())
}

async fn book_and_pay<X: Transaction>(
    tx: &X,
    request: BookingRequest,
    method: String,
) -> Result<BookingWithPayment, EngineError> {
    validate_method(&method)?;
    let booking = insert_checked(tx, request).await?;
    let status = PaymentStatus::pending();
    let full_price = Terms {
        amount: Some(booking.total_price),
        ..Terms::default()
    };
    let settlement = settle(&status, &booking, full_price, None, Utc::now())?;
    let payment = tx
        .insert_payment(NewPayment {
            booking_id: booking.id,
            amount: settlement.amount,
            method,
            status,
            reference: settlement.reference,
            settled_at: settlement.settled_at,
        })
        .await?;
    Ok(BookingWithPayment {
        booking_id: booking.id,
        payment_id: payment.id,
    })
}

async fn cancel_and_refund<X: Transaction>(
    tx: &X,
    booking_id: Ulid,
) -> Result<Payment, EngineError> {
    let mut booking = tx.get_booking(booking_id).await?;
    if booking.cancelled {
        return Err(EngineError::validation(format!(
            "booking {booking_id} is already cancelled"
        )));
    }
    let payments = tx.payments_for_booking(booking_id).await?;
    let paid: Decimal = payments
        .iter()
        .filter(|p| p.status.is_completed())
        .map(|p| p.amount)
        .sum();
    let method = payments
        .iter()
        .rev()
        .find(|p| p.status.is_completed())
        .map_or_else(|| "refund".to_string(), |p| p.method.clone());

    booking.cancelled = true;
    tx.update_booking(&booking).await?;
    let refund = tx
        .insert_payment(NewPayment {
            booking_id,
            amount: Decimal::ZERO - paid,
            method,
            status: PaymentStatus::Refunded,
            reference: Some(refund_reference(booking_id)),
            settled_at: Some(Utc::now()),
        })
        .await?;
    recompute_settled(tx, booking_id).await?;
    Ok(refund)
}

impl<S: Store> Engine<S> {
    /// Book a stay and open a pending payment for its full price. Either both
    /// rows exist afterwards or neither does.
    pub async fn create_booking_with_payment(
        &self,
        listing_id: Ulid,
        guest_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        method: impl Into<String>,
    ) -> Result<BookingWithPayment, EngineError> {
        let request = BookingRequest {
            listing_id,
            guest_id,
            range: StayRange::new(start, end),
        };
        let method = method.into();
        self.transact("create_booking_with_payment", async {
            let tx = self.store.begin(IsolationLevel::RepeatableRead).await?;
            let result = book_and_pay(&tx, request, method).await;
            Ok((tx, result))
        })
        .await
    }

    /// Mark a payment completed, keeping `reference` when given and
    /// generating one otherwise, and settle its booking.
    pub async fn confirm_payment(
        &self,
        payment_id: Ulid,
        reference: Option<String>,
    ) -> Result<Payment, EngineError> {
        let mut update = PaymentUpdate::status(PaymentStatus::Completed);
        update.reference = reference;
        self.transact("confirm_payment", async {
            let tx = self.store.begin(IsolationLevel::RepeatableRead).await?;
            let result = update_in(&tx, payment_id, update).await;
            Ok((tx, result))
        })
        .await
    }

    /// Cancel a booking, releasing its dates, and record one refund payment
    /// for everything completed against it. Returns the refund.
    pub async fn cancel_booking_with_refund(
        &self,
        booking_id: Ulid,
    ) -> Result<Payment, EngineError> {
        let refund = self
            .transact("cancel_booking_with_refund", async {
                let tx = self.store.begin(IsolationLevel::RepeatableRead).await?;
                let result = cancel_and_refund(&tx, booking_id).await;
                Ok((tx, result))
            })
            .await?;
        info!(
            "booking {booking_id} cancelled, refunded {} as {}",
            refund.amount,
            refund.reference.as_deref().unwrap_or_default()
        );
        Ok(refund)
    }
}
