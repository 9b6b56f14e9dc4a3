use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{
    EngineError, Entity, IsolationLevel, ListingRepo, ReservationRepo, Transaction,
};
use crate::model::*;

use super::MemoryStore;
use super::state::{IndexChange, ListingState};

pub(super) type ListingGuard = OwnedRwLockWriteGuard<ListingState>;

/// A transaction against [`MemoryStore`].
///
/// Listings are write-locked on first write (and on first read from
/// `RepeatableRead` up) and stay locked until commit or drop. Writes go to a
/// working copy of each locked listing; commit appends all recorded events
/// as one WAL entry and replays them onto the locked originals.
pub struct MemoryTx {
    store: MemoryStore,
    isolation: IsolationLevel,
    inner: Mutex<TxState>,
}

#[derive(Default)]
struct TxState {
    guards: BTreeMap<Ulid, ListingGuard>,
    working: HashMap<Ulid, ListingState>,
    /// Entity index overlay: `Some(listing)` mapped, `None` removed.
    index: HashMap<Ulid, Option<Ulid>>,
    events: Vec<Event>,
}

impl TxState {
    fn record(&mut self, event: Event) -> Result<(), EngineError> {
        let listing_id = event.listing_id();
        let state = self
            .working
            .get_mut(&listing_id)
            .ok_or_else(|| {
                EngineError::internal("record event", Some(listing_id), "listing not locked")
            })?;
        for change in state.apply(&event) {
            match change {
                IndexChange::Map(id) => self.index.insert(id, Some(listing_id)),
                IndexChange::Unmap(id) => self.index.insert(id, None),
            };
        }
        self.events.push(event);
        Ok(())
    }
}

impl MemoryTx {
    pub(super) fn new(store: MemoryStore, isolation: IsolationLevel) -> Self {
        Self {
            store,
            isolation,
            inner: Mutex::new(TxState::default()),
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Listing that owns a booking or payment, as seen by this transaction.
    fn resolve(&self, st: &TxState, entity_id: Ulid) -> Option<Ulid> {
        match st.index.get(&entity_id) {
            Some(mapped) => *mapped,
            None => self.store.listing_of(&entity_id),
        }
    }

    async fn acquire(&self, st: &TxState, listing_id: Ulid) -> Result<ListingGuard, EngineError> {
        let rs = self
            .store
            .shared_state(&listing_id)
            .ok_or(EngineError::not_found(Entity::Listing, listing_id))?;
        // Locks are taken in ascending id order; a lower id after a higher
        // one may only be taken if it is free right now.
        let out_of_order = st.guards.keys().next_back().is_some_and(|max| *max > listing_id);
        if out_of_order {
            rs.try_write_owned().map_err(|_| {
                EngineError::internal("lock listing", Some(listing_id), "lock order violation")
            })
        } else {
            Ok(rs.write_owned().await)
        }
    }

    async fn lock_for_write<'a>(
        &self,
        st: &'a mut TxState,
        listing_id: Ulid,
    ) -> Result<&'a mut ListingState, EngineError> {
        if !st.working.contains_key(&listing_id) {
            let guard = self.acquire(st, listing_id).await?;
            st.working.insert(listing_id, (*guard).clone());
            st.guards.insert(listing_id, guard);
        }
        st.working
            .get_mut(&listing_id)
            .ok_or(EngineError::not_found(Entity::Listing, listing_id))
    }

    /// Run `f` against the listing as this transaction sees it.
    async fn read_listing<R>(
        &self,
        st: &mut TxState,
        listing_id: Ulid,
        f: impl FnOnce(&ListingState) -> R,
    ) -> Result<R, EngineError> {
        if let Some(state) = st.working.get(&listing_id) {
            return Ok(f(state));
        }
        if self.isolation.locks_on_read() {
            let state = self.lock_for_write(st, listing_id).await?;
            return Ok(f(state));
        }
        let rs = self
            .store
            .shared_state(&listing_id)
            .ok_or(EngineError::not_found(Entity::Listing, listing_id))?;
        let guard = rs.read().await;
        Ok(f(&*guard))
    }

    fn booking_listing(&self, st: &TxState, booking_id: Ulid) -> Result<Ulid, EngineError> {
        self.resolve(st, booking_id)
            .ok_or(EngineError::not_found(Entity::Booking, booking_id))
    }

    fn payment_listing(&self, st: &TxState, payment_id: Ulid) -> Result<Ulid, EngineError> {
        self.resolve(st, payment_id)
            .ok_or(EngineError::not_found(Entity::Payment, payment_id))
    }

    async fn lock_sorted(&self, st: &mut TxState, listing_ids: &[Ulid]) -> Result<(), EngineError> {
        let mut ids = listing_ids.to_vec();
        ids.sort();
        ids.dedup();
        for id in ids {
            self.lock_for_write(st, id).await?;
        }
        Ok(())
    }

    async fn insert_booking_locked(
        &self,
        st: &mut TxState,
        new: NewBooking,
    ) -> Result<Booking, EngineError> {
        let state = self.lock_for_write(st, new.listing_id).await?;
        if let Err(e) = state.check_no_overlap(&new.range, None) {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL, "source" => "storage")
                .increment(1);
            return Err(e);
        }
        let booking = Booking {
            id: Ulid::new(),
            listing_id: new.listing_id,
            host_id: new.host_id,
            guest_id: new.guest_id,
            range: new.range,
            total_price: new.total_price,
            is_paid: false,
            cancelled: false,
        };
        st.record(Event::BookingCreated {
            booking: booking.clone(),
        })?;
        Ok(booking)
    }

    async fn insert_payment_locked(
        &self,
        st: &mut TxState,
        new: NewPayment,
    ) -> Result<Payment, EngineError> {
        let listing_id = self.booking_listing(st, new.booking_id)?;
        let state = self.lock_for_write(st, listing_id).await?;
        if state.booking(new.booking_id).is_none() {
            return Err(EngineError::not_found(Entity::Booking, new.booking_id));
        }
        let payment = Payment {
            id: Ulid::new(),
            booking_id: new.booking_id,
            amount: new.amount,
            method: new.method,
            status: new.status,
            reference: new.reference,
            settled_at: new.settled_at,
        };
        st.record(Event::PaymentCreated {
            listing_id,
            payment: payment.clone(),
        })?;
        Ok(payment)
    }
}

#[async_trait]
impl ListingRepo for MemoryTx {
    async fn get_listing(&self, id: Ulid) -> Result<Listing, EngineError> {
        let mut st = self.inner.lock().await;
        self.read_listing(&mut st, id, |s| s.listing.clone()).await
    }
}

#[async_trait]
impl ReservationRepo for MemoryTx {
    async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut st = self.inner.lock().await;
        let listing_id = self.booking_listing(&st, id)?;
        self.read_listing(&mut st, listing_id, |s| s.booking(id).cloned())
            .await?
            .ok_or(EngineError::not_found(Entity::Booking, id))
    }

    async fn bookings_for_listing(&self, listing_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let mut st = self.inner.lock().await;
        self.read_listing(&mut st, listing_id, |s| s.bookings.clone())
            .await
    }

    async fn bookings_by_ids(&self, ids: &[Ulid]) -> Result<Vec<Booking>, EngineError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_booking(*id).await?);
        }
        Ok(out)
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, EngineError> {
        let mut st = self.inner.lock().await;
        self.insert_booking_locked(&mut st, booking).await
    }

    async fn insert_bookings(
        &self,
        bookings: Vec<NewBooking>,
    ) -> Result<Vec<Booking>, EngineError> {
        let mut st = self.inner.lock().await;
        let listing_ids: Vec<Ulid> = bookings.iter().map(|b| b.listing_id).collect();
        self.lock_sorted(&mut st, &listing_ids).await?;
        let mut out = Vec::with_capacity(bookings.len());
        for (i, booking) in bookings.into_iter().enumerate() {
            let stored = self
                .insert_booking_locked(&mut st, booking)
                .await
                .map_err(|e| e.at_position(i))?;
            out.push(stored);
        }
        Ok(out)
    }

    async fn update_booking(&self, booking: &Booking) -> Result<(), EngineError> {
        let mut st = self.inner.lock().await;
        let listing_id = self.booking_listing(&st, booking.id)?;
        let state = self.lock_for_write(&mut st, listing_id).await?;
        if state.booking(booking.id).is_none() {
            return Err(EngineError::not_found(Entity::Booking, booking.id));
        }
        if booking.listing_id != listing_id {
            return Err(EngineError::validation("a booking cannot move to another listing"));
        }
        if booking.occupies()
            && let Err(e) = state.check_no_overlap(&booking.range, Some(booking.id))
        {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL, "source" => "storage")
                .increment(1);
            return Err(e);
        }
        st.record(Event::BookingUpdated {
            booking: booking.clone(),
        })
    }

    async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let mut st = self.inner.lock().await;
        let listing_id = self.booking_listing(&st, id)?;
        let state = self.lock_for_write(&mut st, listing_id).await?;
        if state.booking(id).is_none() {
            return Err(EngineError::not_found(Entity::Booking, id));
        }
        st.record(Event::BookingDeleted { id, listing_id })
    }

    async fn set_booking_paid(&self, id: Ulid, is_paid: bool) -> Result<(), EngineError> {
        let mut st = self.inner.lock().await;
        let listing_id = self.booking_listing(&st, id)?;
        let state = self.lock_for_write(&mut st, listing_id).await?;
        match state.booking(id) {
            None => Err(EngineError::not_found(Entity::Booking, id)),
            Some(b) if b.is_paid == is_paid => Ok(()),
            Some(_) => st.record(Event::BookingPaidSet {
                id,
                listing_id,
                is_paid,
            }),
        }
    }

    async fn get_payment(&self, id: Ulid) -> Result<Payment, EngineError> {
        let mut st = self.inner.lock().await;
        let listing_id = self.payment_listing(&st, id)?;
        self.read_listing(&mut st, listing_id, |s| s.payment(id).cloned())
            .await?
            .ok_or(EngineError::not_found(Entity::Payment, id))
    }

    async fn payments_for_booking(&self, booking_id: Ulid) -> Result<Vec<Payment>, EngineError> {
        let mut st = self.inner.lock().await;
        let listing_id = self.booking_listing(&st, booking_id)?;
        self.read_listing(&mut st, listing_id, |s| {
            s.booking(booking_id)
                .map(|_| s.payments_for(booking_id).cloned().collect::<Vec<_>>())
        })
        .await?
        .ok_or(EngineError::not_found(Entity::Booking, booking_id))
    }

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, EngineError> {
        let mut st = self.inner.lock().await;
        self.insert_payment_locked(&mut st, payment).await
    }

    async fn insert_payments(
        &self,
        payments: Vec<NewPayment>,
    ) -> Result<Vec<Payment>, EngineError> {
        let mut st = self.inner.lock().await;
        let mut listing_ids = Vec::with_capacity(payments.len());
        for p in &payments {
            listing_ids.push(self.booking_listing(&st, p.booking_id)?);
        }
        self.lock_sorted(&mut st, &listing_ids).await?;
        let mut out = Vec::with_capacity(payments.len());
        for payment in payments {
            out.push(self.insert_payment_locked(&mut st, payment).await?);
        }
        Ok(out)
    }

    async fn update_payment(&self, payment: &Payment) -> Result<(), EngineError> {
        let mut st = self.inner.lock().await;
        let listing_id = self.payment_listing(&st, payment.id)?;
        let state = self.lock_for_write(&mut st, listing_id).await?;
        let existing = state
            .payment(payment.id)
            .ok_or(EngineError::not_found(Entity::Payment, payment.id))?;
        if existing.booking_id != payment.booking_id {
            return Err(EngineError::validation("a payment cannot move to another booking"));
        }
        st.record(Event::PaymentUpdated {
            listing_id,
            payment: payment.clone(),
        })
    }

    async fn delete_payment(&self, id: Ulid) -> Result<(), EngineError> {
        let mut st = self.inner.lock().await;
        let listing_id = self.payment_listing(&st, id)?;
        let state = self.lock_for_write(&mut st, listing_id).await?;
        if state.payment(id).is_none() {
            return Err(EngineError::not_found(Entity::Payment, id));
        }
        st.record(Event::PaymentDeleted { id, listing_id })
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn lock_listings(&self, listing_ids: &[Ulid]) -> Result<(), EngineError> {
        let mut st = self.inner.lock().await;
        self.lock_sorted(&mut st, listing_ids).await
    }

    async fn commit(self) -> Result<(), EngineError> {
        let MemoryTx { store, inner, .. } = self;
        let st = inner.into_inner();
        if st.events.is_empty() {
            return Ok(());
        }
        // The commit runs on its own task so that a caller dropped past
        // this point cannot leave the WAL ahead of memory.
        let task = tokio::spawn(async move { store.commit_events(st.guards, st.events).await });
        task.await
            .map_err(|e| EngineError::internal("commit", None, e))?
    }

    async fn rollback(self) {
        let st = self.inner.into_inner();
        debug!(
            "rolled back transaction: {} events, {} listings",
            st.events.len(),
            st.guards.len()
        );
        metrics::counter!(crate::observability::TX_ROLLBACKS_TOTAL).increment(1);
    }
}
