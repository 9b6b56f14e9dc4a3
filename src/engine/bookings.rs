use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

use super::conflict::{conflicts, find_conflict, validate_range};
use super::pricing::nightly_total;
use super::{
    Engine, EngineError, IsolationLevel, ListingRepo, ReservationRepo, Store, Transaction,
};

fn fast_path_conflict(listing_id: Ulid, range: StayRange, existing: Option<Ulid>) -> EngineError {
    metrics::counter!(crate::observability::CONFLICTS_TOTAL, "source" => "fast_path").increment(1);
    debug!("rejected {range} on listing {listing_id}: overlaps an active booking");
    EngineError::Conflict {
        listing_id,
        range,
        existing,
        position: None,
    }
}

/// Check and insert one booking inside an open transaction. The insert
/// re-checks the overlap under the listing's lock.
pub(super) async fn insert_checked<R>(
    repo: &R,
    request: BookingRequest,
) -> Result<Booking, EngineError>
where
    R: ListingRepo + ReservationRepo + ?Sized,
{
    let listing = repo.get_listing(request.listing_id).await?;
    validate_range(&request.range)?;
    let persisted = repo.bookings_for_listing(listing.id).await?;
    if let Some(existing) = find_conflict(&request.range, &persisted) {
        return Err(fast_path_conflict(listing.id, request.range, Some(existing.id)));
    }
    let booking = repo
        .insert_booking(NewBooking {
            listing_id: listing.id,
            host_id: listing.host_id,
            guest_id: request.guest_id,
            range: request.range,
            total_price: nightly_total(
                request.range.start,
                request.range.end,
                listing.nightly_price,
            ),
        })
        .await?;
    info!(
        "booking {} created on listing {} for {} ({})",
        booking.id, booking.listing_id, booking.range, booking.total_price
    );
    Ok(booking)
}

impl<S: Store> Engine<S> {
    /// Book `range` on a listing for a guest. The host and the total price
    /// come from the listing; the booking starts unsettled.
    pub async fn create_booking(
        &self,
        guest_id: Ulid,
        listing_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Booking, EngineError> {
        let request = BookingRequest {
            listing_id,
            guest_id,
            range: StayRange::new(start, end),
        };
        self.transact("create_booking", async {
            let tx = self.store.begin(IsolationLevel::ReadCommitted).await?;
            let result = insert_checked(&tx, request).await;
            Ok((tx, result))
        })
        .await
    }

    /// Move a booking to new dates. Listing, host and guest are kept; the
    /// price is recomputed from the listing's current rate.
    pub async fn update_booking(
        &self,
        id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Booking, EngineError> {
        self.transact("update_booking", async {
            let tx = self.store.begin(IsolationLevel::RepeatableRead).await?;
            let result = update_in(&tx, id, StayRange::new(start, end)).await;
            Ok((tx, result))
        })
        .await
    }

    /// Remove a booking and its payments.
    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        self.transact("delete_booking", async {
            let tx = self.store.begin(IsolationLevel::ReadCommitted).await?;
            let result = tx.delete_booking(id).await;
            Ok((tx, result))
        })
        .await?;
        info!("booking {id} deleted");
        Ok(())
    }

    /// Atomically book many stays. Candidates are checked in input order
    /// against persisted bookings and the ones accepted before them; the
    /// first conflict aborts the batch. Returns the number inserted.
    pub async fn batch_create_bookings(
        &self,
        requests: Vec<BookingRequest>,
    ) -> Result<usize, EngineError> {
        if requests.is_empty() {
            return Ok(0);
        }
        self.transact("batch_create_bookings", async {
            if requests.len() > MAX_BATCH_SIZE {
                return Err(EngineError::validation(format!(
                    "batch of {} bookings exceeds the limit of {MAX_BATCH_SIZE}",
                    requests.len()
                )));
            }
            let tx = self.store.begin(IsolationLevel::RepeatableRead).await?;
            let result = batch_in(&tx, requests).await;
            Ok((tx, result))
        })
        .await
    }
}

async fn update_in<X: Transaction>(
    tx: &X,
    id: Ulid,
    range: StayRange,
) -> Result<Booking, EngineError> {
    let mut booking = tx.get_booking(id).await?;
    if booking.cancelled {
        return Err(EngineError::validation(format!("booking {id} is cancelled")));
    }
    validate_range(&range)?;
    let listing = tx.get_listing(booking.listing_id).await?;
    let others = tx.bookings_for_listing(listing.id).await?;
    let clash = find_conflict(&range, others.iter().filter(|b| b.id != id));
    if let Some(existing) = clash {
        return Err(fast_path_conflict(listing.id, range, Some(existing.id)));
    }
    booking.range = range;
    booking.total_price = nightly_total(range.start, range.end, listing.nightly_price);
    tx.update_booking(&booking).await?;
    info!("booking {id} moved to {range} ({})", booking.total_price);
    Ok(booking)
}

/// Per-listing view cached for the duration of one batch.
struct ListingBatch {
    listing: Listing,
    persisted: Vec<Booking>,
    accepted: Vec<StayRange>,
}

async fn batch_in<X: Transaction>(
    tx: &X,
    requests: Vec<BookingRequest>,
) -> Result<usize, EngineError> {
    for (position, request) in requests.iter().enumerate() {
        validate_range(&request.range).map_err(|e| match e {
            EngineError::Validation(msg) => {
                EngineError::Validation(format!("batch candidate {position}: {msg}"))
            }
            other => other,
        })?;
    }

    let listing_ids: Vec<Ulid> = requests.iter().map(|r| r.listing_id).collect();
    tx.lock_listings(&listing_ids).await?;

    let mut by_listing: HashMap<Ulid, ListingBatch> = HashMap::new();
    let mut queue = Vec::with_capacity(requests.len());
    for (position, request) in requests.into_iter().enumerate() {
        let batch = match by_listing.entry(request.listing_id) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let listing = tx.get_listing(request.listing_id).await?;
                let persisted = tx.bookings_for_listing(listing.id).await?;
                slot.insert(ListingBatch {
                    listing,
                    persisted,
                    accepted: Vec::new(),
                })
            }
        };
        let clash = find_conflict(&request.range, &batch.persisted).map(|b| b.id);
        if clash.is_some() || conflicts(&request.range, &batch.accepted) {
            let err = fast_path_conflict(batch.listing.id, request.range, clash);
            return Err(err.at_position(position));
        }
        batch.accepted.push(request.range);
        queue.push(NewBooking {
            listing_id: batch.listing.id,
            host_id: batch.listing.host_id,
            guest_id: request.guest_id,
            range: request.range,
            total_price: nightly_total(
                request.range.start,
                request.range.end,
                batch.listing.nightly_price,
            ),
        });
    }

    let inserted = tx.insert_bookings(queue).await?.len();
    info!("batch inserted {inserted} bookings across {} listings", by_listing.len());
    Ok(inserted)
}
