mod state;
mod tx;

pub use state::ListingState;
pub use tx::MemoryTx;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{
    EngineError, IsolationLevel, ListingRepo, ReservationRepo, Transaction, Transactor,
};
use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::*;
use crate::wal::Wal;

use state::IndexChange;
use tx::ListingGuard;

pub type SharedListingState = Arc<RwLock<ListingState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Rewrite the WAL as a snapshot of what it currently describes. Runs on the
/// writer task, so no append can interleave with it.
fn compact(wal: &mut Wal) -> io::Result<()> {
    wal.flush_sync()?;
    let commits = Wal::replay(wal.path())?;
    let before = commits.len();
    let events = snapshot(commits);
    Wal::write_compact_file(wal.path(), &events)?;
    wal.swap_compact_file()?;
    info!(
        "compacted WAL {}: {before} commits -> {} events",
        wal.path().display(),
        events.len()
    );
    Ok(())
}

/// Fold committed events into per-listing state and emit the minimal event
/// list that recreates it.
fn snapshot(commits: Vec<Vec<Event>>) -> Vec<Event> {
    let mut listings: BTreeMap<Ulid, ListingState> = BTreeMap::new();
    for event in commits.iter().flatten() {
        match event {
            Event::ListingPut { listing } => {
                listings
                    .entry(listing.id)
                    .and_modify(|rs| rs.listing = listing.clone())
                    .or_insert_with(|| ListingState::new(listing.clone()));
            }
            other => {
                if let Some(rs) = listings.get_mut(&other.listing_id()) {
                    rs.apply(other);
                }
            }
        }
    }
    let mut events = Vec::new();
    for rs in listings.values() {
        rs.snapshot_events(&mut events);
    }
    events
}

struct StoreInner {
    listings: DashMap<Ulid, SharedListingState>,
    /// Reverse lookup: booking/payment id → listing id
    entity_to_listing: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
}

/// In-memory, WAL-backed storage. Cheap to clone; clones share state.
///
/// The no-overlap invariant is enforced here, under the listing's write
/// lock, for every booking insert and update.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            inner: Arc::new(StoreInner {
                listings: DashMap::new(),
                entity_to_listing: DashMap::new(),
                wal_tx,
            }),
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this runs inside an async context.
        let mut replayed = 0usize;
        for event in commits.iter().flatten() {
            match event {
                Event::ListingPut { listing } => store.install_listing(listing),
                other => {
                    let listing_id = other.listing_id();
                    let Some(rs) = store.shared_state(&listing_id) else {
                        warn!("replay: event for unknown listing {listing_id}");
                        continue;
                    };
                    let Ok(mut guard) = rs.try_write() else {
                        warn!("replay: listing {listing_id} unexpectedly locked");
                        continue;
                    };
                    let changes = guard.apply(other);
                    store.apply_index(listing_id, changes);
                }
            }
            replayed += 1;
        }
        info!(
            "opened store {}: {} listings, {replayed} events replayed",
            wal_path.display(),
            store.inner.listings.len()
        );
        metrics::gauge!(crate::observability::LISTINGS_LOADED)
            .set(store.inner.listings.len() as f64);

        Ok(store)
    }

    fn install_listing(&self, listing: &Listing) {
        if let Some(rs) = self.shared_state(&listing.id)
            && let Ok(mut guard) = rs.try_write()
        {
            guard.listing = listing.clone();
            return;
        }
        self.inner.listings.insert(
            listing.id,
            Arc::new(RwLock::new(ListingState::new(listing.clone()))),
        );
    }

    /// Create or reprice a listing. Listing management proper lives outside
    /// this crate; this exists for seeding and tests.
    pub async fn put_listing(&self, listing: Listing) -> Result<(), EngineError> {
        let event = Event::ListingPut {
            listing: listing.clone(),
        };
        match self.shared_state(&listing.id) {
            Some(rs) => {
                let mut guard = rs.write().await;
                self.wal_append(vec![event]).await?;
                guard.listing = listing;
            }
            None => {
                self.wal_append(vec![event]).await?;
                self.inner
                    .listings
                    .entry(listing.id)
                    .or_insert_with(|| Arc::new(RwLock::new(ListingState::new(listing))));
            }
        }
        metrics::gauge!(crate::observability::LISTINGS_LOADED)
            .set(self.inner.listings.len() as f64);
        Ok(())
    }

    pub fn listing_count(&self) -> usize {
        self.inner.listings.len()
    }

    pub fn listing_ids(&self) -> Vec<Ulid> {
        self.inner.listings.iter().map(|e| *e.key()).collect()
    }

    pub fn shared_state(&self, listing_id: &Ulid) -> Option<SharedListingState> {
        self.inner.listings.get(listing_id).map(|e| e.value().clone())
    }

    pub fn listing_of(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.inner.entity_to_listing.get(entity_id).map(|e| *e.value())
    }

    fn apply_index(&self, listing_id: Ulid, changes: Vec<IndexChange>) {
        for change in changes {
            match change {
                IndexChange::Map(id) => {
                    self.inner.entity_to_listing.insert(id, listing_id);
                }
                IndexChange::Unmap(id) => {
                    self.inner.entity_to_listing.remove(&id);
                }
            }
        }
    }

    /// Start a transaction without going through the trait.
    pub fn begin_tx(&self, isolation: IsolationLevel) -> MemoryTx {
        MemoryTx::new(self.clone(), isolation)
    }

    /// Write one commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::internal("wal append", None, "WAL writer shut down"))?;
        rx.await
            .map_err(|_| EngineError::internal("wal append", None, "WAL writer dropped response"))?
            .map_err(|e| EngineError::internal("wal append", None, e))
    }

    /// WAL-append + apply for a committing transaction. The caller hands over
    /// the guards of every listing the events touch.
    async fn commit_events(
        &self,
        mut guards: BTreeMap<Ulid, ListingGuard>,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        self.wal_append(events.clone()).await?;
        for event in &events {
            let listing_id = event.listing_id();
            let Some(guard) = guards.get_mut(&listing_id) else {
                // Unreachable: events are only recorded against locked listings.
                return Err(EngineError::internal(
                    "commit",
                    Some(listing_id),
                    "event for unlocked listing",
                ));
            };
            let changes = guard.apply(event);
            self.apply_index(listing_id, changes);
        }
        debug!("committed {} events across {} listings", events.len(), guards.len());
        metrics::counter!(crate::observability::TX_COMMITS_TOTAL).increment(1);
        Ok(())
    }

    /// Rewrite the WAL as a snapshot of the committed state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::internal("wal compact", None, "WAL writer shut down"))?;
        rx.await
            .map_err(|_| EngineError::internal("wal compact", None, "WAL writer dropped response"))?
            .map_err(|e| EngineError::internal("wal compact", None, e))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

// ── Auto-commit repository calls ─────────────────────────────────
//
// Each call outside a transaction runs as its own ReadCommitted unit.

#[async_trait]
impl ListingRepo for MemoryStore {
    async fn get_listing(&self, id: Ulid) -> Result<Listing, EngineError> {
        self.begin_tx(IsolationLevel::ReadCommitted).get_listing(id).await
    }
}

#[async_trait]
impl ReservationRepo for MemoryStore {
    async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.begin_tx(IsolationLevel::ReadCommitted).get_booking(id).await
    }

    async fn bookings_for_listing(&self, listing_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.begin_tx(IsolationLevel::ReadCommitted)
            .bookings_for_listing(listing_id)
            .await
    }

    async fn bookings_by_ids(&self, ids: &[Ulid]) -> Result<Vec<Booking>, EngineError> {
        self.begin_tx(IsolationLevel::ReadCommitted)
            .bookings_by_ids(ids)
            .await
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, EngineError> {
        let tx = self.begin_tx(IsolationLevel::ReadCommitted);
        let booking = tx.insert_booking(booking).await?;
        tx.commit().await?;
        Ok(booking)
    }

    async fn insert_bookings(
        &self,
        bookings: Vec<NewBooking>,
    ) -> Result<Vec<Booking>, EngineError> {
        let tx = self.begin_tx(IsolationLevel::ReadCommitted);
        let bookings = tx.insert_bookings(bookings).await?;
        tx.commit().await?;
        Ok(bookings)
    }

    async fn update_booking(&self, booking: &Booking) -> Result<(), EngineError> {
        let tx = self.begin_tx(IsolationLevel::ReadCommitted);
        tx.update_booking(booking).await?;
        tx.commit().await
    }

    async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let tx = self.begin_tx(IsolationLevel::ReadCommitted);
        tx.delete_booking(id).await?;
        tx.commit().await
    }

    async fn set_booking_paid(&self, id: Ulid, is_paid: bool) -> Result<(), EngineError> {
        let tx = self.begin_tx(IsolationLevel::ReadCommitted);
        tx.set_booking_paid(id, is_paid).await?;
        tx.commit().await
    }

    async fn get_payment(&self, id: Ulid) -> Result<Payment, EngineError> {
        self.begin_tx(IsolationLevel::ReadCommitted).get_payment(id).await
    }

    async fn payments_for_booking(&self, booking_id: Ulid) -> Result<Vec<Payment>, EngineError> {
        self.begin_tx(IsolationLevel::ReadCommitted)
            .payments_for_booking(booking_id)
            .await
    }

    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, EngineError> {
        let tx = self.begin_tx(IsolationLevel::ReadCommitted);
        let payment = tx.insert_payment(payment).await?;
        tx.commit().await?;
        Ok(payment)
    }

    async fn insert_payments(
        &self,
        payments: Vec<NewPayment>,
    ) -> Result<Vec<Payment>, EngineError> {
        let tx = self.begin_tx(IsolationLevel::ReadCommitted);
        let payments = tx.insert_payments(payments).await?;
        tx.commit().await?;
        Ok(payments)
    }

    async fn update_payment(&self, payment: &Payment) -> Result<(), EngineError> {
        let tx = self.begin_tx(IsolationLevel::ReadCommitted);
        tx.update_payment(payment).await?;
        tx.commit().await
    }

    async fn delete_payment(&self, id: Ulid) -> Result<(), EngineError> {
        let tx = self.begin_tx(IsolationLevel::ReadCommitted);
        tx.delete_payment(id).await?;
        tx.commit().await
    }
}

#[async_trait]
impl Transactor for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self, isolation: IsolationLevel) -> Result<MemoryTx, EngineError> {
        Ok(self.begin_tx(isolation))
    }
}
