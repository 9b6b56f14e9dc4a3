use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use futures::future::join_all;
use rust_decimal::Decimal;
use ulid::Ulid;

use stayd::engine::{Engine, ErrorKind};
use stayd::model::*;
use stayd::store::MemoryStore;

// ── Test infrastructure ──────────────────────────────────────

fn wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("stayd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("stayd.wal")
}

fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + Days::new(offset)
}

async fn start_engine(path: PathBuf) -> Engine<MemoryStore> {
    Engine::new(Arc::new(MemoryStore::open(path).unwrap()))
}

async fn add_listing(engine: &Engine<MemoryStore>, nightly: i64) -> Listing {
    let listing = Listing {
        id: Ulid::new(),
        host_id: Ulid::new(),
        nightly_price: Decimal::from(nightly),
    };
    engine.store().put_listing(listing.clone()).await.unwrap();
    listing
}

fn assert_no_overlaps(bookings: &[Booking]) {
    let active: Vec<&Booking> = bookings.iter().filter(|b| !b.cancelled).collect();
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            assert!(!a.range.overlaps(&b.range), "{} overlaps {}", a.range, b.range);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn many_racing_creates_for_same_nights_admit_exactly_one() {
    let engine = start_engine(wal_path()).await;
    let listing = add_listing(&engine, 100).await;

    let attempts = (0..32).map(|i| {
        let engine = engine.clone();
        let listing_id = listing.id;
        // every attempt covers day 10
        let start = day(8 + i % 3);
        tokio::spawn(async move {
            engine
                .create_booking(Ulid::new(), listing_id, start, start + Days::new(3))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
    assert_eq!(engine.bookings_for_listing(listing.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_compose_and_batch_never_double_book() {
    let engine = start_engine(wal_path()).await;
    let listing = add_listing(&engine, 80).await;

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let engine = engine.clone();
        let listing_id = listing.id;
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine
                    .create_booking_with_payment(
                        listing_id,
                        Ulid::new(),
                        day(i),
                        day(i + 2),
                        "card",
                    )
                    .await
                    .map(|_| ())
            } else {
                let requests = (0..3)
                    .map(|k| BookingRequest {
                        listing_id,
                        guest_id: Ulid::new(),
                        range: StayRange::new(day(i + k * 2), day(i + k * 2 + 1)),
                    })
                    .collect();
                engine.batch_create_bookings(requests).await.map(|_| ())
            }
        }));
    }
    for h in join_all(handles).await {
        if let Err(e) = h.unwrap() {
            assert_eq!(e.kind(), ErrorKind::Conflict);
        }
    }

    let bookings = engine.bookings_for_listing(listing.id).await.unwrap();
    assert!(!bookings.is_empty());
    assert_no_overlaps(&bookings);
    // every compose booking still has its pending payment
    for b in &bookings {
        let payments = engine.payments_for_booking(b.id).await.unwrap();
        assert!(payments.len() <= 1);
        assert!(!b.is_paid);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listings_are_independent() {
    let engine = start_engine(wal_path()).await;
    let mut listings = Vec::new();
    for _ in 0..8 {
        listings.push(add_listing(&engine, 50).await);
    }

    let handles = listings.iter().map(|l| {
        let engine = engine.clone();
        let listing_id = l.id;
        tokio::spawn(async move {
            for k in 0..10 {
                engine
                    .create_booking(Ulid::new(), listing_id, day(k * 3), day(k * 3 + 2))
                    .await
                    .unwrap();
            }
        })
    });
    for h in join_all(handles).await {
        h.unwrap();
    }

    for l in &listings {
        assert_eq!(engine.bookings_for_listing(l.id).await.unwrap().len(), 10);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_payments_keep_settled_flag_consistent() {
    let engine = start_engine(wal_path()).await;
    let listing = add_listing(&engine, 100).await;
    let booking = engine
        .create_booking(Ulid::new(), listing.id, day(0), day(2))
        .await
        .unwrap();

    let handles = (0..12).map(|i| {
        let engine = engine.clone();
        let booking_id = booking.id;
        tokio::spawn(async move {
            let status = if i % 3 == 0 {
                PaymentStatus::Completed
            } else {
                PaymentStatus::Failed
            };
            let p = engine
                .create_payment(PaymentRequest::new(booking_id, "card", status))
                .await
                .unwrap();
            if i % 2 == 0 {
                engine.delete_payment(p.id).await.unwrap();
            }
        })
    });
    for h in join_all(handles).await {
        h.unwrap();
    }

    let payments = engine.payments_for_booking(booking.id).await.unwrap();
    let expected = payments.iter().any(|p| p.status.is_completed());
    assert_eq!(engine.get_booking(booking.id).await.unwrap().is_paid, expected);
    assert_eq!(payments.len(), 6);
}

#[tokio::test]
async fn restart_replays_committed_transactions_only() {
    let path = wal_path();
    let (listing, ids) = {
        let engine = start_engine(path.clone()).await;
        let listing = add_listing(&engine, 120).await;
        let ids = engine
            .create_booking_with_payment(listing.id, Ulid::new(), day(0), day(4), "card")
            .await
            .unwrap();
        engine.confirm_payment(ids.payment_id, Some("psp-1".into())).await.unwrap();
        // rejected compose leaves nothing behind, before or after restart
        engine
            .create_booking_with_payment(listing.id, Ulid::new(), day(1), day(2), "card")
            .await
            .unwrap_err();
        engine.store().compact_wal().await.unwrap();
        engine
            .create_booking(Ulid::new(), listing.id, day(4), day(6))
            .await
            .unwrap();
        (listing, ids)
    };

    let engine = start_engine(path).await;
    let bookings = engine.bookings_for_listing(listing.id).await.unwrap();
    assert_eq!(bookings.len(), 2);
    assert_eq!(bookings[0].id, ids.booking_id);
    assert!(bookings[0].is_paid);
    assert_eq!(bookings[0].total_price, Decimal::from(480));
    let payment = engine.get_payment(ids.payment_id).await.unwrap();
    assert_eq!(payment.reference.as_deref(), Some("psp-1"));
    assert_eq!(
        engine
            .create_booking(Ulid::new(), listing.id, day(5), day(7))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::Conflict
    );
}
