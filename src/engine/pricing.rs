use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Flat nightly rate times whole nights, never less than one night.
/// Does not reject inverted ranges; the lifecycle validates those first.
pub fn nightly_total(start: NaiveDate, end: NaiveDate, nightly_price: Decimal) -> Decimal {
    let nights = (end - start).num_days().max(1);
    nightly_price * Decimal::from(nights)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn nights_times_rate() {
        assert_eq!(nightly_total(day(1), day(3), Decimal::from(100)), Decimal::from(200));
        assert_eq!(
            nightly_total(day(1), day(8), Decimal::new(9950, 2)),
            Decimal::new(69650, 2)
        );
    }

    #[test]
    fn clamps_to_one_night() {
        let rate = Decimal::from(80);
        assert_eq!(nightly_total(day(5), day(5), rate), rate);
        assert_eq!(nightly_total(day(5), day(2), rate), rate);
    }

    #[test]
    fn spans_month_boundary() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 30).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 2, 2).unwrap();
        assert_eq!(nightly_total(start, end, Decimal::from(10)), Decimal::from(30));
    }
}
