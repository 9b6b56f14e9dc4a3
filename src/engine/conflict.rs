use crate::model::*;

use super::EngineError;

/// Anything that may hold a listing's dates.
pub trait Occupancy {
    /// The occupied range, or `None` when the dates are released.
    fn occupied(&self) -> Option<&StayRange>;
}

impl Occupancy for Booking {
    fn occupied(&self) -> Option<&StayRange> {
        self.occupies().then_some(&self.range)
    }
}

impl Occupancy for StayRange {
    fn occupied(&self) -> Option<&StayRange> {
        Some(self)
    }
}

/// First entry in `existing` that shares a night with `candidate`.
/// The caller scopes `existing` to a single listing.
pub fn find_conflict<'a, T: Occupancy + 'a>(
    candidate: &StayRange,
    existing: impl IntoIterator<Item = &'a T>,
) -> Option<&'a T> {
    existing
        .into_iter()
        .find(|e| e.occupied().is_some_and(|r| r.overlaps(candidate)))
}

pub fn conflicts<'a, T: Occupancy + 'a>(
    candidate: &StayRange,
    existing: impl IntoIterator<Item = &'a T>,
) -> bool {
    find_conflict(candidate, existing).is_some()
}

pub(crate) fn validate_range(range: &StayRange) -> Result<(), EngineError> {
    if range.is_empty() {
        return Err(EngineError::validation(format!(
            "stay {range} must end after it starts"
        )));
    }
    Ok(())
}
