//! Message delete ranges.
//!
//! Ranges are inclusive-exclusive `[low, hi)` over sequence ids. Clients may
//! address a single message with `hi == 0` or `hi == low`; internally every
//! range is explicit.

use crate::errors::TopicError;
use crate::protocol::DelRangeWire;

/// Half-open range of sequence ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelRange {
    pub low: u64,
    pub hi: u64,
}

impl DelRange {
    #[must_use]
    pub const fn new(low: u64, hi: u64) -> Self {
        Self { low, hi }
    }

    /// Number of sequence ids covered.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.hi.saturating_sub(self.low)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.hi <= self.low
    }

    #[must_use]
    pub const fn contains(&self, seq: u64) -> bool {
        seq >= self.low && seq < self.hi
    }

    /// Client form: a single message is sent without `hi`.
    #[must_use]
    pub const fn to_wire(self) -> DelRangeWire {
        if self.hi == self.low + 1 {
            DelRangeWire {
                low: self.low,
                hi: 0,
            }
        } else {
            DelRangeWire {
                low: self.low,
                hi: self.hi,
            }
        }
    }
}

/// Validated, normalized delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteSet {
    pub ranges: Vec<DelRange>,
    /// Messages addressed before merging overlaps.
    pub requested: u64,
}

/// Validate client ranges against the topic's last sequence id, then sort and
/// merge them.
///
/// A range whose `low` is past `last_id`, whose `hi` is below `low`, or whose
/// `low` is zero is malformed. `hi` past the end is clipped to `last_id + 1`.
/// The count cap applies only when more than one span survives merging.
///
/// # Errors
///
/// Returns `TopicError::Malformed` for an empty list, an invalid entry, or
/// when the cap is exceeded.
pub fn prepare(
    input: &[DelRangeWire],
    last_id: u64,
    max_count: u64,
) -> Result<DeleteSet, TopicError> {
    if input.is_empty() {
        return Err(TopicError::Malformed("no ids to delete".into()));
    }

    let mut ranges = Vec::with_capacity(input.len());
    let mut requested: u64 = 0;
    for wire in input {
        if wire.low == 0 || wire.low > last_id || (wire.hi > 0 && wire.low > wire.hi) {
            return Err(TopicError::Malformed("invalid entry in list".into()));
        }
        let hi = if wire.hi > last_id {
            last_id + 1
        } else if wire.hi <= wire.low {
            wire.low + 1
        } else {
            wire.hi
        };
        let range = DelRange::new(wire.low, hi);
        requested = requested.saturating_add(range.len());
        ranges.push(range);
    }

    let ranges = normalize(ranges);
    if requested > max_count && ranges.len() > 1 {
        return Err(TopicError::Malformed("too many messages to delete".into()));
    }

    Ok(DeleteSet { ranges, requested })
}

/// Sort by `low` ascending then `hi` descending, and merge overlapping or
/// touching ranges.
#[must_use]
pub fn normalize(mut ranges: Vec<DelRange>) -> Vec<DelRange> {
    ranges.sort_by(|a, b| a.low.cmp(&b.low).then(b.hi.cmp(&a.hi)));

    let mut merged: Vec<DelRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(prev) if prev.hi >= range.low => {
                prev.hi = prev.hi.max(range.hi);
            }
            _ => merged.push(range),
        }
    }
    merged
}
