//! Ordered sets of disjoint resource intervals.
//!
//! Bus numbers and address windows handed out by a bridge are tracked as `(base, len)`
//! intervals. Unlike a byte-range cache, a bridge's free list must never silently absorb an
//! overlapping insert: overlapping data means the firmware description is contradictory, so
//! [`RangeSet::insert`] reports it instead of merging.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod proptests;

pub type Result<T> = std::result::Result<T, RangeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("interval has zero length")]
    Empty,

    #[error("interval at {base:#x} with length {len:#x} wraps the address space")]
    Overflow { base: u64, len: u64 },

    #[error("interval {base:#x}+{len:#x} overlaps existing interval {existing:?}")]
    Overlap {
        base: u64,
        len: u64,
        existing: Interval,
    },

    #[error("interval {base:#x}+{len:#x} is not inside a single stored interval")]
    NotContained { base: u64, len: u64 },

    #[error("alignment {align:#x} is not a power of two")]
    BadAlignment { align: u64 },
}

/// A half-open interval `[base, base + len)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub base: u64,
    pub len: u64,
}

impl Interval {
    pub const fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    /// Exclusive end. Saturates instead of wrapping for intervals touching `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }

    /// Inclusive end, or `None` for an empty interval.
    pub fn last(&self) -> Option<u64> {
        (self.len != 0).then(|| self.end() - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, other: &Interval) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        !self.is_empty() && !other.is_empty() && self.base < other.end() && other.base < self.end()
    }
}

/// Sorted, disjoint intervals.
///
/// Invariants:
/// - Intervals are stored in ascending order of base.
/// - No two intervals overlap or touch; adjacent inserts are coalesced.
/// - Every stored interval is non-empty.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    intervals: Vec<Interval>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }

    /// Builds a set from arbitrary intervals, failing on the first overlap.
    pub fn try_from_intervals<I>(intervals: I) -> Result<Self>
    where
        I: IntoIterator<Item = Interval>,
    {
        let mut set = Self::new();
        for interval in intervals {
            set.insert(interval.base, interval.len)?;
        }
        Ok(set)
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> + '_ {
        self.intervals.iter()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn total_len(&self) -> u64 {
        self.intervals.iter().map(|r| r.len).sum()
    }

    pub fn first(&self) -> Option<Interval> {
        self.intervals.first().copied()
    }

    pub fn last(&self) -> Option<Interval> {
        self.intervals.last().copied()
    }

    /// The interval from the lowest base to the highest end, holes included.
    pub fn span(&self) -> Option<Interval> {
        let first = self.first()?;
        let last = self.last()?;
        Some(Interval::new(first.base, last.end() - first.base))
    }

    /// Holes between consecutive stored intervals, in ascending order.
    pub fn gaps(&self) -> impl Iterator<Item = Interval> + '_ {
        self.intervals
            .windows(2)
            .map(|pair| Interval::new(pair[0].end(), pair[1].base - pair[0].end()))
    }

    /// Inserts `[base, base + len)`, coalescing with touching neighbours.
    ///
    /// An overlap with a stored interval leaves the set untouched and returns
    /// [`RangeError::Overlap`].
    pub fn insert(&mut self, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(RangeError::Empty);
        }
        let end = base
            .checked_add(len)
            .ok_or(RangeError::Overflow { base, len })?;

        // First interval that ends at or after `base`: the only candidates for touching on the
        // left or overlapping.
        let idx = self.intervals.partition_point(|r| r.end() < base);
        let new = Interval::new(base, len);
        if let Some(existing) = self.intervals[idx..]
            .iter()
            .take_while(|r| r.base <= end)
            .find(|r| r.overlaps(&new))
        {
            return Err(RangeError::Overlap {
                base,
                len,
                existing: *existing,
            });
        }

        let merge_left = self.intervals.get(idx).is_some_and(|r| r.end() == base);
        let right = if merge_left { idx + 1 } else { idx };
        let merge_right = self.intervals.get(right).is_some_and(|r| r.base == end);

        match (merge_left, merge_right) {
            (true, true) => {
                let next = self.intervals.remove(right);
                self.intervals[idx].len += len + next.len;
            }
            (true, false) => self.intervals[idx].len += len,
            (false, true) => {
                let next = self.intervals[right];
                self.intervals[right] = Interval::new(base, len + next.len);
            }
            (false, false) => self.intervals.insert(idx, new),
        }
        Ok(())
    }

    /// Removes `[base, base + len)`, which must lie inside one stored interval.
    ///
    /// The covering interval is split into zero, one or two pieces.
    pub fn remove(&mut self, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(RangeError::Empty);
        }
        let end = base
            .checked_add(len)
            .ok_or(RangeError::Overflow { base, len })?;

        let idx = self.intervals.partition_point(|r| r.end() <= base);
        let Some(covering) = self.intervals.get(idx).copied() else {
            return Err(RangeError::NotContained { base, len });
        };
        if covering.base > base || covering.end() < end {
            return Err(RangeError::NotContained { base, len });
        }

        let keep_front = covering.base < base;
        let keep_back = end < covering.end();
        match (keep_front, keep_back) {
            (false, false) => {
                self.intervals.remove(idx);
            }
            (true, false) => self.intervals[idx].len = base - covering.base,
            (false, true) => self.intervals[idx] = Interval::new(end, covering.end() - end),
            (true, true) => {
                self.intervals[idx].len = base - covering.base;
                self.intervals
                    .insert(idx + 1, Interval::new(end, covering.end() - end));
            }
        }
        Ok(())
    }

    /// Returns whether a single stored interval fully covers `[base, base + len)`.
    pub fn contains(&self, base: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = base.checked_add(len) else {
            return false;
        };
        let idx = self.intervals.partition_point(|r| r.end() <= base);
        self.intervals
            .get(idx)
            .is_some_and(|r| r.base <= base && r.end() >= end)
    }

    /// First-fit allocation of `size` units aligned to `align`.
    ///
    /// On success the allocated piece is removed from the set and its base returned;
    /// `Ok(None)` means no stored interval can hold it.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<Option<u64>> {
        if size == 0 {
            return Err(RangeError::Empty);
        }
        if !align.is_power_of_two() {
            return Err(RangeError::BadAlignment { align });
        }

        let found = self.intervals.iter().find_map(|r| {
            let base = align_up(r.base, align)?;
            let end = base.checked_add(size)?;
            (end <= r.end()).then_some(base)
        });
        let Some(base) = found else {
            return Ok(None);
        };
        self.remove(base, size)?;
        Ok(Some(base))
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(intervals: &[(u64, u64)]) -> RangeSet {
        RangeSet::try_from_intervals(intervals.iter().map(|&(b, l)| Interval::new(b, l))).unwrap()
    }

    #[test]
    fn insert_coalesces_touching_intervals() {
        let mut rs = RangeSet::new();
        rs.insert(0, 10).unwrap();
        rs.insert(10, 10).unwrap();
        rs.insert(30, 5).unwrap();

        assert_eq!(
            rs.intervals(),
            &[Interval::new(0, 20), Interval::new(30, 5)]
        );
    }

    #[test]
    fn insert_bridging_two_intervals_merges_all_three() {
        let mut rs = set(&[(0, 10), (20, 10)]);
        rs.insert(10, 10).unwrap();
        assert_eq!(rs.intervals(), &[Interval::new(0, 30)]);
    }

    #[test]
    fn insert_before_existing_merges_on_the_right() {
        let mut rs = set(&[(20, 10)]);
        rs.insert(15, 5).unwrap();
        rs.insert(0, 5).unwrap();
        assert_eq!(rs.intervals(), &[Interval::new(0, 5), Interval::new(15, 15)]);
    }

    #[test]
    fn overlapping_insert_is_rejected_without_mutation() {
        let mut rs = set(&[(0, 10), (20, 10)]);
        let before = rs.clone();

        let err = rs.insert(5, 10).unwrap_err();
        assert_eq!(
            err,
            RangeError::Overlap {
                base: 5,
                len: 10,
                existing: Interval::new(0, 10),
            }
        );

        // Touching the left neighbour but overlapping the right one.
        let err = rs.insert(10, 11).unwrap_err();
        assert!(matches!(err, RangeError::Overlap { existing, .. } if existing == Interval::new(20, 10)));

        assert_eq!(rs, before);
    }

    #[test]
    fn zero_length_and_wrapping_inserts_are_rejected() {
        let mut rs = RangeSet::new();
        assert_eq!(rs.insert(5, 0), Err(RangeError::Empty));
        assert_eq!(
            rs.insert(u64::MAX, 2),
            Err(RangeError::Overflow {
                base: u64::MAX,
                len: 2
            })
        );
        assert!(rs.is_empty());
    }

    #[test]
    fn remove_splits_front_back_middle_and_whole() {
        let mut rs = set(&[(100, 50)]);
        rs.remove(100, 10).unwrap();
        assert_eq!(rs.intervals(), &[Interval::new(110, 40)]);

        rs.remove(140, 10).unwrap();
        assert_eq!(rs.intervals(), &[Interval::new(110, 30)]);

        rs.remove(120, 5).unwrap();
        assert_eq!(
            rs.intervals(),
            &[Interval::new(110, 10), Interval::new(125, 15)]
        );

        rs.remove(110, 10).unwrap();
        assert_eq!(rs.intervals(), &[Interval::new(125, 15)]);
    }

    #[test]
    fn remove_then_insert_restores_single_interval() {
        let mut rs = set(&[(100, 50)]);
        rs.remove(110, 10).unwrap();
        rs.insert(110, 10).unwrap();
        assert_eq!(rs, set(&[(100, 50)]));
    }

    #[test]
    fn remove_outside_any_interval_is_reported() {
        let mut rs = set(&[(0, 10), (20, 10)]);
        assert_eq!(
            rs.remove(5, 20),
            Err(RangeError::NotContained { base: 5, len: 20 })
        );
        assert_eq!(
            rs.remove(10, 5),
            Err(RangeError::NotContained { base: 10, len: 5 })
        );
        assert_eq!(rs, set(&[(0, 10), (20, 10)]));
    }

    #[test]
    fn contains_requires_a_single_covering_interval() {
        let rs = set(&[(0, 10), (20, 10)]);

        assert!(rs.contains(0, 1));
        assert!(rs.contains(1, 9));
        assert!(!rs.contains(9, 2));
        assert!(!rs.contains(10, 10));
        assert!(rs.contains(20, 10));
        assert!(!rs.contains(25, 10));
    }

    #[test]
    fn allocate_is_first_fit_and_aligned() {
        let mut rs = set(&[(0x1004, 0x10), (0x2000, 0x1000)]);

        // The first interval cannot hold an aligned 0x10 chunk.
        assert_eq!(rs.allocate(0x10, 0x10).unwrap(), Some(0x2000));
        assert_eq!(rs.allocate(0x8, 0x4).unwrap(), Some(0x1004));
        assert_eq!(rs.allocate(0x2000, 0x1).unwrap(), None);

        assert_eq!(
            rs.intervals(),
            &[Interval::new(0x100c, 0x8), Interval::new(0x2010, 0xff0)]
        );
    }

    #[test]
    fn allocate_rejects_bad_requests() {
        let mut rs = set(&[(0, 0x100)]);
        assert_eq!(rs.allocate(0, 1), Err(RangeError::Empty));
        assert_eq!(
            rs.allocate(0x10, 0x18),
            Err(RangeError::BadAlignment { align: 0x18 })
        );
    }

    #[test]
    fn span_and_gaps_describe_the_holes() {
        let rs = set(&[(0x1000, 0x1000), (0x4000, 0x1000), (0x8000, 0x100)]);
        assert_eq!(rs.span(), Some(Interval::new(0x1000, 0x7100)));
        assert_eq!(
            rs.gaps().collect::<Vec<_>>(),
            vec![Interval::new(0x2000, 0x2000), Interval::new(0x5000, 0x3000)]
        );
    }
}
