//! Fitting a bridge's aggregate requirement into a concrete range.

use crate::filler::place_high;
use crate::request::{pack_from, BridgeRequirement, PlacedRequest};
use pci_fabric::{Interval, ResourceType};

/// Concrete placements for every entry of a requirement, in ascending address order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    pub entries: Vec<PlacedRequest>,
    /// New exclusive end of the range when it had to grow (bus numbers at a fabric root).
    pub extended_to: Option<u64>,
}

impl Layout {
    pub fn end(&self) -> Option<u64> {
        self.entries.iter().map(|p| p.end).max()
    }
}

/// The requirement does not fit the range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Unfit;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RangeFitter {
    /// Exclusive end the range may be grown to.
    extension_limit: Option<u64>,
}

impl RangeFitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows the range to grow up to `limit` (exclusive) instead of failing.
    pub fn with_extension_limit(mut self, limit: u64) -> Self {
        self.extension_limit = Some(limit);
        self
    }

    pub fn fit(&self, req: &BridgeRequirement, range: Interval) -> Result<Layout, Unfit> {
        if range.is_empty() {
            return Err(Unfit);
        }
        let range_end = range.end();

        let (Some(first), Some(last)) = (req.fixed_base(), req.fixed_end()) else {
            let entries = pack_from(&req.relocatable, range.base).ok_or(Unfit)?;
            let end = entries.last().map_or(range.base, |p| p.end);
            let extended_to = self.check_end(end, range_end)?;
            return Ok(Layout {
                entries,
                extended_to,
            });
        };

        if first < range.base {
            return Err(Unfit);
        }
        let mut extended_to = self.check_end(last, range_end)?;

        let mut relocatable = req.relocatable.clone();
        // Bus numbers below the bridge's own secondary bus are not reachable through it.
        let mut entries = match req.resource {
            ResourceType::Bus => Vec::new(),
            _ => place_high(&mut relocatable, range.base, first),
        };
        tracing::trace!(
            range_base = range.base,
            first,
            below = entries.len(),
            above = relocatable.len(),
            "fitting around fixed block"
        );
        entries.extend(req.fixed.iter().copied());

        if !relocatable.is_empty() {
            let tail = pack_from(&relocatable, last).ok_or(Unfit)?;
            let end = tail.last().map_or(last, |p| p.end);
            if let Some(grown) = self.check_end(end, extended_to.unwrap_or(range_end))? {
                extended_to = Some(grown);
            }
            entries.extend(tail);
        }

        Ok(Layout {
            entries,
            extended_to,
        })
    }

    fn check_end(&self, end: u64, range_end: u64) -> Result<Option<u64>, Unfit> {
        if end <= range_end {
            return Ok(None);
        }
        match self.extension_limit {
            Some(limit) if end <= limit => Ok(Some(end)),
            _ => Err(Unfit),
        }
    }
}
