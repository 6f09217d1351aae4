use crate::{Interval, RangeSet};
use proptest::prelude::*;

const MAX_SLOTS: usize = 48;
const SLOT_SIZE: u64 = 0x100;

/// Non-overlapping intervals drawn from disjoint slots, shuffled into arbitrary insert order.
/// Neighbouring slots may produce touching intervals so coalescing is exercised.
fn disjoint_intervals_strategy() -> impl Strategy<Value = Vec<Interval>> {
    prop::collection::vec((any::<bool>(), 0u64..SLOT_SIZE, 1u64..=SLOT_SIZE), MAX_SLOTS)
        .prop_map(|slots| {
            slots
                .into_iter()
                .enumerate()
                .filter(|(_, (used, _, _))| *used)
                .map(|(i, (_, offset, len))| {
                    let slot_base = i as u64 * SLOT_SIZE;
                    // Full-width slots touch their neighbours.
                    if len == SLOT_SIZE {
                        Interval::new(slot_base, SLOT_SIZE)
                    } else {
                        let offset = offset.min(SLOT_SIZE - len);
                        Interval::new(slot_base + offset, len)
                    }
                })
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

fn assert_canonical(rs: &RangeSet) -> Result<(), TestCaseError> {
    for r in rs.intervals() {
        prop_assert!(r.len > 0);
    }
    for pair in rs.intervals().windows(2) {
        // Strictly separated: neither touching nor overlapping.
        prop_assert!(pair[0].end() < pair[1].base, "{:?} vs {:?}", pair[0], pair[1]);
    }
    Ok(())
}

proptest! {
    #[test]
    fn inserts_keep_intervals_coalesced(intervals in disjoint_intervals_strategy()) {
        let mut rs = RangeSet::new();
        for r in &intervals {
            rs.insert(r.base, r.len).unwrap();
        }

        assert_canonical(&rs)?;
        let inserted: u64 = intervals.iter().map(|r| r.len).sum();
        prop_assert_eq!(rs.total_len(), inserted);
        for r in &intervals {
            prop_assert!(rs.contains(r.base, r.len));
        }
    }

    #[test]
    fn removing_then_reinserting_restores_the_set(
        intervals in disjoint_intervals_strategy(),
        pick in any::<prop::sample::Index>(),
        cut in (0u64..SLOT_SIZE, 1u64..=SLOT_SIZE),
    ) {
        prop_assume!(!intervals.is_empty());
        let rs = RangeSet::try_from_intervals(intervals.iter().copied()).unwrap();

        let covering = rs.intervals()[pick.index(rs.len())];
        let offset = cut.0 % covering.len;
        let len = cut.1.min(covering.len - offset);

        let mut edited = rs.clone();
        edited.remove(covering.base + offset, len).unwrap();
        assert_canonical(&edited)?;
        prop_assert_eq!(edited.total_len(), rs.total_len() - len);
        prop_assert!(!edited.contains(covering.base + offset, 1));

        edited.insert(covering.base + offset, len).unwrap();
        prop_assert_eq!(edited, rs);
    }
}
