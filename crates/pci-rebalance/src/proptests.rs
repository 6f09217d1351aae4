use crate::fitter::RangeFitter;
use crate::filler::fill;
use crate::request::{packed_end, BridgeRequirement, PlacedRequest, SizedRequest};
use pci_fabric::{Interval, NodeId, ResourceType, Slot};
use proptest::prelude::*;
use std::cmp::Reverse;

const BRIDGE: NodeId = NodeId(0);

/// Relocatable BAR-like needs, sorted the way the calculator hands them over.
fn relocatable_strategy() -> impl Strategy<Value = Vec<SizedRequest>> {
    prop::collection::vec((4u32..16, 0u64..4), 0..12).prop_map(|raw| {
        let mut list: Vec<SizedRequest> = raw
            .into_iter()
            .enumerate()
            .map(|(i, (shift, extra))| {
                let align = 1u64 << shift;
                let size = align * (extra + 1);
                SizedRequest::new(NodeId(i as u32 + 1), Slot::Bar(0x10), size, align)
            })
            .collect();
        list.sort_by_key(|r| (Reverse(r.align), Reverse(r.size)));
        list
    })
}

fn check_layout(entries: &[PlacedRequest], range: Interval) -> Result<(), TestCaseError> {
    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|p| p.base);
    for p in &sorted {
        prop_assert!(p.base >= range.base && p.end <= range.end(), "{p:?} outside {range:?}");
    }
    for pair in sorted.windows(2) {
        prop_assert!(pair[0].end <= pair[1].base, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
    Ok(())
}

proptest! {
    #[test]
    fn relocatable_layouts_are_disjoint_aligned_and_in_range(
        relocatable in relocatable_strategy(),
        base_pages in 0u64..0x100,
        len_pages in 1u64..0x40,
    ) {
        let range = Interval::new(base_pages << 12, len_pages << 12);
        let req = BridgeRequirement {
            relocatable: relocatable.clone(),
            ..BridgeRequirement::new(BRIDGE, ResourceType::Mem)
        };

        match RangeFitter::new().fit(&req, range) {
            Ok(layout) => {
                prop_assert_eq!(layout.entries.len(), relocatable.len());
                prop_assert_eq!(layout.extended_to, None);
                for (placed, need) in layout.entries.iter().zip(&relocatable) {
                    prop_assert_eq!(placed.owner, need.owner);
                    prop_assert_eq!(placed.len(), need.size);
                    prop_assert_eq!(placed.base % need.align, 0);
                }
                check_layout(&layout.entries, range)?;
            }
            Err(_) => {
                prop_assert!(packed_end(&relocatable, range.base).map_or(true, |end| end > range.end()));
            }
        }
    }

    #[test]
    fn fixed_blocks_never_move_and_nothing_overlaps_them(
        relocatable in relocatable_strategy(),
        fixed_page in 0x10u64..0x30,
        fixed_pages in 1u64..4,
    ) {
        let range = Interval::new(0, 0x40 << 12);
        let fixed = PlacedRequest::new(
            NodeId(100),
            Slot::Bar(0x10),
            fixed_page << 12,
            (fixed_page + fixed_pages) << 12,
        );
        let req = BridgeRequirement {
            relocatable,
            fixed: vec![fixed],
            ..BridgeRequirement::new(BRIDGE, ResourceType::Mem)
        };

        if let Ok(layout) = RangeFitter::new().fit(&req, range) {
            prop_assert!(layout.entries.contains(&fixed));
            prop_assert_eq!(layout.entries.len(), req.relocatable.len() + 1);
            check_layout(&layout.entries, range)?;
        }
    }

    #[test]
    fn filling_holes_keeps_every_need_exactly_once(
        relocatable in relocatable_strategy(),
        gap_pages in 0u64..0x20,
    ) {
        let low = PlacedRequest::new(NodeId(100), Slot::Bar(0x10), 0, 0x1000);
        let high_base = 0x1000 + (gap_pages << 12);
        let high = PlacedRequest::new(NodeId(101), Slot::Bar(0x10), high_base, high_base + 0x1000);
        let fixed = vec![
            BridgeRequirement::pinned(ResourceType::Mem, low),
            BridgeRequirement::pinned(ResourceType::Mem, high),
        ];

        let (rest, filled) = fill(ResourceType::Mem, relocatable.clone(), fixed);
        prop_assert_eq!(rest.len() + filled.len(), relocatable.len() + 2);

        let placed: Vec<PlacedRequest> = filled.iter().flat_map(|f| f.fixed.iter().copied()).collect();
        prop_assert_eq!(placed.first(), Some(&low));
        prop_assert_eq!(placed.last(), Some(&high));
        check_layout(&placed, Interval::new(0, high.end))?;
    }
}
