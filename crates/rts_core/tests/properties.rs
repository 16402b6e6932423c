//! Property tests for search determinism and the occupancy ledger.

use proptest::prelude::*;

use rts_core::map::{AnnotatedMap, Footprint, GridPos, Surface};
use rts_core::route::PlannerConfig;
use rts_core::search::{PathQuery, PathStatus, SearchEngine};
use rts_test_utils::determinism::strategies::{arb_cell, arb_map};

const W: u32 = 12;
const H: u32 = 10;

#[derive(Debug, Clone)]
enum LedgerOp {
    Add(GridPos, u8, Surface),
    /// Remove the placed footprint at this index, modulo the count.
    Remove(usize),
}

fn arb_surface() -> impl Strategy<Value = Surface> {
    prop::sample::select(Surface::ALL.to_vec())
}

fn arb_ledger_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        3 => (arb_cell(W - 1, H - 1), 1u8..=2, arb_surface())
            .prop_map(|(at, size, surface)| LedgerOp::Add(at, size, surface)),
        2 => any::<usize>().prop_map(LedgerOp::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_same_query_same_outcome(
        map in arb_map(W as usize, H as usize, 4),
        goal in arb_cell(W, H),
        detour in arb_cell(W, H),
        pool_capacity in prop_oneof![Just(8usize), Just(4096usize)],
    ) {
        let config = PlannerConfig { pool_capacity, ..PlannerConfig::default() };
        let query = PathQuery::land(GridPos::new(0, 0), goal);

        let mut fresh = SearchEngine::new(&config);
        let first = fresh.search(&map, &query).unwrap();

        // A reused engine must not be influenced by its previous search.
        let mut reused = SearchEngine::new(&config);
        reused.search(&map, &PathQuery::land(GridPos::new(W - 1, H - 1), detour)).unwrap();
        let second = reused.search(&map, &query).unwrap();
        prop_assert_eq!(&first, &second);

        match first.status {
            PathStatus::Found => {
                prop_assert_eq!(first.path.first(), Some(&query.start));
                prop_assert_eq!(first.path.last(), Some(&goal));
            }
            PathStatus::PartialFound => {
                prop_assert_eq!(first.path.first(), Some(&query.start));
            }
            PathStatus::Unreachable => prop_assert!(first.path.is_empty()),
        }
    }

    #[test]
    fn prop_occupancy_ledger_stays_consistent(
        ops in proptest::collection::vec(arb_ledger_op(), 1..60),
    ) {
        let mut map = AnnotatedMap::new(W, H).unwrap();
        let mut placed: Vec<(Footprint, Surface)> = Vec::new();

        for op in ops {
            match op {
                LedgerOp::Add(at, size, surface) => {
                    let footprint = Footprint::new(at, size);
                    map.add_occupant(footprint, surface).unwrap();
                    placed.push((footprint, surface));
                }
                LedgerOp::Remove(pick) => {
                    if placed.is_empty() {
                        continue;
                    }
                    let (footprint, surface) = placed.swap_remove(pick % placed.len());
                    map.remove_occupant(footprint, surface).unwrap();
                }
            }
            prop_assert!(map.verify_occupancy());
        }

        for (footprint, surface) in placed.drain(..) {
            map.remove_occupant(footprint, surface).unwrap();
        }
        prop_assert!(map.verify_occupancy());
        for y in 0..H {
            for x in 0..W {
                prop_assert_eq!(map.cell(GridPos::new(x, y)).unwrap().occupancy, [0; 3]);
            }
        }
        // Nothing left to remove.
        prop_assert!(map.remove_occupant(Footprint::new(GridPos::new(0, 0), 1), Surface::Land).is_err());
    }
}
