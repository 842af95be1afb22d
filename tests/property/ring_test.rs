// tests/property/ring_test.rs

//! Properties of the neighbour-ring derivation.

use lustra_agent::config::Topology;
use proptest::prelude::*;
use std::collections::HashSet;

/// Builds a topology document from (hostname, standalone) pairs in the
/// given order.
fn topology_of(hosts: &[(String, bool)]) -> Topology {
    let mut doc = String::new();
    for (hostname, standalone) in hosts {
        doc.push_str(&format!(
            "[[hosts]]\nhostname = \"{hostname}\"\nstandalone = {standalone}\n\n"
        ));
    }
    Topology::from_toml(&doc).unwrap()
}

fn host_set_strategy() -> impl Strategy<Value = Vec<(String, bool)>> {
    prop::collection::hash_set("[a-z][a-z0-9]{0,7}", 1..12).prop_flat_map(|names| {
        let names: Vec<String> = names.into_iter().collect();
        let len = names.len();
        (
            Just(names),
            prop::collection::vec(any::<bool>(), len),
        )
            .prop_map(|(names, flags)| names.into_iter().zip(flags).collect())
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_ring_size_content_and_determinism(
        hosts in host_set_strategy(),
        local_index in any::<prop::sample::Index>(),
        fanout in 0usize..5,
        rotation in any::<prop::sample::Index>(),
    ) {
        let local = hosts[local_index.index(hosts.len())].0.clone();
        let topology = topology_of(&hosts);
        let picked = topology.neighbour_hosts(&local, fanout).unwrap();

        // Candidates: non-standalone hosts plus the local host itself.
        let candidates: HashSet<&str> = hosts
            .iter()
            .filter(|(name, standalone)| !standalone || *name == local)
            .map(|(name, _)| name.as_str())
            .collect();

        // Size: fanout successors, capped by the number of peers.
        prop_assert_eq!(picked.len(), fanout.min(candidates.len() - 1));

        // Content: peers only, each of them a candidate, no duplicates.
        let mut seen = HashSet::new();
        for host in &picked {
            prop_assert_ne!(&host.hostname, &local);
            prop_assert!(candidates.contains(host.hostname.as_str()));
            prop_assert!(seen.insert(host.hostname.clone()));
        }

        // Output is sorted ascending.
        let mut sorted = picked.clone();
        sorted.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        prop_assert_eq!(&picked, &sorted);

        // Determinism: declaration order of the host list is irrelevant.
        let mut rotated = hosts.clone();
        rotated.rotate_left(rotation.index(hosts.len()));
        let picked_rotated = topology_of(&rotated).neighbour_hosts(&local, fanout).unwrap();
        prop_assert_eq!(picked, picked_rotated);
    }

    #[test]
    fn test_every_candidate_is_watched_when_fanout_allows(
        names in prop::collection::hash_set("[a-z][a-z0-9]{0,7}", 2..8),
    ) {
        // With fanout >= 1 and every host non-standalone, walking the ring
        // from each host covers every other host at least once.
        let hosts: Vec<(String, bool)> = names.iter().map(|n| (n.clone(), false)).collect();
        let topology = topology_of(&hosts);

        let mut watched: HashSet<String> = HashSet::new();
        for (name, _) in &hosts {
            for neighbour in topology.neighbour_hosts(name, 1).unwrap() {
                watched.insert(neighbour.hostname);
            }
        }
        // Each host names exactly one successor on the ring, so the union
        // of successors is the whole ring.
        prop_assert_eq!(watched.len(), hosts.len());
    }
}
