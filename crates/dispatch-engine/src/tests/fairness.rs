//! Randomized fair-batching properties over seeded candidate sets.

use super::t;
use crate::{build_fair_batch, BatchCandidate};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    id: usize,
    event_type: String,
    created_at: DateTime<Utc>,
}

impl BatchCandidate for Candidate {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Candidates ordered oldest first, ties broken by id.
fn random_candidates(rng: &mut StdRng) -> Vec<Candidate> {
    let types = rng.gen_range(1..=6);
    let count = rng.gen_range(0..=40);
    let mut minute = 0;
    (0..count)
        .map(|id| {
            minute += rng.gen_range(0..3);
            Candidate {
                id,
                event_type: format!("type-{}", rng.gen_range(0..types)),
                created_at: t(minute),
            }
        })
        .collect()
}

fn by_type(candidates: &[Candidate]) -> HashMap<&str, Vec<usize>> {
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for c in candidates {
        groups.entry(c.event_type.as_str()).or_default().push(c.id);
    }
    groups
}

#[test]
fn fair_batch_properties_hold_for_random_inputs() {
    let mut rng = StdRng::seed_from_u64(0x0b7b0c);

    for round in 0..500 {
        let candidates = random_candidates(&mut rng);
        let batch_size = rng.gen_range(1..=20);
        let batch = build_fair_batch(candidates.clone(), batch_size);

        assert_eq!(
            batch.len(),
            batch_size.min(candidates.len()),
            "round {round}: wrong batch size"
        );

        let available = by_type(&candidates);
        let selected = by_type(&batch);

        // within a type, the oldest members are taken in order
        for (event_type, ids) in &selected {
            let pool = &available[event_type];
            assert_eq!(
                ids.as_slice(),
                &pool[..ids.len()],
                "round {round}: {event_type} not a prefix"
            );
        }

        // no type with members left behind is more than one short of another
        let most = selected.values().map(Vec::len).max().unwrap_or(0);
        for (event_type, pool) in &available {
            let taken = selected.get(event_type).map(Vec::len).unwrap_or(0);
            if taken < pool.len() {
                assert!(
                    taken + 1 >= most,
                    "round {round}: {event_type} took {taken}, another took {most}"
                );
            }
        }
    }
}

#[test]
fn small_candidate_sets_are_returned_unchanged() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..100 {
        let candidates = random_candidates(&mut rng);
        let batch = build_fair_batch(candidates.clone(), candidates.len().max(1));
        assert_eq!(batch, candidates);
    }
}

#[test]
fn groups_rotate_by_oldest_member() {
    let candidate = |id, event_type: &str, minute| Candidate {
        id,
        event_type: event_type.to_string(),
        created_at: t(minute),
    };
    let candidates = vec![
        candidate(0, "b", 0),
        candidate(1, "a", 0),
        candidate(2, "b", 1),
        candidate(3, "c", 2),
        candidate(4, "a", 3),
        candidate(5, "b", 4),
    ];

    let ids: Vec<usize> = build_fair_batch(candidates, 5)
        .into_iter()
        .map(|c| c.id)
        .collect();
    // "a" and "b" tie on age and sort by name
    assert_eq!(ids, vec![1, 0, 3, 4, 2]);
}
