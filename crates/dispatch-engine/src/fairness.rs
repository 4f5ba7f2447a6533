//! Fair batch selection across event types.

use chrono::{DateTime, Utc};
use dispatch_database::OutboxEvent;
use std::collections::{HashMap, VecDeque};

/// Anything that can be bucketed by type and ordered by age.
pub trait BatchCandidate {
    fn event_type(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
}

impl BatchCandidate for OutboxEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

struct Group<T> {
    event_type: String,
    oldest: DateTime<Utc>,
    members: VecDeque<T>,
}

/// Select `min(batch_size, candidates.len())` candidates round-robin by type.
///
/// `candidates` must already be ordered oldest first. Groups are visited
/// in order of their oldest member (ties by type name), one member per
/// group per round, and each group keeps its input order. When every
/// candidate fits, the input is returned unchanged.
pub fn build_fair_batch<T: BatchCandidate>(candidates: Vec<T>, batch_size: usize) -> Vec<T> {
    if candidates.len() <= batch_size {
        return candidates;
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Group<T>> = Vec::new();
    for candidate in candidates {
        match index.get(candidate.event_type()).copied() {
            Some(i) => groups[i].members.push_back(candidate),
            None => {
                index.insert(candidate.event_type().to_string(), groups.len());
                groups.push(Group {
                    event_type: candidate.event_type().to_string(),
                    oldest: candidate.created_at(),
                    members: VecDeque::from([candidate]),
                });
            }
        }
    }

    groups.sort_by(|a, b| {
        a.oldest
            .cmp(&b.oldest)
            .then_with(|| a.event_type.cmp(&b.event_type))
    });

    let mut batch = Vec::with_capacity(batch_size);
    while batch.len() < batch_size {
        let mut took_any = false;
        for group in groups.iter_mut() {
            if let Some(candidate) = group.members.pop_front() {
                batch.push(candidate);
                took_any = true;
                if batch.len() == batch_size {
                    break;
                }
            }
        }
        if !took_any {
            break;
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: &'static str,
        kind: &'static str,
        at: i64,
    }

    impl BatchCandidate for Item {
        fn event_type(&self) -> &str {
            self.kind
        }

        fn created_at(&self) -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(self.at)
        }
    }

    fn item(id: &'static str, kind: &'static str, at: i64) -> Item {
        Item { id, kind, at }
    }

    fn ids(items: &[Item]) -> Vec<&'static str> {
        items.iter().map(|i| i.id).collect()
    }

    #[test]
    fn returns_input_unchanged_when_it_fits() {
        let input = vec![item("x1", "X", 0), item("x2", "X", 1), item("y1", "Y", 2)];
        assert_eq!(build_fair_batch(input.clone(), 3), input);
        assert_eq!(build_fair_batch(input.clone(), 10), input);
    }

    #[test]
    fn alternates_types_before_exhausting_one() {
        let input = vec![
            item("x1", "X", 0),
            item("x2", "X", 1),
            item("x3", "X", 2),
            item("y1", "Y", 3),
        ];
        assert_eq!(ids(&build_fair_batch(input, 2)), vec!["x1", "y1"]);
    }

    #[test]
    fn group_order_follows_oldest_member_then_name() {
        let input = vec![
            item("b1", "B", 0),
            item("a1", "A", 0),
            item("c1", "C", 1),
            item("b2", "B", 2),
            item("a2", "A", 3),
        ];
        assert_eq!(ids(&build_fair_batch(input, 4)), vec!["a1", "b1", "c1", "a2"]);
    }

    #[test]
    fn exhausted_groups_are_skipped() {
        let input = vec![
            item("x1", "X", 0),
            item("y1", "Y", 1),
            item("x2", "X", 2),
            item("x3", "X", 3),
            item("x4", "X", 4),
        ];
        assert_eq!(
            ids(&build_fair_batch(input, 4)),
            vec!["x1", "y1", "x2", "x3"]
        );
    }

    #[test]
    fn zero_batch_size_selects_nothing() {
        let input = vec![item("x1", "X", 0)];
        assert!(build_fair_batch(input, 0).is_empty());
    }
}
