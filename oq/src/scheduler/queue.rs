//! Dispatch ordering for queued operations

use std::cmp::Ordering;

use crate::domain::{Operation, Priority};

/// A queued operation competing for a worker slot
///
/// Ordered so that the candidate to admit next is the greatest: run-now
/// boost first, then higher priority, then earlier creation, then earlier
/// submission, then lower id.
#[derive(Debug, Clone)]
pub struct DispatchCandidate {
    pub run_now: bool,
    pub priority: Priority,
    pub created_at: i64,
    pub seq: u64,
    pub id: String,
    pub operation: Operation,
}

impl From<Operation> for DispatchCandidate {
    fn from(operation: Operation) -> Self {
        Self {
            run_now: operation.run_now,
            priority: operation.priority,
            created_at: operation.created_at,
            seq: operation.seq,
            id: operation.id.clone(),
            operation,
        }
    }
}

impl Eq for DispatchCandidate {}

impl PartialEq for DispatchCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for DispatchCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.run_now
            .cmp(&other.run_now)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for DispatchCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use proptest::prelude::*;

    use super::*;
    use crate::domain::{OperationSpec, OperationType, RetryPolicy};

    fn candidate(id: &str, priority: Priority, created_at: i64, run_now: bool) -> DispatchCandidate {
        let mut op = Operation::from_spec(
            OperationSpec::new(OperationType::Copy, vec![]).with_priority(priority),
            RetryPolicy::default(),
            created_at,
        );
        op.id = id.to_string();
        op.run_now = run_now;
        op.into()
    }

    #[test]
    fn test_higher_priority_first() {
        let urgent = candidate("u", Priority::Urgent, 20, false);
        let normal = candidate("n", Priority::Normal, 10, false);
        assert!(urgent > normal);
    }

    #[test]
    fn test_same_priority_fifo() {
        let first = candidate("b", Priority::Normal, 10, false);
        let second = candidate("a", Priority::Normal, 11, false);
        assert!(first > second);
    }

    #[test]
    fn test_submission_order_breaks_same_millisecond_ties() {
        let mut first = candidate("ffff", Priority::Normal, 10, false);
        first.seq = 1;
        let mut second = candidate("0000", Priority::Normal, 10, false);
        second.seq = 2;
        assert!(first > second);
    }

    #[test]
    fn test_id_breaks_ties() {
        let a = candidate("a", Priority::High, 10, false);
        let b = candidate("b", Priority::High, 10, false);
        assert!(a > b);
    }

    #[test]
    fn test_run_now_beats_priority() {
        let boosted = candidate("low", Priority::Low, 99, true);
        let urgent = candidate("urgent", Priority::Urgent, 1, false);
        assert!(boosted > urgent);
    }

    #[test]
    fn test_heap_pops_in_dispatch_order() {
        let mut heap: BinaryHeap<DispatchCandidate> = [
            candidate("n1", Priority::Normal, 1, false),
            candidate("u1", Priority::Urgent, 5, false),
            candidate("n2", Priority::Normal, 2, false),
            candidate("l1", Priority::Low, 0, false),
        ]
        .into_iter()
        .collect();

        let order: Vec<String> = std::iter::from_fn(|| heap.pop()).map(|c| c.id).collect();
        assert_eq!(order, vec!["u1", "n1", "n2", "l1"]);
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Urgent),
        ]
    }

    proptest! {
        #[test]
        fn prop_heap_order_is_sorted(
            entries in prop::collection::vec((priority_strategy(), 0i64..50, any::<bool>()), 1..40)
        ) {
            let mut heap: BinaryHeap<DispatchCandidate> = entries
                .iter()
                .enumerate()
                .map(|(i, (p, created, boost))| candidate(&format!("op{:03}", i), *p, *created, *boost))
                .collect();

            let popped: Vec<DispatchCandidate> = std::iter::from_fn(|| heap.pop()).collect();
            prop_assert_eq!(popped.len(), entries.len());
            for pair in popped.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a >= b);
                if a.run_now == b.run_now && a.priority == b.priority {
                    prop_assert!(a.created_at <= b.created_at);
                }
                if a.run_now == b.run_now {
                    prop_assert!(a.priority >= b.priority);
                }
            }
        }
    }
}
