//! The commit-callback chain.
//!
//! One upstream poll batch fans out into at most one row set per mapped
//! table. Each of those row sets carries a [`CommitCallback`] onto its
//! loader; the batch's upstream position may be committed only after every
//! sibling callback has fired. Groups complete out of order (loaders are
//! independent per table), so the chain only ever advances the contiguous
//! completed prefix — exactly-once apply relative to upstream offsets falls
//! out of committing nothing beyond that prefix.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Position of one consumed topic/partition pair: `offset` is the next
/// offset to read, i.e. last consumed + 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// The upstream position made durable once a poll batch is fully applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPosition(pub Vec<TopicOffset>);

#[derive(Debug)]
struct AckGroup {
    position: BatchPosition,
    remaining: AtomicUsize,
}

/// A token representing "one table's share of a poll batch reached the
/// target". Firing is consuming; drop without firing leaves the group
/// incomplete and the upstream offset unadvanced.
#[derive(Debug)]
pub struct CommitCallback {
    group: Arc<AckGroup>,
}

impl CommitCallback {
    pub fn fire(self) {
        self.group.remaining.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Arrival-ordered chain of ack groups for one pipeline.
#[derive(Debug, Default)]
pub struct AckChain {
    groups: Mutex<VecDeque<Arc<AckGroup>>>,
}

impl AckChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a poll batch that fans out to `fanout` tables and hand back
    /// the sibling callbacks. A batch where every record was skipped passes
    /// `fanout == 0` and completes immediately, so its offset still
    /// advances.
    pub fn begin(&self, position: BatchPosition, fanout: usize) -> Vec<CommitCallback> {
        let group = Arc::new(AckGroup {
            position,
            remaining: AtomicUsize::new(fanout),
        });
        let callbacks = (0..fanout)
            .map(|_| CommitCallback {
                group: Arc::clone(&group),
            })
            .collect();
        self.groups.lock().unwrap().push_back(group);
        callbacks
    }

    /// Pop every leading group whose callbacks have all fired and return the
    /// newest popped position — the position safe to commit upstream.
    /// Returns `None` when the head group is still in flight.
    pub fn completed(&self) -> Option<BatchPosition> {
        let mut groups = self.groups.lock().unwrap();
        let mut latest = None;
        while let Some(head) = groups.front() {
            if head.remaining.load(Ordering::Acquire) != 0 {
                break;
            }
            latest = Some(groups.pop_front().unwrap().position.clone());
        }
        latest
    }

    /// Number of poll batches not yet fully applied.
    pub fn in_flight(&self) -> usize {
        self.groups.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(offset: i64) -> BatchPosition {
        BatchPosition(vec![TopicOffset {
            topic: "t".into(),
            partition: 0,
            offset,
        }])
    }

    #[test]
    fn single_callback_advances() {
        let chain = AckChain::new();
        let mut cbs = chain.begin(pos(10), 1);
        assert_eq!(chain.completed(), None);
        cbs.pop().unwrap().fire();
        assert_eq!(chain.completed(), Some(pos(10)));
        assert_eq!(chain.in_flight(), 0);
    }

    #[test]
    fn siblings_gate_the_advance() {
        // One batch touching two tables: the offset moves only after the
        // second (slower) callback fires.
        let chain = AckChain::new();
        let mut cbs = chain.begin(pos(5), 2);
        cbs.remove(0).fire();
        assert_eq!(chain.completed(), None);
        cbs.remove(0).fire();
        assert_eq!(chain.completed(), Some(pos(5)));
    }

    #[test]
    fn out_of_order_completion_waits_for_head() {
        let chain = AckChain::new();
        let mut first = chain.begin(pos(1), 1);
        let mut second = chain.begin(pos(2), 1);
        second.pop().unwrap().fire();
        // Batch 2 is done but batch 1 is not: nothing commits.
        assert_eq!(chain.completed(), None);
        first.pop().unwrap().fire();
        // Both now complete; the newest contiguous position wins.
        assert_eq!(chain.completed(), Some(pos(2)));
    }

    #[test]
    fn skip_only_batch_completes_immediately() {
        let chain = AckChain::new();
        let cbs = chain.begin(pos(7), 0);
        assert!(cbs.is_empty());
        assert_eq!(chain.completed(), Some(pos(7)));
    }

    #[test]
    fn unfired_callback_blocks_forever() {
        let chain = AckChain::new();
        let cbs = chain.begin(pos(3), 1);
        drop(cbs); // dropped, not fired
        assert_eq!(chain.completed(), None);
        assert_eq!(chain.in_flight(), 1);
    }
}
