use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Handle for a scheduled timer, used for cancellation and dispatch matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    id: TimerId,
    period: Option<Duration>,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending timers with lazy cancellation.
///
/// Cancelled ids are dropped when they surface at the top of the heap, so
/// cancellation is O(1) and a cancelled timer can never fire.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
}

impl TimerQueue {
    /// Schedule a timer. Periodic timers reschedule themselves at `delay`
    /// intervals from the moment they fire.
    pub fn schedule(&mut self, delay: Duration, periodic: bool) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(Entry {
            deadline: Instant::now() + delay,
            id,
            period: periodic.then_some(delay),
        }));
        id
    }

    /// Cancel a timer. Idempotent; unknown ids are ignored.
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Earliest pending deadline, skipping cancelled heads.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.cancelled.remove(&head.id) {
                self.heap.pop();
                continue;
            }
            return Some(head.deadline);
        }
        None
    }

    /// Pop every timer due at `now`, rescheduling periodic ones.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            if let Some(period) = entry.period {
                self.heap.push(Reverse(Entry {
                    deadline: now + period,
                    id: entry.id,
                    period: Some(period),
                }));
            }
            due.push(entry.id);
        }
        due
    }

    /// Whether any live timer remains scheduled.
    pub fn has_pending(&mut self) -> bool {
        self.next_deadline().is_some()
    }
}
