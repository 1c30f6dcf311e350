//! Timer event queue
//!
//! Events are keyed by `(event, subject, context)`. The subject is the
//! object the event belongs to (an IKE SA, an outbound bundle, an SADB
//! entry) and the context disambiguates between owners of equal subjects.
//! The queue holds no clock of its own: callers pass `now` so the owning
//! lock decides when timers are polled.

use std::time::Duration;

use tokio::time::Instant;

/// Which entries [`TimerQueue::cancel_matching`] removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Only entries whose event, subject and context all match
    Exact,
    /// Every entry for the subject with a matching event, whatever its context
    AllExtra,
}

/// Handle returned by [`TimerQueue::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// A scheduled event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEntry<E> {
    /// Handle
    pub id: TimerId,
    /// When the event fires
    pub deadline: Instant,
    /// Event kind
    pub event: E,
    /// Object the event belongs to
    pub subject: u64,
    /// Owner of the subject
    pub context: u64,
}

/// Deadline ordered event queue
#[derive(Debug)]
pub struct TimerQueue<E> {
    entries: Vec<TimerEntry<E>>,
    next_id: u64,
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        TimerQueue {
            entries: Vec::new(),
            next_id: 1,
        }
    }
}

impl<E: Clone + PartialEq> TimerQueue<E> {
    /// Create empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` for `subject` to fire `delay` after `now`
    pub fn schedule(
        &mut self,
        event: E,
        subject: u64,
        context: u64,
        delay: Duration,
        now: Instant,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        let entry = TimerEntry {
            id,
            deadline: now + delay,
            event,
            subject,
            context,
        };

        // Keep sorted by deadline; equal deadlines fire in scheduling order
        let pos = self
            .entries
            .partition_point(|e| e.deadline <= entry.deadline);
        self.entries.insert(pos, entry);
        id
    }

    /// Cancel a single entry
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        before != self.entries.len()
    }

    /// Cancel entries matching `event` and `subject`
    ///
    /// Returns the number of entries removed.
    pub fn cancel_matching(
        &mut self,
        event: &E,
        subject: u64,
        context: u64,
        scope: CancelScope,
    ) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            let hit = e.event == *event
                && e.subject == subject
                && (scope == CancelScope::AllExtra || e.context == context);
            !hit
        });
        before - self.entries.len()
    }

    /// Cancel every event belonging to `subject` within `context`
    pub fn cancel_subject(&mut self, subject: u64, context: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.subject == subject && e.context == context));
        before - self.entries.len()
    }

    /// Re-key pending events from `old` to `new` within `context`
    pub fn move_subject(&mut self, old: u64, new: u64, context: u64) -> usize {
        let mut moved = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.subject == old && e.context == context)
        {
            entry.subject = new;
            moved += 1;
        }
        moved
    }

    /// Whether an event is pending for `subject`
    pub fn is_scheduled(&self, event: &E, subject: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.event == *event && e.subject == subject)
    }

    /// Remove and return every entry due at `now`, earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEntry<E>> {
        let due = self.entries.partition_point(|e| e.deadline <= now);
        self.entries.drain(..due).collect()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
