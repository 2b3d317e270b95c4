use crate::config::DEFAULT_EVENT_CAPACITY;
use adm_core::{ApprovalRequest, StreamEvent};
use std::collections::VecDeque;

/// Newest-first view of the event stream.
///
/// Live inserts go to the front and trim the tail down to `capacity`.
/// Backfill goes to the back, is deduplicated by `event_id`, and never trims,
/// so a burst of history cannot push out live events that already arrived.
#[derive(Debug, Clone)]
pub struct EventStore {
    events: VecDeque<StreamEvent>,
    capacity: usize,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live events are trusted to be unique and are not checked against history.
    pub fn push_live(&mut self, event: StreamEvent) {
        self.events.push_front(event);
        self.events.truncate(self.capacity);
    }

    /// Returns `false` when an event with the same id is already stored.
    pub fn push_history(&mut self, event: StreamEvent) -> bool {
        if self.contains(&event.event_id) {
            return false;
        }
        self.events.push_back(event);
        true
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.events.iter().any(|event| event.event_id == event_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter()
    }

    pub fn snapshot(&self) -> Vec<StreamEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Pending approvals, newest first, at most one per `approval_id`.
#[derive(Debug, Clone, Default)]
pub struct ApprovalQueue {
    pending: VecDeque<ApprovalRequest>,
}

impl ApprovalQueue {
    pub fn insert(&mut self, approval: ApprovalRequest) -> bool {
        if self.contains(&approval.approval_id) {
            return false;
        }
        self.pending.push_front(approval);
        true
    }

    pub fn remove(&mut self, approval_id: &str) -> Option<ApprovalRequest> {
        let index = self
            .pending
            .iter()
            .position(|approval| approval.approval_id == approval_id)?;
        self.pending.remove(index)
    }

    pub fn contains(&self, approval_id: &str) -> bool {
        self.pending
            .iter()
            .any(|approval| approval.approval_id == approval_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ApprovalRequest> {
        self.pending.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// The two stores a session owns; the dispatcher mutates them together.
#[derive(Debug, Clone, Default)]
pub struct Stores {
    pub events: EventStore,
    pub approvals: ApprovalQueue,
}

impl Stores {
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            events: EventStore::with_capacity(capacity),
            approvals: ApprovalQueue::default(),
        }
    }
}
