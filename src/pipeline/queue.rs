use std::collections::{HashSet, VecDeque};

/// FIFO of image ids awaiting a caption. An id appears at most once.
#[derive(Debug, Clone, Default)]
pub struct ProcessingQueue {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl ProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted list, dropping repeated ids.
    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        let mut queue = Self::new();
        for id in ids {
            queue.enqueue(id);
        }
        queue
    }

    /// Append an id. Returns false (and changes nothing) if it is already queued.
    pub fn enqueue(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.members.contains(&id) {
            return false;
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    /// Put an id back at the head, e.g. after an aborted attempt.
    pub fn requeue_front(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.members.contains(&id) {
            return false;
        }
        self.members.insert(id.clone());
        self.order.push_front(id);
        true
    }

    pub fn dequeue(&mut self) -> Option<String> {
        let id = self.order.pop_front()?;
        self.members.remove(&id);
        Some(id)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|queued| queued != id);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Queued ids in processing order.
    pub fn ids(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_is_idempotent() {
        let mut queue = ProcessingQueue::new();
        assert!(queue.enqueue("a"));
        assert!(queue.enqueue("b"));
        assert!(!queue.enqueue("a"));
        assert!(!queue.enqueue("b"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_len_bounded_by_distinct_ids() {
        let ids = ["a", "b", "a", "c", "b", "a", "d", "c"];
        let mut queue = ProcessingQueue::new();
        let mut seen = HashSet::new();
        for id in ids {
            queue.enqueue(id);
            seen.insert(id);
            assert!(queue.len() <= seen.len());
        }
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = ProcessingQueue::from_ids(["c", "a", "b", "a"].map(String::from));
        assert_eq!(queue.ids(), vec!["c", "a", "b"]);
        assert_eq!(queue.dequeue().as_deref(), Some("c"));
        assert_eq!(queue.dequeue().as_deref(), Some("a"));
        assert!(!queue.contains("a"));

        // A dequeued id may be queued again.
        assert!(queue.enqueue("a"));
        assert_eq!(queue.dequeue().as_deref(), Some("b"));
        assert_eq!(queue.dequeue().as_deref(), Some("a"));
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_remove() {
        let mut queue = ProcessingQueue::from_ids(["a", "b", "c"].map(String::from));
        assert!(queue.remove("b"));
        assert!(!queue.remove("b"));
        assert!(!queue.contains("b"));
        assert_eq!(queue.ids(), vec!["a", "c"]);
    }

    #[test]
    fn test_requeue_front() {
        let mut queue = ProcessingQueue::from_ids(["b", "c"].map(String::from));
        assert!(queue.requeue_front("a"));
        assert!(!queue.requeue_front("c"));
        assert_eq!(queue.ids(), vec!["a", "b", "c"]);
    }
}
