//! Priority-ordered request queue with a per-resource dedup index.

use std::collections::{BTreeMap, HashMap};

use tokio::time::Instant;

use super::request::{QueuedRequest, RequestKey};

/// Ordering key of a queue slot: priority first, then submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SlotKey {
    priority: u32,
    enqueued_at: Instant,
    sequence: u64,
}

/// Result of [`RequestQueue::insert`].
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted,
    /// The key already had a slot; the new request took it over and the
    /// previous occupant is handed back.
    Replaced(QueuedRequest),
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    ordered: BTreeMap<SlotKey, QueuedRequest>,
    index: HashMap<RequestKey, SlotKey>,
    next_sequence: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `request`, replacing any queued entry for the same key.
    ///
    /// A replacement keeps the slot of the entry it replaces, so resubmitting
    /// never moves a resource forward or backward in line.
    pub fn insert(&mut self, request: QueuedRequest) -> InsertOutcome {
        match self.index.get(&request.key).copied() {
            Some(slot) => match self.ordered.insert(slot, request) {
                Some(previous) => InsertOutcome::Replaced(previous),
                None => InsertOutcome::Inserted,
            },
            None => {
                self.push(request);
                InsertOutcome::Inserted
            }
        }
    }

    /// Insert only when no entry exists for the key; otherwise hand the request back.
    pub fn insert_if_vacant(&mut self, request: QueuedRequest) -> Result<(), QueuedRequest> {
        if self.index.contains_key(&request.key) {
            return Err(request);
        }
        self.push(request);
        Ok(())
    }

    pub fn pop_next(&mut self) -> Option<QueuedRequest> {
        let (_, request) = self.ordered.pop_first()?;
        self.index.remove(&request.key);
        Some(request)
    }

    /// Zero-based distance from the head.
    pub fn position_of(&self, key: &RequestKey) -> Option<usize> {
        let slot = self.index.get(key)?;
        Some(self.ordered.range(..*slot).count())
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn remove_all(&mut self) -> Vec<QueuedRequest> {
        self.index.clear();
        std::mem::take(&mut self.ordered).into_values().collect()
    }

    /// Remove every entry whose deadline has passed at `now`.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<QueuedRequest> {
        let expired: Vec<SlotKey> = self
            .ordered
            .iter()
            .filter(|(_, request)| request.is_expired(now))
            .map(|(slot, _)| *slot)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for slot in expired {
            if let Some(request) = self.ordered.remove(&slot) {
                self.index.remove(&request.key);
                removed.push(request);
            }
        }
        removed
    }

    /// Entries in pop order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.ordered.values()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    fn push(&mut self, request: QueuedRequest) {
        let slot = SlotKey {
            priority: request.priority,
            enqueued_at: request.enqueued_at,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.index.insert(request.key.clone(), slot);
        self.ordered.insert(slot, request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use crate::scheduler::request::RequestKind;

    fn request(symbol: &str, kind: RequestKind, priority: u32) -> QueuedRequest {
        request_with_url(symbol, kind, priority, &format!("https://example.com/{symbol}"))
    }

    fn request_with_url(symbol: &str, kind: RequestKind, priority: u32, url: &str) -> QueuedRequest {
        let (tx, _rx) = oneshot::channel();
        QueuedRequest::new(RequestKey::new(symbol, kind), priority, url.to_string(), None, tx)
    }

    fn drain_symbols(queue: &mut RequestQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop_next())
            .map(|request| request.key.resource_key)
            .collect()
    }

    #[test]
    fn pops_by_priority_then_fifo() {
        let mut queue = RequestQueue::new();
        queue.insert(request("NEWS1", RequestKind::News, 3));
        queue.insert(request("Q1", RequestKind::Quote, 2));
        queue.insert(request("T1", RequestKind::Technical, 1));
        queue.insert(request("Q2", RequestKind::Quote, 2));
        queue.insert(request("T2", RequestKind::Technical, 1));

        assert_eq!(drain_symbols(&mut queue), vec!["T1", "T2", "Q1", "Q2", "NEWS1"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_submission_takes_over_existing_slot() {
        let mut queue = RequestQueue::new();
        queue.insert(request("AAPL", RequestKind::Quote, 2));
        queue.insert(request("MSFT", RequestKind::Quote, 2));

        let replacement = request_with_url("AAPL", RequestKind::Quote, 2, "https://example.com/v2");
        let replacement_id = replacement.id;
        let outcome = queue.insert(replacement);

        assert!(matches!(outcome, InsertOutcome::Replaced(ref old) if old.id != replacement_id));
        assert_eq!(queue.len(), 2);

        let aapl = RequestKey::new("AAPL", RequestKind::Quote);
        assert_eq!(queue.position_of(&aapl), Some(0));

        let head = queue.pop_next().expect("head");
        assert_eq!(head.id, replacement_id);
        assert_eq!(head.url, "https://example.com/v2");
    }

    #[test]
    fn same_resource_with_different_kind_gets_separate_slots() {
        let mut queue = RequestQueue::new();
        queue.insert(request("AAPL", RequestKind::Quote, 2));
        let outcome = queue.insert(request("AAPL", RequestKind::News, 3));

        assert!(matches!(outcome, InsertOutcome::Inserted));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn reports_zero_based_positions() {
        let mut queue = RequestQueue::new();
        queue.insert(request("A", RequestKind::Quote, 2));
        queue.insert(request("B", RequestKind::Quote, 2));
        queue.insert(request("C", RequestKind::Technical, 1));

        assert_eq!(queue.position_of(&RequestKey::new("C", RequestKind::Technical)), Some(0));
        assert_eq!(queue.position_of(&RequestKey::new("A", RequestKind::Quote)), Some(1));
        assert_eq!(queue.position_of(&RequestKey::new("B", RequestKind::Quote)), Some(2));
        assert_eq!(queue.position_of(&RequestKey::new("Z", RequestKind::Quote)), None);
    }

    #[test]
    fn insert_if_vacant_refuses_occupied_slot() {
        let mut queue = RequestQueue::new();
        queue.insert(request("AAPL", RequestKind::Quote, 2));

        let retry = request("AAPL", RequestKind::Quote, 2);
        let retry_id = retry.id;
        let rejected = queue.insert_if_vacant(retry).expect_err("slot is occupied");

        assert_eq!(rejected.id, retry_id);
        assert_eq!(queue.len(), 1);
        assert!(queue.insert_if_vacant(request("MSFT", RequestKind::Quote, 2)).is_ok());
    }

    #[test]
    fn remove_all_empties_queue_and_index() {
        let mut queue = RequestQueue::new();
        queue.insert(request("A", RequestKind::Quote, 2));
        queue.insert(request("B", RequestKind::News, 3));

        let removed = queue.remove_all();
        assert_eq!(removed.len(), 2);
        assert!(queue.is_empty());
        assert!(!queue.contains(&RequestKey::new("A", RequestKind::Quote)));
        assert_eq!(queue.position_of(&RequestKey::new("B", RequestKind::News)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn removes_only_expired_entries() {
        let mut queue = RequestQueue::new();
        let (tx, _rx) = oneshot::channel();
        queue.insert(QueuedRequest::new(
            RequestKey::new("SOON", RequestKind::Quote),
            2,
            "https://example.com/soon".to_string(),
            Some(Duration::from_secs(1)),
            tx,
        ));
        queue.insert(request("LATER", RequestKind::Quote, 2));

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = queue.remove_expired(Instant::now());

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key.resource_key, "SOON");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.position_of(&RequestKey::new("LATER", RequestKind::Quote)), Some(0));
    }
}
