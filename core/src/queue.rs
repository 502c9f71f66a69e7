use std::collections::VecDeque;

use paneflow_protocol::DeliveryResult;
use paneflow_protocol::FailureReason;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::trace::TraceContext;

/// Per-message overrides carried alongside the payload text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOverrides {
    /// Overrides the profile's `verify_submit_accepted` for this message.
    pub verify_submit_accepted: Option<bool>,
    /// Lightweight startup mode: an output-only transition is accepted as
    /// the verification signal, without consulting the prompt probe.
    pub accept_output_transition_only: bool,
    /// Safe idempotent startup message; verification defaults off unless
    /// explicitly overridden back on.
    pub startup_injection: bool,
}

/// One pending message. Created on enqueue, removed on dequeue; resolved
/// exactly once through its completion channel.
#[derive(Debug)]
pub(crate) struct QueueItem {
    pub text: String,
    pub enqueued_at: Instant,
    pub priority: bool,
    /// User-originated send: skips idle-style gating and re-polls the
    /// global lock at a tighter interval.
    pub immediate: bool,
    pub overrides: SendOverrides,
    pub trace: TraceContext,
    completion: oneshot::Sender<DeliveryResult>,
}

impl QueueItem {
    pub(crate) fn new(
        text: String,
        priority: bool,
        immediate: bool,
        overrides: SendOverrides,
        trace: TraceContext,
        completion: oneshot::Sender<DeliveryResult>,
    ) -> Self {
        Self {
            text,
            enqueued_at: Instant::now(),
            priority,
            immediate,
            overrides,
            trace,
            completion,
        }
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.text.len()
    }

    /// Resolve the sender's completion channel. A receiver the caller has
    /// already dropped is not an error.
    pub(crate) fn resolve(self, result: DeliveryResult) -> TraceContext {
        let Self {
            trace, completion, ..
        } = self;
        let _ = completion.send(result);
        trace
    }
}

/// Ordered backlog for one session: a priority lane drained strictly before
/// the normal lane, FIFO within each lane, bounded by item count and
/// cumulative byte size. Under pressure the oldest items are evicted to
/// admit the new one (newest-writer-wins).
#[derive(Debug, Default)]
pub(crate) struct SessionQueue {
    priority: VecDeque<QueueItem>,
    normal: VecDeque<QueueItem>,
    bytes: usize,
}

impl SessionQueue {
    /// Place the item in its lane, then enforce capacity. Returns the items
    /// evicted to make room; the caller must resolve each of them with a
    /// `queue_capacity` failure so no drop is ever silent.
    pub(crate) fn enqueue(
        &mut self,
        item: QueueItem,
        max_items: usize,
        max_bytes: usize,
    ) -> Vec<QueueItem> {
        self.bytes += item.byte_len();
        if item.priority {
            self.priority.push_back(item);
        } else {
            self.normal.push_back(item);
        }

        let mut evicted = Vec::new();
        while self.len() > max_items || self.bytes > max_bytes {
            // Oldest normal-lane item goes first; priority items are only
            // sacrificed once the normal lane is empty.
            let Some(victim) = self.normal.pop_front().or_else(|| self.priority.pop_front())
            else {
                break;
            };
            self.bytes -= victim.byte_len();
            evicted.push(victim);
        }
        evicted
    }

    pub(crate) fn dequeue_next(&mut self) -> Option<QueueItem> {
        let item = self.priority.pop_front().or_else(|| self.normal.pop_front())?;
        self.bytes -= item.byte_len();
        Some(item)
    }

    /// Whether the next item to be dequeued carries the `immediate` flag.
    pub(crate) fn head_immediate(&self) -> Option<bool> {
        self.priority
            .front()
            .or_else(|| self.normal.front())
            .map(|item| item.immediate)
    }

    /// Remove every remaining item and resolve it with the given failure
    /// reason. Teardown/cancellation path.
    pub(crate) fn clear(&mut self, reason: FailureReason) -> Vec<TraceContext> {
        let mut traces = Vec::with_capacity(self.len());
        for item in self.priority.drain(..).chain(self.normal.drain(..)) {
            traces.push(item.resolve(DeliveryResult::failed(reason)));
        }
        self.bytes = 0;
        traces
    }

    pub(crate) fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item(text: &str, priority: bool) -> (QueueItem, oneshot::Receiver<DeliveryResult>) {
        let (tx, rx) = oneshot::channel();
        let item = QueueItem::new(
            text.to_string(),
            priority,
            false,
            SendOverrides::default(),
            TraceContext::root(),
            tx,
        );
        (item, rx)
    }

    #[tokio::test]
    async fn fifo_within_lane() {
        let mut queue = SessionQueue::default();
        for text in ["A", "B", "C"] {
            let (it, _rx) = item(text, false);
            assert!(queue.enqueue(it, 10, 1_024).is_empty());
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue_next())
            .map(|it| it.text)
            .collect();
        assert_eq!(order, ["A", "B", "C"]);
    }

    #[tokio::test]
    async fn priority_lane_drains_first() {
        let mut queue = SessionQueue::default();
        let (a, _ra) = item("A", false);
        let (b, _rb) = item("B", true);
        queue.enqueue(a, 10, 1_024);
        queue.enqueue(b, 10, 1_024);
        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue_next())
            .map(|it| it.text)
            .collect();
        assert_eq!(order, ["B", "A"]);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let mut queue = SessionQueue::default();
        let (first, mut first_rx) = item("first", false);
        let (second, _r2) = item("second", false);
        let (third, _r3) = item("third", false);
        queue.enqueue(first, 2, 1_024);
        queue.enqueue(second, 2, 1_024);
        let evicted = queue.enqueue(third, 2, 1_024);
        assert_eq!(evicted.len(), 1);
        for victim in evicted {
            victim.resolve(DeliveryResult::failed(FailureReason::QueueCapacity));
        }
        let result = first_rx.try_recv().expect("evicted item resolved");
        assert!(!result.success);
        assert_eq!(result.reason, Some(FailureReason::QueueCapacity));

        let remaining: Vec<String> = std::iter::from_fn(|| queue.dequeue_next())
            .map(|it| it.text)
            .collect();
        assert_eq!(remaining, ["second", "third"]);
        assert_eq!(queue.byte_size(), 0);
    }

    #[tokio::test]
    async fn byte_bound_evicts_normal_before_priority() {
        let mut queue = SessionQueue::default();
        let (normal, mut normal_rx) = item("aaaaaaaa", false);
        let (urgent, _ru) = item("bbbbbbbb", true);
        queue.enqueue(normal, 10, 1_024);
        queue.enqueue(urgent, 10, 1_024);
        let (fat, _rf) = item("cccccccc", false);
        let evicted = queue.enqueue(fat, 10, 20);
        assert_eq!(evicted.len(), 1, "one eviction restores the byte bound");
        for victim in evicted {
            victim.resolve(DeliveryResult::failed(FailureReason::QueueCapacity));
        }
        assert!(normal_rx.try_recv().is_ok(), "normal lane paid the price");
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn clear_resolves_everything() {
        let mut queue = SessionQueue::default();
        let (a, mut ra) = item("A", false);
        let (b, mut rb) = item("B", true);
        queue.enqueue(a, 10, 1_024);
        queue.enqueue(b, 10, 1_024);
        let traces = queue.clear(FailureReason::PaneTeardown);
        assert_eq!(traces.len(), 2);
        assert!(queue.is_empty());
        for rx in [&mut ra, &mut rb] {
            let result = rx.try_recv().expect("resolved on clear");
            assert_eq!(result.reason, Some(FailureReason::PaneTeardown));
        }
    }
}
