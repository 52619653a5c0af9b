//! Queue types for the scheduler

use std::collections::VecDeque;
use std::task::{Context, Poll};
use std::{future::Future, pin::Pin};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::domain::{GovernorError, Metadata, Priority, RequestId, Work};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, GovernorError>>;

/// A request waiting in (or moving between) the scheduler's queues
pub(crate) struct QueuedRequest<T> {
    pub id: RequestId,
    pub request_type: String,
    /// Queue the request currently lives in (demoted on retry)
    pub priority: Priority,
    /// Priority declared at enqueue time
    pub original_priority: Priority,
    pub work: Work<T>,
    pub reply: Reply<T>,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    pub metadata: Option<Metadata>,
}

/// Four FIFO queues, drained in strict priority order
pub(crate) struct PriorityQueues<T> {
    queues: [VecDeque<QueuedRequest<T>>; 4],
    capacity: usize,
}

impl<T> PriorityQueues<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: std::array::from_fn(|_| VecDeque::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self, priority: Priority) -> bool {
        self.queues[priority.index()].len() >= self.capacity
    }

    /// Append without a capacity check (retries re-enter here)
    pub fn push_back(&mut self, request: QueuedRequest<T>) {
        self.queues[request.priority.index()].push_back(request);
    }

    /// Head of the most urgent non-empty queue
    pub fn pop_next(&mut self) -> Option<QueuedRequest<T>> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn lengths(&self) -> QueueLengths {
        QueueLengths {
            critical: self.queues[Priority::Critical.index()].len(),
            high: self.queues[Priority::High.index()].len(),
            normal: self.queues[Priority::Normal.index()].len(),
            low: self.queues[Priority::Low.index()].len(),
        }
    }

    pub fn drain_all(&mut self) -> Vec<QueuedRequest<T>> {
        self.queues.iter_mut().flat_map(|q| q.drain(..)).collect()
    }
}

/// Queue depth per priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLengths {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueLengths {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }

    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

/// Caller's handle to an enqueued request
///
/// Resolves exactly once with the work's value or a terminal failure.
/// Requests removed by `clear_queues` or `stop` never resolve while the
/// scheduler is alive.
pub struct RequestHandle<T> {
    id: RequestId,
    rx: oneshot::Receiver<Result<T, GovernorError>>,
}

impl<T> RequestHandle<T> {
    pub(crate) fn new(id: RequestId, rx: oneshot::Receiver<Result<T, GovernorError>>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl<T> Future for RequestHandle<T> {
    type Output = Result<T, GovernorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(GovernorError::Dropped(id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::work;

    fn request(priority: Priority, tag: u32) -> (QueuedRequest<u32>, RequestHandle<u32>) {
        let (tx, rx) = oneshot::channel();
        let id = RequestId::new();
        let req = QueuedRequest {
            id,
            request_type: "order".to_string(),
            priority,
            original_priority: priority,
            work: work(move || async move { Ok(tag) }),
            reply: tx,
            enqueued_at: Instant::now(),
            retry_count: 0,
            metadata: None,
        };
        (req, RequestHandle::new(id, rx))
    }

    #[test]
    fn test_strict_priority_then_fifo() {
        let mut queues = PriorityQueues::new(10);
        let mut ids = Vec::new();
        for (priority, tag) in [
            (Priority::Low, 1),
            (Priority::Normal, 2),
            (Priority::Critical, 3),
            (Priority::Normal, 4),
            (Priority::High, 5),
        ] {
            let (req, _) = request(priority, tag);
            ids.push(req.id);
            queues.push_back(req);
        }

        let order: Vec<_> = std::iter::from_fn(|| queues.pop_next()).map(|r| r.id).collect();
        assert_eq!(order, vec![ids[2], ids[4], ids[1], ids[3], ids[0]]);
        assert_eq!(queues.len(), 0);
    }

    #[test]
    fn test_capacity_per_priority() {
        let mut queues = PriorityQueues::new(2);
        for _ in 0..2 {
            queues.push_back(request(Priority::Low, 0).0);
        }
        assert!(queues.is_full(Priority::Low));
        assert!(!queues.is_full(Priority::High));

        let lengths = queues.lengths();
        assert_eq!(lengths.low, 2);
        assert_eq!(lengths.get(Priority::Low), 2);
        assert_eq!(lengths.total(), queues.len());
    }

    #[test]
    fn test_drain_all_empties_queues() {
        let mut queues = PriorityQueues::new(5);
        queues.push_back(request(Priority::High, 0).0);
        queues.push_back(request(Priority::Low, 0).0);

        assert_eq!(queues.drain_all().len(), 2);
        assert_eq!(queues.lengths(), QueueLengths::default());
    }

    #[tokio::test]
    async fn test_handle_resolves_with_value() {
        let (req, handle) = request(Priority::Normal, 7);
        let id = req.id;
        let value = (req.work)().await.map_err(|source| GovernorError::Failed {
            id,
            attempts: 1,
            source,
        });
        req.reply.send(value).ok();
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_handle_reports_dropped_sender() {
        let (req, handle) = request(Priority::Normal, 7);
        let id = handle.id();
        drop(req);
        match handle.await {
            Err(GovernorError::Dropped(dropped)) => assert_eq!(dropped, id),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
