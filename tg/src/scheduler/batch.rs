//! Per-type batch accumulator (debounce with a max size)

use std::collections::HashMap;

use tokio::task::JoinHandle;

use super::queue::QueuedRequest;

struct PendingBatch<T> {
    id: u64,
    items: Vec<QueuedRequest<T>>,
    timer: Option<JoinHandle<()>>,
}

/// Result of adding a request to its type's batch
pub(crate) enum BatchAdd<T> {
    /// First item of a new batch; the caller arms the window timer
    Opened { batch_id: u64 },
    Joined,
    /// Batch reached max size and was removed; its timer is cancelled
    Full(Vec<QueuedRequest<T>>),
}

pub(crate) struct BatchAccumulator<T> {
    pending: HashMap<String, PendingBatch<T>>,
    next_id: u64,
    max_size: usize,
}

impl<T> BatchAccumulator<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 0,
            max_size: max_size.max(1),
        }
    }

    pub fn add(&mut self, request: QueuedRequest<T>) -> BatchAdd<T> {
        let key = request.request_type.clone();
        let next_id = &mut self.next_id;
        let batch = self.pending.entry(key.clone()).or_insert_with(|| {
            *next_id += 1;
            PendingBatch {
                id: *next_id,
                items: Vec::new(),
                timer: None,
            }
        });
        batch.items.push(request);

        if batch.items.len() >= self.max_size {
            return match self.pending.remove(&key) {
                Some(batch) => {
                    if let Some(timer) = batch.timer {
                        timer.abort();
                    }
                    BatchAdd::Full(batch.items)
                }
                None => BatchAdd::Joined,
            };
        }
        if batch.items.len() == 1 {
            BatchAdd::Opened { batch_id: batch.id }
        } else {
            BatchAdd::Joined
        }
    }

    /// Attach the window timer to the batch it was armed for
    pub fn set_timer(&mut self, request_type: &str, batch_id: u64, timer: JoinHandle<()>) {
        match self.pending.get_mut(request_type) {
            Some(batch) if batch.id == batch_id => batch.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Remove the batch whose window expired, if it is still the open one
    ///
    /// Called from the timer task itself, so the timer is not aborted.
    pub fn take_expired(&mut self, request_type: &str, batch_id: u64) -> Option<Vec<QueuedRequest<T>>> {
        match self.pending.get(request_type) {
            Some(batch) if batch.id == batch_id => self.pending.remove(request_type).map(|b| b.items),
            _ => None,
        }
    }

    /// Cancel every timer and hand back all accumulated requests
    pub fn drain_all(&mut self) -> Vec<QueuedRequest<T>> {
        self.pending
            .drain()
            .flat_map(|(_, batch)| {
                if let Some(timer) = batch.timer {
                    timer.abort();
                }
                batch.items
            })
            .collect()
    }

    /// Requests currently waiting in open batches
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|b| b.items.len()).sum()
    }
}
