//! The in-process [`Queue`].

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Error, Queue};
use crate::{document::QueueItem, telemetry::QueueMetrics};

/// An unbounded FIFO guarded by a mutex. Never waits on dequeue.
#[derive(Debug)]
pub struct Memory {
    items: Mutex<VecDeque<QueueItem>>,
    metrics: QueueMetrics,
}

impl Memory {
    /// Create an empty queue.
    #[must_use]
    pub fn new(metrics: QueueMetrics) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            metrics,
        }
    }
}

#[async_trait]
impl Queue for Memory {
    async fn enqueue(&self, item: QueueItem) {
        let start = Instant::now();
        self.items.lock().push_back(item);
        self.metrics.enqueued(start.elapsed());
    }

    async fn dequeue(&self) -> Option<QueueItem> {
        let start = Instant::now();
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.metrics.dequeued(start.elapsed());
        }
        item
    }

    async fn head(&self) -> Result<Option<QueueItem>, Error> {
        Ok(self.items.lock().front().cloned())
    }

    async fn size(&self) -> Result<usize, Error> {
        Ok(self.items.lock().len())
    }
}
