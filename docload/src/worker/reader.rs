use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

use super::Shared;
use crate::document::{OperationKind, OperationResult, QueueItem};

/// Reads back previously inserted documents until the deadline.
#[derive(Debug)]
pub(crate) struct Reader {
    id: Uuid,
    shared: Shared,
    backoff: Duration,
}

impl Reader {
    pub(crate) fn new(shared: Shared, backoff: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            shared,
            backoff,
        }
    }

    pub(crate) async fn run(self) {
        let span = info_span!("reader", id = %self.id);
        self.spin().instrument(span).await;
    }

    async fn first_item(&self) -> Option<QueueItem> {
        loop {
            if self.shared.expired() {
                return None;
            }
            if let Some(item) = self.shared.queue.dequeue().await {
                return Some(item);
            }
            let wake = (Instant::now() + self.backoff).min(self.shared.deadline);
            sleep_until(wake).await;
        }
    }

    async fn spin(self) {
        let Some(mut held) = self.first_item().await else {
            debug!("deadline reached before the first queue item");
            return;
        };
        debug!("reader running");

        while !self.shared.expired() {
            // An empty queue means another read of the held item.
            if let Some(item) = self.shared.queue.dequeue().await {
                held = item;
            }
            self.read(&held).await;
        }
        debug!("deadline reached, reader exiting");
    }

    pub(crate) async fn read(&self, item: &QueueItem) -> OperationResult {
        let start = Instant::now();
        let outcome = self.shared.target.read_one(&item.identifier).await;
        let result = OperationResult {
            kind: OperationKind::Read,
            duration: start.elapsed(),
            document_count: 1,
            success: outcome.is_ok(),
        };
        self.shared.telemetry.record(&result);
        if let Err(err) = outcome {
            debug!("read of {id} failed: {err}", id = item.identifier);
        }
        result
    }
}
