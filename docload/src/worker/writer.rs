use std::num::NonZeroUsize;

use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

use super::Shared;
use crate::{
    document::{Document, OperationKind, OperationResult, QueueItem},
    source::Documents,
};

/// Inserts documents until the deadline.
#[derive(Debug)]
pub(crate) struct Writer {
    id: Uuid,
    shared: Shared,
    documents: Documents,
    batch_size: NonZeroUsize,
    origin: String,
}

impl Writer {
    pub(crate) fn new(
        shared: Shared,
        documents: Documents,
        batch_size: NonZeroUsize,
        origin: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            shared,
            documents,
            batch_size,
            origin,
        }
    }

    pub(crate) async fn run(self) {
        let span = info_span!("writer", id = %self.id);
        self.spin().instrument(span).await;
    }

    async fn spin(self) {
        let first = tokio::select! {
            document = self.documents.next() => document,
            () = sleep_until(self.shared.deadline) => {
                debug!("deadline reached before the first document");
                return;
            }
        };
        let Some(mut held) = first else {
            debug!("document channel closed before the first document");
            return;
        };
        debug!("writer running");

        let mut batch = Vec::with_capacity(self.batch_size.get());
        while !self.shared.expired() {
            batch.clear();
            for _ in 0..self.batch_size.get() {
                // Reuse the held document rather than wait on the source.
                if let Some(document) = self.documents.try_next() {
                    held = document;
                }
                batch.push(held.clone());
            }
            self.write_batch(&batch).await;
        }
        debug!("deadline reached, writer exiting");
    }

    /// Insert `batch` in one call, record the outcome and enqueue every
    /// inserted identifier.
    pub(crate) async fn write_batch(&self, batch: &[Document]) -> OperationResult {
        let start = Instant::now();
        let outcome = match batch {
            [document] => self
                .shared
                .target
                .insert_one(document)
                .await
                .map(|id| vec![id]),
            documents => self.shared.target.insert_many(documents).await,
        };
        let result = OperationResult {
            kind: OperationKind::Insert,
            duration: start.elapsed(),
            document_count: u64::try_from(batch.len()).unwrap_or(u64::MAX),
            success: outcome.is_ok(),
        };
        self.shared.telemetry.record(&result);

        match outcome {
            Ok(ids) => {
                for id in ids {
                    self.shared
                        .queue
                        .enqueue(QueueItem::new(id, self.origin.as_str()))
                        .await;
                }
            }
            Err(err) => debug!("insert failed: {err}"),
        }
        result
    }
}

#[cfg(test)]
mod test {
    use std::{num::NonZeroUsize, sync::Arc, time::Duration};

    use tokio::time::Instant;

    use super::Writer;
    use crate::{
        document::Document,
        queue::{Memory, Queue},
        source,
        telemetry::{Config, Telemetry},
        test::ScriptedTarget,
        worker::Shared,
    };

    fn shared(target: Arc<ScriptedTarget>, deadline: Instant) -> (Shared, Arc<Memory>) {
        let telemetry = Arc::new(Telemetry::new(&Config::default()));
        let queue = Arc::new(Memory::new(telemetry.queue_metrics()));
        let shared = Shared {
            target,
            queue: Arc::clone(&queue) as Arc<dyn Queue>,
            telemetry,
            deadline,
        };
        (shared, queue)
    }

    #[tokio::test]
    async fn failed_inserts_enqueue_nothing() {
        let target = Arc::new(ScriptedTarget::with_insert_script([
            true, false, true, false, true,
        ]));
        let (shared, queue) = shared(Arc::clone(&target), Instant::now());
        let telemetry = Arc::clone(&shared.telemetry);
        let (_sender, documents) = source::channel(NonZeroUsize::MIN);
        let writer = Writer::new(shared, documents, NonZeroUsize::MIN, "host-a".to_string());

        let document = Document::new(&b"doc"[..]);
        let mut failures = 0;
        for _ in 0..5 {
            let result = writer.write_batch(std::slice::from_ref(&document)).await;
            if !result.success {
                failures += 1;
                assert_eq!(telemetry.report().insert.failed, failures);
            }
        }

        let report = telemetry.report();
        assert_eq!(report.insert.attempted, 5);
        assert_eq!(report.insert.failed, 2);
        assert_eq!(queue.size().await.expect("size"), 3);

        let issued = target.issued();
        while let Some(item) = queue.dequeue().await {
            assert!(issued.contains(&item.identifier));
            assert_eq!(item.origin, "host-a");
        }
    }

    #[tokio::test]
    async fn batches_enqueue_every_identifier() {
        let target = Arc::new(ScriptedTarget::new());
        let (shared, queue) = shared(Arc::clone(&target), Instant::now());
        let telemetry = Arc::clone(&shared.telemetry);
        let (_sender, documents) = source::channel(NonZeroUsize::MIN);
        let batch_size = NonZeroUsize::new(4).expect("non-zero");
        let writer = Writer::new(shared, documents, batch_size, "host-a".to_string());

        let batch = vec![Document::new(&b"doc"[..]); 4];
        let result = writer.write_batch(&batch).await;

        assert!(result.success);
        assert_eq!(result.document_count, 4);
        assert_eq!(telemetry.report().insert.attempted, 1);
        assert_eq!(telemetry.report().documents, 4);
        assert_eq!(queue.size().await.expect("size"), 4);
    }

    #[tokio::test]
    async fn exits_at_deadline_without_documents() {
        let target = Arc::new(ScriptedTarget::new());
        let deadline = Instant::now() + Duration::from_millis(50);
        let (shared, _queue) = shared(target, deadline);
        let telemetry = Arc::clone(&shared.telemetry);
        let (_sender, documents) = source::channel(NonZeroUsize::MIN);
        let writer = Writer::new(shared, documents, NonZeroUsize::MIN, "host-a".to_string());

        tokio::time::timeout(Duration::from_secs(5), writer.run())
            .await
            .expect("writer outlived its deadline");
        assert_eq!(telemetry.report().insert.attempted, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reuses_held_document_while_channel_is_empty() {
        let target = Arc::new(ScriptedTarget::new());
        let deadline = Instant::now() + Duration::from_millis(100);
        let (shared, _queue) = shared(Arc::clone(&target), deadline);
        let telemetry = Arc::clone(&shared.telemetry);
        let (sender, documents) = source::channel(NonZeroUsize::MIN);
        let writer = Writer::new(shared, documents, NonZeroUsize::MIN, "host-a".to_string());

        sender
            .send(Document::new(&b"only"[..]))
            .await
            .expect("send failed");
        tokio::time::timeout(Duration::from_secs(5), writer.run())
            .await
            .expect("writer outlived its deadline");

        let report = telemetry.report();
        assert!(report.insert.attempted > 1, "{report:?}");
        assert_eq!(report.insert.failed, 0);
        assert_eq!(target.inserted_documents(), vec![Document::new(&b"only"[..])]);
    }
}
