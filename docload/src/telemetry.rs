//! Aggregate what a load run did.
//!
//! Every worker, the document source and the queue report into one
//! [`Telemetry`] instance constructed up front and shared by `Arc`. Nothing
//! here installs a process-wide [`metrics`] recorder: the Prometheus recorder
//! is private to the instance and its handles are registered once at
//! construction. Counts needed for the final [`Report`] are kept alongside in
//! atomics so they can be read back exactly.
//!
//! ## Metrics
//!
//! `docload_operations_total{operation}`: Operations attempted
//! `docload_operation_failure_total{operation}`: Operations that failed
//! `docload_operation_latency_seconds{operation}`: Operation latency
//! `docload_documents_total`: Documents submitted for insert
//! `docload_templates_generated_total`: Documents rendered from the template
//! `docload_template_generation_duration_seconds`: Template render latency
//! `docload_document_publish_full_total`: Publish attempts refused by a full channel
//! `docload_queue_latency_seconds{operation}`: Queue enqueue/dequeue latency
//! `docload_items_queued`: Approximate number of queued items
//! `docload_queue_errors_total{operation}`: Failed queue operations
//! `docload_push_failure_total`: Failed pushes to the push gateway
//!

pub mod push;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use docload_signal::Watcher;
use metrics::{
    Counter, Gauge, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, SharedString, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::debug;

use crate::document::{OperationKind, OperationResult};

const UPKEEP_PERIOD: Duration = Duration::from_secs(5);

/// Periodically drain histogram samples until shutdown.
///
/// Required whenever nothing else renders `telemetry` on a schedule.
pub async fn upkeep(telemetry: Arc<Telemetry>, shutdown: Watcher) {
    let shutdown_wait = shutdown.recv();
    tokio::pin!(shutdown_wait);
    let mut ticks = tokio::time::interval(UPKEEP_PERIOD);
    loop {
        tokio::select! {
            _ = ticks.tick() => telemetry.run_upkeep(),
            () = &mut shutdown_wait => {
                debug!("shutdown signal received");
                return;
            }
        }
    }
}

/// Configuration for [`Telemetry`].
#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Additional labels to include in every metric
    #[serde(default)]
    pub global_labels: FxHashMap<String, String>,
    /// Push aggregated metrics to a Prometheus push gateway, if set.
    #[serde(default)]
    pub push_gateway: Option<push::Config>,
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Registers metric handles against a private recorder.
struct Registrar {
    recorder: PrometheusRecorder,
    metadata: Metadata<'static>,
}

impl Registrar {
    fn new(recorder: PrometheusRecorder) -> Self {
        Self {
            recorder,
            metadata: Metadata::new(module_path!(), Level::INFO, Some(module_path!())),
        }
    }

    fn key(name: &'static str, labels: &[(&'static str, &'static str)]) -> Key {
        let labels: Vec<Label> = labels.iter().map(|(k, v)| Label::new(*k, *v)).collect();
        Key::from_parts(name, labels)
    }

    fn counter(
        &self,
        name: &'static str,
        labels: &[(&'static str, &'static str)],
        help: &'static str,
    ) -> Counter {
        self.recorder
            .describe_counter(KeyName::from(name), None, SharedString::from(help));
        self.recorder
            .register_counter(&Self::key(name, labels), &self.metadata)
    }

    fn gauge(&self, name: &'static str, help: &'static str) -> Gauge {
        self.recorder
            .describe_gauge(KeyName::from(name), None, SharedString::from(help));
        self.recorder
            .register_gauge(&Self::key(name, &[]), &self.metadata)
    }

    fn histogram(
        &self,
        name: &'static str,
        labels: &[(&'static str, &'static str)],
        help: &'static str,
    ) -> Histogram {
        self.recorder.describe_histogram(
            KeyName::from(name),
            Some(Unit::Seconds),
            SharedString::from(help),
        );
        self.recorder
            .register_histogram(&Self::key(name, labels), &self.metadata)
    }
}

struct OperationMetrics {
    attempted: AtomicU64,
    failed: AtomicU64,
    latency_total_nanos: AtomicU64,
    latency_max_nanos: AtomicU64,
    attempted_counter: Counter,
    failed_counter: Counter,
    latency: Histogram,
}

impl OperationMetrics {
    fn new(registrar: &Registrar, kind: OperationKind) -> Self {
        let labels = [("operation", kind.as_str())];
        Self {
            attempted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            latency_total_nanos: AtomicU64::new(0),
            latency_max_nanos: AtomicU64::new(0),
            attempted_counter: registrar.counter(
                "docload_operations_total",
                &labels,
                "the number of attempted database operations",
            ),
            failed_counter: registrar.counter(
                "docload_operation_failure_total",
                &labels,
                "the number of failed database operations",
            ),
            latency: registrar.histogram(
                "docload_operation_latency_seconds",
                &labels,
                "latency of database operations",
            ),
        }
    }

    fn record(&self, result: &OperationResult) {
        let latency = nanos(result.duration);
        self.attempted.fetch_add(1, Ordering::Relaxed);
        self.latency_total_nanos
            .fetch_add(latency, Ordering::Relaxed);
        self.latency_max_nanos.fetch_max(latency, Ordering::Relaxed);
        self.attempted_counter.increment(1);
        self.latency.record(result.duration_seconds());
        if !result.success {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.failed_counter.increment(1);
        }
    }

    fn summary(&self) -> OperationSummary {
        let attempted = self.attempted.load(Ordering::Relaxed);
        let total = self.latency_total_nanos.load(Ordering::Relaxed);
        let mean_latency = if attempted == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total / attempted)
        };
        OperationSummary {
            attempted,
            failed: self.failed.load(Ordering::Relaxed),
            mean_latency,
            max_latency: Duration::from_nanos(self.latency_max_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Queue operations that report latency and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOperation {
    /// Adding an item to the tail.
    Enqueue,
    /// Removing an item from the head.
    Dequeue,
}

struct QueueInner {
    enqueue_latency: Histogram,
    dequeue_latency: Histogram,
    items_queued: Gauge,
    enqueue_errors: Counter,
    dequeue_errors: Counter,
    errors: AtomicU64,
}

/// The slice of [`Telemetry`] a queue backend reports into.
#[derive(Clone)]
pub struct QueueMetrics {
    inner: Arc<QueueInner>,
}

impl QueueMetrics {
    fn new(registrar: &Registrar) -> Self {
        let errors_help = "number of errored queue operations";
        let latency_help = "latency of queue operations";
        Self {
            inner: Arc::new(QueueInner {
                enqueue_latency: registrar.histogram(
                    "docload_queue_latency_seconds",
                    &[("operation", "enqueue")],
                    latency_help,
                ),
                dequeue_latency: registrar.histogram(
                    "docload_queue_latency_seconds",
                    &[("operation", "dequeue")],
                    latency_help,
                ),
                items_queued: registrar.gauge(
                    "docload_items_queued",
                    "the approximate number of items in the queue",
                ),
                enqueue_errors: registrar.counter(
                    "docload_queue_errors_total",
                    &[("operation", "enqueue")],
                    errors_help,
                ),
                dequeue_errors: registrar.counter(
                    "docload_queue_errors_total",
                    &[("operation", "dequeue")],
                    errors_help,
                ),
                errors: AtomicU64::new(0),
            }),
        }
    }

    /// Record a successful enqueue.
    pub fn enqueued(&self, latency: Duration) {
        self.inner.enqueue_latency.record(latency.as_secs_f64());
        self.inner.items_queued.increment(1.0);
    }

    /// Record a successful dequeue.
    pub fn dequeued(&self, latency: Duration) {
        self.inner.dequeue_latency.record(latency.as_secs_f64());
        self.inner.items_queued.decrement(1.0);
    }

    /// Record a failed queue operation.
    pub fn error(&self, operation: QueueOperation) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        match operation {
            QueueOperation::Enqueue => self.inner.enqueue_errors.increment(1),
            QueueOperation::Dequeue => self.inner.dequeue_errors.increment(1),
        }
    }

    /// Total failed queue operations so far.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.inner.errors.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueMetrics")
            .field("errors", &self.errors())
            .finish_non_exhaustive()
    }
}

/// Aggregated results of a load run.
///
/// Safe for concurrent use, every method takes `&self`.
pub struct Telemetry {
    handle: PrometheusHandle,
    insert: OperationMetrics,
    read: OperationMetrics,
    documents: AtomicU64,
    documents_counter: Counter,
    templates_generated: AtomicU64,
    templates_counter: Counter,
    template_duration: Histogram,
    publish_full: Counter,
    push_failures: Counter,
    queue: QueueMetrics,
}

impl Telemetry {
    /// Create a new [`Telemetry`] instance with every series registered at
    /// zero.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let mut builder =
            PrometheusBuilder::new().add_global_label("version", env!("CARGO_PKG_VERSION"));
        for (k, v) in &config.global_labels {
            builder = builder.add_global_label(k, v);
        }
        let recorder = builder.build_recorder();
        let handle = recorder.handle();
        let registrar = Registrar::new(recorder);

        Self {
            handle,
            insert: OperationMetrics::new(&registrar, OperationKind::Insert),
            read: OperationMetrics::new(&registrar, OperationKind::Read),
            documents: AtomicU64::new(0),
            documents_counter: registrar.counter(
                "docload_documents_total",
                &[],
                "the number of documents submitted for insert",
            ),
            templates_generated: AtomicU64::new(0),
            templates_counter: registrar.counter(
                "docload_templates_generated_total",
                &[],
                "number of documents generated from a template",
            ),
            template_duration: registrar.histogram(
                "docload_template_generation_duration_seconds",
                &[],
                "the duration to generate a document from a template",
            ),
            publish_full: registrar.counter(
                "docload_document_publish_full_total",
                &[],
                "publish attempts refused because the document channel was full",
            ),
            push_failures: registrar.counter(
                "docload_push_failure_total",
                &[],
                "failed pushes to the push gateway",
            ),
            queue: QueueMetrics::new(&registrar),
        }
    }

    /// Record the outcome of one operation.
    pub fn record(&self, result: &OperationResult) {
        match result.kind {
            OperationKind::Insert => {
                self.insert.record(result);
                // Counted whether or not the insert succeeded.
                self.documents
                    .fetch_add(result.document_count, Ordering::Relaxed);
                self.documents_counter.increment(result.document_count);
            }
            OperationKind::Read => self.read.record(result),
        }
    }

    /// Record one document rendered from the template.
    pub fn template_rendered(&self, duration: Duration) {
        self.templates_generated.fetch_add(1, Ordering::Relaxed);
        self.templates_counter.increment(1);
        self.template_duration.record(duration.as_secs_f64());
    }

    /// Record a publish attempt refused by a full document channel.
    pub fn document_publish_full(&self) {
        self.publish_full.increment(1);
    }

    /// Record a failed push to the push gateway.
    pub fn push_failed(&self) {
        self.push_failures.increment(1);
    }

    /// Handles for a queue backend to report into.
    #[must_use]
    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.clone()
    }

    /// Render every series in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Drain recorded histogram samples into their summaries.
    ///
    /// Must be called periodically, samples accumulate in memory until it is.
    pub fn run_upkeep(&self) {
        self.handle.run_upkeep();
    }

    /// Snapshot the aggregate counts.
    #[must_use]
    pub fn report(&self) -> Report {
        Report {
            insert: self.insert.summary(),
            read: self.read.summary(),
            documents: self.documents.load(Ordering::Relaxed),
            templates_generated: self.templates_generated.load(Ordering::Relaxed),
            queue_errors: self.queue.errors(),
        }
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("report", &self.report())
            .finish_non_exhaustive()
    }
}

/// Aggregate statistics for one [`OperationKind`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OperationSummary {
    /// Operations attempted.
    pub attempted: u64,
    /// Operations that failed.
    pub failed: u64,
    /// Mean latency over every attempt.
    pub mean_latency: Duration,
    /// Largest latency of any attempt.
    pub max_latency: Duration,
}

impl OperationSummary {
    /// Operations that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.attempted.saturating_sub(self.failed)
    }
}

/// The final statistics of a load run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Insert statistics.
    pub insert: OperationSummary,
    /// Read statistics.
    pub read: OperationSummary,
    /// Documents submitted for insert, counting every member of a batch.
    pub documents: u64,
    /// Documents rendered from the template.
    pub templates_generated: u64,
    /// Failed queue operations.
    pub queue_errors: u64,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, summary) in [
            (OperationKind::Insert, &self.insert),
            (OperationKind::Read, &self.read),
        ] {
            writeln!(
                f,
                "{kind}: attempted={} failed={} mean_latency={:?} max_latency={:?}",
                summary.attempted, summary.failed, summary.mean_latency, summary.max_latency
            )?;
        }
        write!(
            f,
            "documents={} templates_generated={} queue_errors={}",
            self.documents, self.templates_generated, self.queue_errors
        )
    }
}
