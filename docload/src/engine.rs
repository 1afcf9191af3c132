//! The load run lifecycle.
//!
//! [`Engine::init`] performs every step that can fail fatally: connecting to
//! the database and the queue backend, loading the template and rendering
//! the first document. [`Engine::start`] then runs the load:
//!
//! 1. The deadline is fixed once, `now + duration`.
//! 2. The document source, the telemetry upkeep task and the optional
//!    push-gateway pusher start, each holding a registered shutdown
//!    [`docload_signal::Watcher`].
//! 3. Writers and readers start and run until the deadline, or until the
//!    caller's cancel signal arrives, which stops them early.
//! 4. Once every worker has exited, shutdown is broadcast and the engine
//!    waits for every utility task to acknowledge and finish. The pusher
//!    makes its final push here in both cases.
//!
//! A document source failure at any point aborts the workers and ends the
//! run with an error.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use docload_signal::Watcher;
use tokio::{task::JoinSet, time::Instant};
use tracing::{error, info};

use crate::{
    config::Config,
    document::Document,
    queue::{self, Queue},
    source::{self, DocumentSource, Render},
    target::{
        self, Target,
        mongo::{BsonTemplate, Mongo},
    },
    telemetry::{self, Report, Telemetry, push::Pusher},
    template::{self, Template},
    worker::{Reader, Shared, Writer},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Engine`].
pub enum Error {
    /// The target could not be reached.
    #[error("target error: {0}")]
    Target(#[from] target::Error),
    /// The queue backend could not be reached.
    #[error("queue error: {0}")]
    Queue(#[from] queue::Error),
    /// The template could not be loaded.
    #[error("template error: {0}")]
    Template(#[from] template::Error),
    /// The document source failed.
    #[error("document source error: {0}")]
    Source(#[from] source::Error),
    /// A task could not be joined.
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// A shutdown watcher could not be registered.
    #[error(transparent)]
    Registration(#[from] docload_signal::RegisterError),
}

/// A configured, connected load run.
#[derive(Debug)]
pub struct Engine {
    duration: Duration,
    writers: usize,
    readers: usize,
    batch_size: NonZeroUsize,
    channel_capacity: NonZeroUsize,
    backoff: Duration,
    push_gateway: Option<telemetry::push::Config>,
    origin: String,
    target: Arc<dyn Target>,
    queue: Arc<dyn Queue>,
    renderer: Box<dyn Render>,
    initial: Document,
    telemetry: Arc<Telemetry>,
}

impl Engine {
    /// Connect to every collaborator named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or queue backend cannot be reached,
    /// or the template cannot be loaded or rendered.
    pub async fn init(config: &Config, telemetry: Arc<Telemetry>) -> Result<Self, Error> {
        let target = Arc::new(Mongo::connect(&config.mongodb).await?);
        let queue = queue::from_config(&config.queue, telemetry.queue_metrics()).await?;
        let template = Template::from_config(config.template.as_ref())?;
        info!(template = template.name(), "template loaded");
        let mut renderer = BsonTemplate(template);
        let initial = renderer.render()?;

        Ok(Self::new(
            config,
            target,
            queue,
            Box::new(renderer),
            initial,
            telemetry,
        ))
    }

    /// Assemble an engine from already-connected parts.
    #[must_use]
    pub fn new(
        config: &Config,
        target: Arc<dyn Target>,
        queue: Arc<dyn Queue>,
        renderer: Box<dyn Render>,
        initial: Document,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            duration: config.duration(),
            writers: config.writers,
            readers: config.readers,
            batch_size: config.batch_size,
            channel_capacity: config.document_channel_capacity,
            backoff: Duration::from_millis(config.empty_queue_backoff_milliseconds),
            push_gateway: config.telemetry.push_gateway.clone(),
            origin: crate::hostname(),
            target,
            queue,
            renderer,
            initial,
            telemetry,
        }
    }

    /// The queue, for inspection after the run.
    #[must_use]
    pub fn queue(&self) -> Arc<dyn Queue> {
        Arc::clone(&self.queue)
    }

    /// Run the load to the deadline and return the final statistics.
    ///
    /// A signal on `cancel` stops the workers before the deadline. The run
    /// then shuts down as it would at the deadline and reports what it did.
    ///
    /// # Errors
    ///
    /// Returns an error if the document source fails or a task panics.
    pub async fn start(self, cancel: Watcher) -> Result<Report, Error> {
        let deadline = Instant::now() + self.duration;
        let (shutdown_watcher, shutdown_broadcaster) = docload_signal::signal();
        let (sender, documents) = source::channel(self.channel_capacity);

        let mut utilities: JoinSet<Result<(), Error>> = JoinSet::new();
        let source = DocumentSource::new(
            self.renderer,
            self.initial,
            sender,
            Arc::clone(&self.telemetry),
            shutdown_watcher.register()?,
        );
        utilities.spawn(async move { source.run().await.map_err(Error::from) });
        let upkeep = telemetry::upkeep(Arc::clone(&self.telemetry), shutdown_watcher.register()?);
        utilities.spawn(async move {
            upkeep.await;
            Ok(())
        });
        if let Some(push_gateway) = &self.push_gateway {
            let pusher = Pusher::new(
                push_gateway,
                &self.origin,
                Arc::clone(&self.telemetry),
                shutdown_watcher.register()?,
            );
            utilities.spawn(async move {
                pusher.run().await;
                Ok(())
            });
        }
        // Any watcher left alive here would hold up `signal_and_wait`.
        drop(shutdown_watcher);

        let shared = Shared {
            target: self.target,
            queue: self.queue,
            telemetry: Arc::clone(&self.telemetry),
            deadline,
        };
        let mut workers = JoinSet::new();
        for _ in 0..self.writers {
            let writer = Writer::new(
                shared.clone(),
                documents.clone(),
                self.batch_size,
                self.origin.clone(),
            );
            workers.spawn(writer.run());
        }
        for _ in 0..self.readers {
            workers.spawn(Reader::new(shared.clone(), self.backoff).run());
        }
        drop(documents);
        info!(
            writers = self.writers,
            readers = self.readers,
            duration = ?self.duration,
            "load started"
        );

        let cancelled = cancel.recv();
        tokio::pin!(cancelled);

        loop {
            tokio::select! {
                () = &mut cancelled => {
                    info!("run cancelled, stopping workers");
                    workers.shutdown().await;
                    break;
                }
                Some(res) = utilities.join_next() => {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            error!("utility task failed, aborting run: {err}");
                            workers.shutdown().await;
                            shutdown_broadcaster.signal();
                            return Err(err);
                        }
                        Err(err) => {
                            error!("could not join utility task: {err}");
                            workers.shutdown().await;
                            shutdown_broadcaster.signal();
                            return Err(Error::Join(err));
                        }
                    }
                }
                res = workers.join_next() => {
                    match res {
                        Some(Ok(())) => {}
                        Some(Err(err)) => {
                            error!("could not join worker task: {err}");
                            return Err(Error::Join(err));
                        }
                        None => break,
                    }
                }
            }
        }

        info!("all workers exited, signaling shutdown");
        shutdown_broadcaster.signal_and_wait().await;
        while let Some(res) = utilities.join_next().await {
            res??;
        }

        let report = self.telemetry.report();
        info!("load finished");
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;
    use tokio::{
        sync::mpsc,
        time::{Instant, sleep, timeout},
    };
    use warp::Filter;

    use super::{Engine, Error};
    use crate::{
        config::Config,
        document::Document,
        queue::{Memory, Queue},
        telemetry::{self, Telemetry},
        test::{FailingRenderer, ScriptedTarget, StaticRenderer},
    };

    const BOUND: Duration = Duration::from_secs(10);

    fn config(writers: usize, readers: usize) -> Config {
        Config::from_yaml(&format!(
            "duration_seconds: 1\nwriters: {writers}\nreaders: {readers}\nempty_queue_backoff_milliseconds: 50\n"
        ))
        .expect("valid config")
    }

    fn parts() -> (Arc<ScriptedTarget>, Arc<Memory>, Arc<Telemetry>) {
        let telemetry = Arc::new(Telemetry::new(&telemetry::Config::default()));
        let queue = Arc::new(Memory::new(telemetry.queue_metrics()));
        (Arc::new(ScriptedTarget::new()), queue, telemetry)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lone_reader_on_empty_queue_reports_nothing() {
        let (target, queue, telemetry) = parts();
        let (cancel, _cancel_broadcaster) = docload_signal::signal();
        let engine = Engine::new(
            &config(0, 1),
            target,
            queue,
            Box::new(StaticRenderer::new(b"doc")),
            Document::new(&b"doc"[..]),
            telemetry,
        );

        let start = Instant::now();
        let report = timeout(BOUND, engine.start(cancel))
            .await
            .expect("engine hung")
            .expect("engine failed");
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(report.insert.attempted, 0);
        assert_eq!(report.read.attempted, 0);
        assert_eq!(report.read.failed, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reads_only_what_was_inserted() {
        let (target, queue, telemetry) = parts();
        let (cancel, _cancel_broadcaster) = docload_signal::signal();
        let engine = Engine::new(
            &config(2, 2),
            Arc::clone(&target) as _,
            Arc::clone(&queue) as Arc<dyn Queue>,
            Box::new(StaticRenderer::new(b"doc")),
            Document::new(&b"doc"[..]),
            telemetry,
        );
        let handle = engine.queue();

        let report = timeout(BOUND, engine.start(cancel))
            .await
            .expect("engine hung")
            .expect("engine failed");

        assert!(report.insert.attempted > 0);
        assert_eq!(report.insert.failed, 0);
        assert_eq!(report.documents, report.insert.attempted);
        assert!(report.read.attempted > 0);
        // Readers only see identifiers minted by a successful insert.
        assert_eq!(report.read.failed, 0);
        assert!(report.templates_generated > 0);

        let issued = target.issued();
        if let Some(head) = handle.head().await.expect("head") {
            assert!(issued.contains(&head.identifier));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn source_failure_aborts_the_run() {
        let (target, queue, telemetry) = parts();
        let (cancel, _cancel_broadcaster) = docload_signal::signal();
        let engine = Engine::new(
            &config(2, 0),
            target,
            queue,
            Box::new(FailingRenderer),
            Document::new(&b"doc"[..]),
            telemetry,
        );

        let result = timeout(BOUND, engine.start(cancel)).await.expect("engine hung");
        assert!(matches!(result, Err(Error::Source(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_run_still_pushes_final_telemetry() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let route = warp::post()
            .and(warp::path!("metrics" / "job" / String / "instance" / String))
            .and(warp::body::bytes())
            .map(move |_job: String, _instance: String, body: Bytes| {
                let _ = tx.send(body);
                warp::reply()
            });
        let (addr, serve_fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve_fut);

        let config = Config::from_yaml(&format!(
            "duration_seconds: 3600\nwriters: 1\nreaders: 1\nempty_queue_backoff_milliseconds: 10\ntelemetry:\n  push_gateway:\n    server: {addr}\n    frequency_seconds: 3600\n"
        ))
        .expect("valid config");
        let (target, queue, telemetry) = parts();
        let engine = Engine::new(
            &config,
            target,
            queue,
            Box::new(StaticRenderer::new(b"doc")),
            Document::new(&b"doc"[..]),
            telemetry,
        );

        let (cancel, cancel_broadcaster) = docload_signal::signal();
        let run = tokio::spawn(engine.start(cancel));
        sleep(Duration::from_millis(200)).await;
        cancel_broadcaster.signal();

        let report = timeout(BOUND, run)
            .await
            .expect("engine hung after cancel")
            .expect("engine panicked")
            .expect("engine failed");
        assert!(report.insert.attempted > 0);

        let body = rx.try_recv().expect("no final push");
        let body = String::from_utf8(body.to_vec()).expect("body not utf8");
        assert!(body.contains("docload_operations_total"));
    }
}
