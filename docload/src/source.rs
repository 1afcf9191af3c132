//! The document source.
//!
//! A single task renders documents and publishes them on a bounded channel
//! shared by every writer. Publishing never waits: when the channel is full
//! the source counts the refusal, backs off briefly and offers the same
//! document again. The source runs until shutdown is signaled or every
//! writer has gone. A render failure ends the run.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use docload_signal::Watcher;
use tokio::{
    sync::{
        Mutex,
        mpsc::{self, error::TryRecvError, error::TrySendError},
    },
    time::Instant,
};
use tracing::{error, info};

use crate::{document::Document, target, telemetry::Telemetry, template};

const FULL_BACKOFF: Duration = Duration::from_millis(1);

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`DocumentSource`].
pub enum Error {
    /// The template could not be rendered.
    #[error(transparent)]
    Template(#[from] template::Error),
    /// A rendered document could not be encoded for the target.
    #[error(transparent)]
    Encode(#[from] target::Error),
}

/// Produces encoded documents on demand.
pub trait Render: Send + std::fmt::Debug {
    /// Render the next document.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the run.
    fn render(&mut self) -> Result<Document, Error>;
}

/// The consuming half of the document channel, shared by every writer.
#[derive(Debug, Clone)]
pub struct Documents {
    receiver: Arc<Mutex<mpsc::Receiver<Document>>>,
}

impl Documents {
    /// Wait for the next document. `None` once the source has stopped and
    /// the channel is drained.
    pub async fn next(&self) -> Option<Document> {
        self.receiver.lock().await.recv().await
    }

    /// Take a document if one is ready, without waiting.
    #[must_use]
    pub fn try_next(&self) -> Option<Document> {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return None;
        };
        match receiver.try_recv() {
            Ok(document) => Some(document),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

/// Create the bounded document channel.
#[must_use]
pub fn channel(capacity: NonZeroUsize) -> (mpsc::Sender<Document>, Documents) {
    let (sender, receiver) = mpsc::channel(capacity.get());
    (
        sender,
        Documents {
            receiver: Arc::new(Mutex::new(receiver)),
        },
    )
}

/// The document producer task.
#[derive(Debug)]
pub struct DocumentSource {
    renderer: Box<dyn Render>,
    current: Document,
    sender: mpsc::Sender<Document>,
    telemetry: Arc<Telemetry>,
    shutdown: Watcher,
}

impl DocumentSource {
    /// Create a new [`DocumentSource`] whose first publish is `initial`.
    #[must_use]
    pub fn new(
        renderer: Box<dyn Render>,
        initial: Document,
        sender: mpsc::Sender<Document>,
        telemetry: Arc<Telemetry>,
        shutdown: Watcher,
    ) -> Self {
        Self {
            renderer,
            current: initial,
            sender,
            telemetry,
            shutdown,
        }
    }

    /// Run this [`DocumentSource`] to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails.
    pub async fn run(mut self) -> Result<(), Error> {
        info!("document source running");
        loop {
            if !matches!(self.shutdown.try_recv(), Ok(false)) {
                info!("shutdown signal received");
                return Ok(());
            }

            match self.sender.try_send(self.current.clone()) {
                Ok(()) => {
                    let start = Instant::now();
                    self.current = self.renderer.render().map_err(|err| {
                        error!("document render failed: {err}");
                        err
                    })?;
                    self.telemetry.template_rendered(start.elapsed());
                    tokio::task::yield_now().await;
                }
                Err(TrySendError::Full(_)) => {
                    self.telemetry.document_publish_full();
                    tokio::time::sleep(FULL_BACKOFF).await;
                }
                Err(TrySendError::Closed(_)) => {
                    info!("all writers gone, document source stopping");
                    return Ok(());
                }
            }
        }
    }
}
