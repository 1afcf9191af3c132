//! The tasks that put load on the target.
//!
//! Writers insert documents from the source channel and enqueue what they
//! inserted; readers dequeue those identifiers and read the documents back.
//! Both run until the shared deadline, checked once per loop iteration.
//! Neither ever fails: operation errors are recorded in telemetry and the
//! loop moves on.

mod reader;
mod writer;

pub(crate) use reader::Reader;
pub(crate) use writer::Writer;

use std::sync::Arc;

use tokio::time::Instant;

use crate::{queue::Queue, target::Target, telemetry::Telemetry};

/// State every worker shares.
#[derive(Debug, Clone)]
pub(crate) struct Shared {
    pub(crate) target: Arc<dyn Target>,
    pub(crate) queue: Arc<dyn Queue>,
    pub(crate) telemetry: Arc<Telemetry>,
    pub(crate) deadline: Instant,
}

impl Shared {
    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
