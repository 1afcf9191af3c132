//! The queue of previously inserted documents.
//!
//! Writers enqueue a [`QueueItem`] for every document they insert, readers
//! dequeue them to drive point reads. Two backends are available, selected
//! once at startup by [`Config`]; every caller holds only `Arc<dyn Queue>`.
//!
//! Queue failures are best-effort: a failed enqueue drops the item, a failed
//! dequeue looks like an empty queue. Both are logged and counted in
//! telemetry, neither is returned to the caller.

pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{document::QueueItem, telemetry::QueueMetrics};

pub use memory::Memory;
pub use redis::Redis;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Queue`] implementations.
pub enum Error {
    /// The Redis client failed.
    #[error("redis error: {0}")]
    Redis(#[from] fred::error::Error),
    /// An item could not be encoded or decoded.
    #[error("item encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A FIFO of [`QueueItem`]s safe for concurrent producers and consumers.
#[async_trait]
pub trait Queue: Send + Sync + std::fmt::Debug {
    /// Append `item` to the tail.
    ///
    /// Failures are recorded and the item dropped.
    async fn enqueue(&self, item: QueueItem);

    /// Remove and return the head, or `None` if nothing became available
    /// within the backend's bounded wait.
    async fn dequeue(&self) -> Option<QueueItem>;

    /// Return the head without removing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn head(&self) -> Result<Option<QueueItem>, Error>;

    /// Approximate length. May be stale by the time the caller acts on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn size(&self) -> Result<usize, Error>;

    /// Whether [`Queue::size`] is zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.size().await? == 0)
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Selects the [`Queue`] backend.
pub enum Config {
    /// In-process queue. Items do not outlive the process.
    #[default]
    Memory,
    /// A Redis list, shareable between docload instances.
    Redis(redis::Config),
}

/// Construct the configured backend.
///
/// # Errors
///
/// Returns an error if a networked backend cannot connect.
pub async fn from_config(config: &Config, metrics: QueueMetrics) -> Result<Arc<dyn Queue>, Error> {
    let queue: Arc<dyn Queue> = match config {
        Config::Memory => Arc::new(Memory::new(metrics)),
        Config::Redis(conf) => Arc::new(Redis::connect(conf, metrics).await?),
    };
    Ok(queue)
}

pub(crate) fn encode_item(item: &QueueItem) -> Result<String, Error> {
    Ok(serde_json::to_string(item)?)
}

pub(crate) fn decode_item(raw: &str) -> Result<QueueItem, Error> {
    Ok(serde_json::from_str(raw)?)
}
