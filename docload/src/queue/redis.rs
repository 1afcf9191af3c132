//! A [`Queue`] backed by a Redis list.
//!
//! Items are JSON-encoded and appended with `RPUSH`. `BLPOP` removes from the
//! head, waiting at most `dequeue_timeout_milliseconds` for an item to
//! arrive. Several docload instances pointed at the same key share one queue.

use std::time::Duration;

use async_trait::async_trait;
use fred::{
    prelude::{ClientLike, ListInterface, Pool},
    types::{Builder, config::Config as RedisConfig},
};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Error, Queue, decode_item, encode_item};
use crate::{
    document::QueueItem,
    telemetry::{QueueMetrics, QueueOperation},
};

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key() -> String {
    "docload:queue".to_string()
}

fn default_pool_size() -> usize {
    8
}

fn default_dequeue_timeout_milliseconds() -> u64 {
    1_000
}

fn default_command_timeout_seconds() -> u64 {
    5
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Configuration for [`Redis`].
pub struct Config {
    /// Redis connection URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// The list key items are stored under.
    #[serde(default = "default_key")]
    pub key: String,
    /// Number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Longest `BLPOP` wait for an item.
    #[serde(default = "default_dequeue_timeout_milliseconds")]
    pub dequeue_timeout_milliseconds: u64,
    /// Timeout applied to every non-blocking command.
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            key: default_key(),
            pool_size: default_pool_size(),
            dequeue_timeout_milliseconds: default_dequeue_timeout_milliseconds(),
            command_timeout_seconds: default_command_timeout_seconds(),
        }
    }
}

/// The Redis list backend.
pub struct Redis {
    pool: Pool,
    key: String,
    dequeue_timeout: Duration,
    metrics: QueueMetrics,
}

impl std::fmt::Debug for Redis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redis")
            .field("key", &self.key)
            .field("dequeue_timeout", &self.dequeue_timeout)
            .finish_non_exhaustive()
    }
}

impl Redis {
    /// Connect a pool to the configured server and wait for it to come up.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(config: &Config, metrics: QueueMetrics) -> Result<Self, Error> {
        let redis_config = RedisConfig::from_url(&config.url)?;
        let command_timeout = Duration::from_secs(config.command_timeout_seconds);
        let dequeue_timeout = Duration::from_millis(config.dequeue_timeout_milliseconds);

        let pool = Builder::from_config(redis_config)
            .with_connection_config(|conn| {
                conn.connection_timeout = command_timeout;
                conn.internal_command_timeout = command_timeout;
            })
            .with_performance_config(|perf| {
                // BLPOP holds its connection for up to the dequeue timeout.
                perf.default_command_timeout = command_timeout + dequeue_timeout;
            })
            .build_pool(config.pool_size.max(1))?;

        let _connections = pool.connect_pool();
        debug!("waiting for redis connections");
        pool.wait_for_connect().await?;
        info!(url = %config.url, key = %config.key, "connected to redis queue");

        Ok(Self {
            pool,
            key: config.key.clone(),
            dequeue_timeout,
            metrics,
        })
    }

    async fn try_enqueue(&self, item: &QueueItem) -> Result<(), Error> {
        let raw = encode_item(item)?;
        let _len: i64 = self.pool.rpush(&self.key, raw).await?;
        Ok(())
    }

    async fn try_dequeue(&self) -> Result<Option<String>, Error> {
        let popped: Option<(String, String)> = self
            .pool
            .blpop(&self.key, self.dequeue_timeout.as_secs_f64())
            .await?;
        Ok(popped.map(|(_key, raw)| raw))
    }
}

/// Record the outcome of one `RPUSH`. A failed item is dropped.
fn settle_enqueue(
    metrics: &QueueMetrics,
    item: &QueueItem,
    latency: Duration,
    pushed: Result<(), Error>,
) {
    match pushed {
        Ok(()) => metrics.enqueued(latency),
        Err(err) => {
            warn!("dropping queue item {id}: {err}", id = item.identifier);
            metrics.error(QueueOperation::Enqueue);
        }
    }
}

/// Decode one `BLPOP` reply. Transport and decoding failures are counted
/// and look like an empty queue.
fn settle_dequeue(
    metrics: &QueueMetrics,
    latency: Duration,
    popped: Result<Option<String>, Error>,
) -> Option<QueueItem> {
    match popped.and_then(|raw| raw.as_deref().map(decode_item).transpose()) {
        Ok(Some(item)) => {
            metrics.dequeued(latency);
            Some(item)
        }
        Ok(None) => None,
        Err(err) => {
            warn!("failed to dequeue: {err}");
            metrics.error(QueueOperation::Dequeue);
            None
        }
    }
}

#[async_trait]
impl Queue for Redis {
    async fn enqueue(&self, item: QueueItem) {
        let start = Instant::now();
        let pushed = self.try_enqueue(&item).await;
        settle_enqueue(&self.metrics, &item, start.elapsed(), pushed);
    }

    async fn dequeue(&self) -> Option<QueueItem> {
        let start = Instant::now();
        let popped = self.try_dequeue().await;
        settle_dequeue(&self.metrics, start.elapsed(), popped)
    }

    async fn head(&self) -> Result<Option<QueueItem>, Error> {
        let raw: Vec<String> = self.pool.lrange(&self.key, 0, 0).await?;
        raw.first().map(|raw| decode_item(raw)).transpose()
    }

    async fn size(&self) -> Result<usize, Error> {
        let len: u64 = self.pool.llen(&self.key).await?;
        Ok(usize::try_from(len).unwrap_or(usize::MAX))
    }
}
