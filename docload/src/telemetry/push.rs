//! Periodic export of [`Telemetry`] to a Prometheus push gateway.
//!
//! Pushes use `POST`, adding to whatever the gateway holds for this job and
//! instance rather than replacing it. A failed push is logged and counted,
//! never fatal. One last push is made when the shutdown signal arrives so the
//! gateway sees the final counts.

use std::{sync::Arc, time::Duration};

use docload_signal::Watcher;
use serde::Deserialize;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Telemetry;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(thiserror::Error, Debug)]
/// Errors produced by a single push.
pub enum Error {
    /// The request could not be sent or the gateway refused it.
    #[error("push failed: {0}")]
    Http(#[from] reqwest::Error),
}

fn default_server() -> String {
    "127.0.0.1:9091".to_string()
}

fn default_job() -> String {
    "docload".to_string()
}

fn default_frequency_seconds() -> u64 {
    30
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Configuration for [`Pusher`].
pub struct Config {
    /// Address of the push gateway. A scheme of `http://` is assumed when
    /// none is given.
    #[serde(default = "default_server")]
    pub server: String,
    /// Job name metrics are grouped under.
    #[serde(default = "default_job")]
    pub job: String,
    /// Seconds between pushes.
    #[serde(default = "default_frequency_seconds")]
    pub frequency_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            job: default_job(),
            frequency_seconds: default_frequency_seconds(),
        }
    }
}

impl Config {
    /// The gateway URI pushes for `instance` are sent to.
    #[must_use]
    pub fn uri(&self, instance: &str) -> String {
        let server = self.server.trim_end_matches('/');
        if server.starts_with("http://") || server.starts_with("https://") {
            format!("{server}/metrics/job/{}/instance/{instance}", self.job)
        } else {
            format!("http://{server}/metrics/job/{}/instance/{instance}", self.job)
        }
    }
}

/// Pushes rendered telemetry on a fixed period until shutdown.
#[derive(Debug)]
pub struct Pusher {
    client: reqwest::Client,
    uri: String,
    frequency: Duration,
    telemetry: Arc<Telemetry>,
    shutdown: Watcher,
}

impl Pusher {
    /// Create a new [`Pusher`] grouping its pushes under `instance`.
    #[must_use]
    pub fn new(
        config: &Config,
        instance: &str,
        telemetry: Arc<Telemetry>,
        shutdown: Watcher,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            uri: config.uri(instance),
            frequency: Duration::from_secs(config.frequency_seconds.max(1)),
            telemetry,
            shutdown,
        }
    }

    /// Run this [`Pusher`] to completion.
    ///
    /// Returns after the final push that follows the shutdown signal.
    pub async fn run(self) {
        let Self {
            client,
            uri,
            frequency,
            telemetry,
            shutdown,
        } = self;
        info!(uri = %uri, frequency = ?frequency, "pushing telemetry");

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);

        let mut ticks = time::interval_at(Instant::now() + frequency, frequency);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    push_or_warn(&client, &uri, &telemetry).await;
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received, making final push");
                    push_or_warn(&client, &uri, &telemetry).await;
                    return;
                }
            }
        }
    }
}

async fn push_or_warn(client: &reqwest::Client, uri: &str, telemetry: &Telemetry) {
    if let Err(err) = push(client, uri, telemetry).await {
        warn!("failed to push telemetry to {uri}: {err}");
        telemetry.push_failed();
    }
}

async fn push(client: &reqwest::Client, uri: &str, telemetry: &Telemetry) -> Result<(), Error> {
    let body = telemetry.render();
    client
        .post(uri)
        .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
        .body(body)
        .timeout(Duration::from_secs(5))
        .send()
        .await?
        .error_for_status()?;
    debug!("pushed telemetry to {uri}");
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use warp::Filter;

    use super::{Config, Pusher};
    use crate::{
        document::{OperationKind, OperationResult},
        telemetry::{self, Telemetry},
    };

    #[test]
    fn uri_assumes_http() {
        let config = Config::default();
        assert_eq!(
            config.uri("host-a"),
            "http://127.0.0.1:9091/metrics/job/docload/instance/host-a"
        );

        let config = Config {
            server: "https://gateway.example/".to_string(),
            job: "nightly".to_string(),
            frequency_seconds: 1,
        };
        assert_eq!(
            config.uri("host-b"),
            "https://gateway.example/metrics/job/nightly/instance/host-b"
        );
    }

    #[tokio::test]
    async fn final_push_on_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, String, Bytes)>();
        let route = warp::post()
            .and(warp::path!("metrics" / "job" / String / "instance" / String))
            .and(warp::body::bytes())
            .map(move |job: String, instance: String, body: Bytes| {
                let _ = tx.send((job, instance, body));
                warp::reply()
            });
        let (addr, serve_fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve_fut);

        let telemetry = Arc::new(Telemetry::new(&telemetry::Config::default()));
        telemetry.record(&OperationResult {
            kind: OperationKind::Insert,
            duration: Duration::from_millis(2),
            document_count: 1,
            success: true,
        });

        let config = Config {
            server: addr.to_string(),
            job: "docload".to_string(),
            frequency_seconds: 3600,
        };
        let (watcher, broadcaster) = docload_signal::signal();
        let pusher = Pusher::new(&config, "host-a", Arc::clone(&telemetry), watcher);
        let handle = tokio::spawn(pusher.run());

        broadcaster.signal_and_wait().await;
        handle.await.expect("pusher panicked");

        let (job, instance, body) = rx.recv().await.expect("no push received");
        assert_eq!(job, "docload");
        assert_eq!(instance, "host-a");
        let body = String::from_utf8(body.to_vec()).expect("body not utf8");
        assert!(body.contains("docload_documents_total"));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_counted_not_fatal() {
        let telemetry = Arc::new(Telemetry::new(&telemetry::Config::default()));
        // Nothing listens on port 9 of the loopback interface in a test run.
        let config = Config {
            server: "127.0.0.1:9".to_string(),
            job: "docload".to_string(),
            frequency_seconds: 3600,
        };
        let (watcher, broadcaster) = docload_signal::signal();
        let pusher = Pusher::new(&config, "host-a", Arc::clone(&telemetry), watcher);
        let handle = tokio::spawn(pusher.run());

        broadcaster.signal_and_wait().await;
        handle.await.expect("pusher panicked");

        let rendered = telemetry.render();
        let failures = rendered
            .lines()
            .find(|line| line.starts_with("docload_push_failure_total"))
            .expect("push failure series missing");
        assert!(failures.ends_with(" 1"), "{failures}");
    }
}
