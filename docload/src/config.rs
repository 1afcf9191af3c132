//! The docload run configuration.
//!
//! A single YAML document describes the run: its length, the writer and
//! reader pools, the database under load, the queue backend, the template
//! and where telemetry goes. Every field has a default, so `{}` is a valid
//! configuration. [`Config::from_yaml`] rejects runs that could do no work
//! before anything connects.

use std::{num::NonZeroUsize, time::Duration};

use serde::Deserialize;

use crate::{queue, target::mongo, telemetry, template};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// The run would last no time at all.
    #[error("duration_seconds must be greater than zero")]
    ZeroDuration,
    /// The run would start no workers.
    #[error("at least one writer or reader is required")]
    NoWorkers,
    /// The push gateway would be pushed to continuously.
    #[error("push_gateway.frequency_seconds must be greater than zero")]
    ZeroPushFrequency,
}

fn default_duration_seconds() -> u64 {
    30
}

fn default_writers() -> usize {
    20
}

fn default_readers() -> usize {
    4
}

fn default_batch_size() -> NonZeroUsize {
    NonZeroUsize::MIN
}

fn default_document_channel_capacity() -> NonZeroUsize {
    NonZeroUsize::MIN.saturating_add(9)
}

fn default_empty_queue_backoff_milliseconds() -> u64 {
    1_000
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// How long the load runs, in seconds.
    #[serde(default = "default_duration_seconds")]
    pub duration_seconds: u64,
    /// Number of writer tasks.
    #[serde(default = "default_writers")]
    pub writers: usize,
    /// Number of reader tasks.
    #[serde(default = "default_readers")]
    pub readers: usize,
    /// Documents per insert. One uses single-document inserts.
    #[serde(default = "default_batch_size")]
    pub batch_size: NonZeroUsize,
    /// Capacity of the channel between the document source and the writers.
    #[serde(default = "default_document_channel_capacity")]
    pub document_channel_capacity: NonZeroUsize,
    /// How long a reader waits between polls of an empty queue.
    #[serde(default = "default_empty_queue_backoff_milliseconds")]
    pub empty_queue_backoff_milliseconds: u64,
    /// The database under load.
    #[serde(default)]
    pub mongodb: mongo::Config,
    /// Where inserted identifiers wait to be read.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub queue: queue::Config,
    /// The document template. A built-in template is used when unset.
    #[serde(default)]
    pub template: Option<template::Config>,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: telemetry::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            duration_seconds: default_duration_seconds(),
            writers: default_writers(),
            readers: default_readers(),
            batch_size: default_batch_size(),
            document_channel_capacity: default_document_channel_capacity(),
            empty_queue_backoff_milliseconds: default_empty_queue_backoff_milliseconds(),
            mongodb: mongo::Config::default(),
            queue: queue::Config::default(),
            template: None,
            telemetry: telemetry::Config::default(),
        }
    }
}

impl Config {
    /// Parse and validate YAML configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `contents` does not deserialize or fails
    /// [`Config::validate`].
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.duration_seconds == 0 {
            return Err(Error::ZeroDuration);
        }
        if self.writers == 0 && self.readers == 0 {
            return Err(Error::NoWorkers);
        }
        let push_gateway = self.telemetry.push_gateway.as_ref();
        if push_gateway.is_some_and(|push| push.frequency_seconds == 0) {
            return Err(Error::ZeroPushFrequency);
        }
        Ok(())
    }

    /// How long the load runs.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }
}
