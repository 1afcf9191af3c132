//! The values that flow through a load run.
//!
//! A [`Document`] moves from the source to the writers, a [`QueueItem`] from
//! the writers to the readers and an [`OperationResult`] from every worker to
//! telemetry.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A serialized document in the target database's native encoding.
///
/// Cloning is cheap, the bytes are reference counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Document(Bytes);

impl Document {
    /// Wrap already-encoded bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the encoding, in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the encoding is zero bytes long.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A record of a previously inserted document, retained to drive reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueItem {
    /// The inserted document's key, as returned by the target.
    pub identifier: String,
    /// The instance that performed the insert.
    pub origin: String,
    /// Unix epoch nanoseconds at which the item was created.
    pub timestamp: i64,
}

impl QueueItem {
    /// Create an item stamped with the current time.
    #[must_use]
    pub fn new(identifier: impl Into<String>, origin: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
        Self {
            identifier: identifier.into(),
            origin: origin.into(),
            timestamp,
        }
    }
}

/// The kinds of operation docload performs against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// A single or batch insert.
    Insert,
    /// A point read by identifier.
    Read,
}

impl OperationKind {
    /// The label value used for this kind in telemetry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of exactly one attempted call against the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationResult {
    /// What was attempted.
    pub kind: OperationKind,
    /// How long the call took, success or not.
    pub duration: Duration,
    /// Documents carried by the call. Greater than one for batch inserts.
    pub document_count: u64,
    /// Whether the target reported success.
    pub success: bool,
}

impl OperationResult {
    /// The call duration in fractional seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{OperationKind, OperationResult, QueueItem};

    #[test]
    fn queue_item_is_stamped_with_current_time() {
        let item = QueueItem::new("5f1d7c0e9b1e8a3d4c2b1a09", "host-a");
        assert_eq!(item.identifier, "5f1d7c0e9b1e8a3d4c2b1a09");
        assert_eq!(item.origin, "host-a");
        // 2020-01-01 in nanoseconds; anything earlier means the clock read failed.
        assert!(item.timestamp > 1_577_836_800_000_000_000);
    }

    #[test]
    fn duration_seconds_is_fractional() {
        let result = OperationResult {
            kind: OperationKind::Read,
            duration: Duration::from_millis(1500),
            document_count: 1,
            success: true,
        };
        assert!((result.duration_seconds() - 1.5).abs() < f64::EPSILON);
        assert_eq!(result.kind.to_string(), "read");
    }
}
