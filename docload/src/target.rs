//! The database under load.
//!
//! Workers see the database only through [`Target`]. The one production
//! implementation is [`mongo::Mongo`].

pub mod mongo;

use std::time::Duration;

use async_trait::async_trait;

use crate::document::Document;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Target`] implementations.
pub enum Error {
    /// The driver reported an error.
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    /// The operation did not complete within the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// An identifier could not be parsed into the database's key format.
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    /// No document has the requested identifier.
    #[error("no document with identifier {0}")]
    NotFound(String),
    /// Bytes handed to the target are not a valid document.
    #[error("invalid document: {0}")]
    InvalidDocument(#[from] mongodb::bson::raw::Error),
    /// Extended JSON could not be converted to BSON.
    #[error("invalid extended JSON: {0}")]
    ExtendedJson(#[from] mongodb::bson::extjson::de::Error),
    /// A BSON document could not be serialized.
    #[error("failed to serialize document: {0}")]
    Serialize(#[from] mongodb::bson::ser::Error),
    /// Text handed to the encoder is not JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The JSON value at the top level is not an object.
    #[error("top-level value is not a document")]
    NotADocument,
}

/// Operations docload performs against the database.
///
/// Implementations are shared by every worker and must be safe for
/// concurrent use.
#[async_trait]
pub trait Target: Send + Sync + std::fmt::Debug {
    /// Insert one document, returning its identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the database did not acknowledge the insert.
    async fn insert_one(&self, document: &Document) -> Result<String, Error>;

    /// Insert a batch, returning identifiers in batch order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database did not acknowledge the insert.
    async fn insert_many(&self, documents: &[Document]) -> Result<Vec<String>, Error>;

    /// Read the document with `identifier`.
    ///
    /// # Errors
    ///
    /// Returns an error if `identifier` is malformed, no such document
    /// exists or the read failed.
    async fn read_one(&self, identifier: &str) -> Result<Document, Error>;
}
