//! The MongoDB [`Target`].
//!
//! Documents travel through docload as raw BSON and are handed to the driver
//! as `RawDocumentBuf` without re-parsing. Inserted `_id` values are reported
//! as ObjectId hex strings; reads parse them back.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use mongodb::{
    Client, Collection,
    bson::{self, Bson, RawDocumentBuf, doc, oid::ObjectId},
    options::{
        Acknowledgment, ClientOptions, ReadPreference as DriverReadPreference, SelectionCriteria,
        WriteConcern,
    },
};
use serde::Deserialize;
use tracing::info;

use super::{Error, Target};
use crate::{
    document::Document,
    source::{self, Render},
    template::Template,
};

fn default_connection_string() -> String {
    "mongodb://127.0.0.1:27017".to_string()
}

fn default_database() -> String {
    "loadtest".to_string()
}

fn default_collection() -> String {
    "samples".to_string()
}

fn default_write_journal() -> bool {
    true
}

fn default_write_acks() -> u32 {
    1
}

fn default_max_pool_size() -> u32 {
    100
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_operation_timeout_milliseconds() -> u64 {
    1_000
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
/// Which replica set members serve reads.
pub enum ReadPreference {
    /// Only the primary.
    #[default]
    Primary,
    /// The primary when available, otherwise a secondary.
    PrimaryPreferred,
    /// Only secondaries.
    Secondary,
    /// A secondary when available, otherwise the primary.
    SecondaryPreferred,
    /// The member with the lowest latency.
    Nearest,
}

impl From<ReadPreference> for DriverReadPreference {
    fn from(preference: ReadPreference) -> Self {
        match preference {
            ReadPreference::Primary => DriverReadPreference::Primary,
            ReadPreference::PrimaryPreferred => {
                DriverReadPreference::PrimaryPreferred { options: None }
            }
            ReadPreference::Secondary => DriverReadPreference::Secondary { options: None },
            ReadPreference::SecondaryPreferred => {
                DriverReadPreference::SecondaryPreferred { options: None }
            }
            ReadPreference::Nearest => DriverReadPreference::Nearest { options: None },
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Configuration for [`Mongo`].
pub struct Config {
    /// A `mongodb://` or `mongodb+srv://` connection string.
    #[serde(default = "default_connection_string")]
    pub connection_string: String,
    /// Database documents are written to.
    #[serde(default = "default_database")]
    pub database: String,
    /// Collection documents are written to.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Read preference for point reads.
    #[serde(default)]
    pub read_preference: ReadPreference,
    /// Require inserts to be journaled before acknowledgement.
    #[serde(default = "default_write_journal")]
    pub write_journal: bool,
    /// Number of members that must acknowledge an insert. Zero disables
    /// acknowledgement.
    #[serde(default = "default_write_acks")]
    pub write_acks: u32,
    /// Maximum connections in the driver's pool.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    /// Timeout for establishing a connection.
    #[serde(default = "default_timeout_seconds")]
    pub connection_timeout_seconds: u64,
    /// Timeout for selecting a server.
    #[serde(default = "default_timeout_seconds")]
    pub server_selection_timeout_seconds: u64,
    /// Timeout applied to every insert and read.
    #[serde(default = "default_operation_timeout_milliseconds")]
    pub operation_timeout_milliseconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_string: default_connection_string(),
            database: default_database(),
            collection: default_collection(),
            read_preference: ReadPreference::default(),
            write_journal: default_write_journal(),
            write_acks: default_write_acks(),
            max_pool_size: default_max_pool_size(),
            connection_timeout_seconds: default_timeout_seconds(),
            server_selection_timeout_seconds: default_timeout_seconds(),
            operation_timeout_milliseconds: default_operation_timeout_milliseconds(),
        }
    }
}

impl Config {
    fn write_concern(&self) -> WriteConcern {
        let mut concern = WriteConcern::default();
        concern.w = Some(Acknowledgment::Nodes(self.write_acks));
        // A journaled write must be acknowledged.
        concern.journal = Some(self.write_journal && self.write_acks > 0);
        concern
    }
}

/// A connected MongoDB collection.
#[derive(Debug, Clone)]
pub struct Mongo {
    collection: Collection<RawDocumentBuf>,
    operation_timeout: Duration,
}

impl Mongo {
    /// Connect to the configured deployment and confirm it answers a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is invalid or the
    /// deployment cannot be reached.
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let mut options = ClientOptions::parse(config.connection_string.as_str()).await?;
        options.app_name = Some(format!("docload {}", env!("CARGO_PKG_VERSION")));
        options.max_pool_size = Some(config.max_pool_size);
        options.connect_timeout = Some(Duration::from_secs(config.connection_timeout_seconds));
        options.server_selection_timeout =
            Some(Duration::from_secs(config.server_selection_timeout_seconds));
        options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            config.read_preference.into(),
        ));
        options.write_concern = Some(config.write_concern());

        let client = Client::with_options(options)?;
        let database = client.database(&config.database);
        database.run_command(doc! { "ping": 1 }).await?;
        info!(
            database = %config.database,
            collection = %config.collection,
            "connected to mongodb"
        );

        Ok(Self {
            collection: database.collection(&config.collection),
            operation_timeout: Duration::from_millis(config.operation_timeout_milliseconds),
        })
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>> + Send,
    {
        tokio::time::timeout(self.operation_timeout, operation)
            .await
            .map_err(|_| Error::Timeout(self.operation_timeout))?
    }
}

/// Normalize an inserted `_id` into the string stored in a queue item.
#[must_use]
pub fn identifier(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn raw(document: &Document) -> Result<RawDocumentBuf, Error> {
    Ok(RawDocumentBuf::from_bytes(document.as_bytes().to_vec())?)
}

#[async_trait]
impl Target for Mongo {
    async fn insert_one(&self, document: &Document) -> Result<String, Error> {
        let document = raw(document)?;
        self.bounded(async {
            let result = self.collection.insert_one(&document).await?;
            Ok(identifier(&result.inserted_id))
        })
        .await
    }

    async fn insert_many(&self, documents: &[Document]) -> Result<Vec<String>, Error> {
        let documents = documents.iter().map(raw).collect::<Result<Vec<_>, _>>()?;
        self.bounded(async {
            let result = self.collection.insert_many(&documents).await?;
            let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
            ids.sort_unstable_by_key(|(idx, _)| *idx);
            Ok(ids.iter().map(|(_, id)| identifier(id)).collect())
        })
        .await
    }

    async fn read_one(&self, id: &str) -> Result<Document, Error> {
        let oid = ObjectId::parse_str(id).map_err(|_| Error::InvalidIdentifier(id.to_string()))?;
        self.bounded(async {
            match self.collection.find_one(doc! { "_id": oid }).await? {
                Some(found) => Ok(Document::new(found.into_bytes())),
                None => Err(Error::NotFound(id.to_string())),
            }
        })
        .await
    }
}

/// Convert a JSON document, extended JSON included, into a BSON [`Document`].
///
/// # Errors
///
/// Returns an error if `json` is not a JSON object or holds malformed
/// extended JSON.
pub fn encode(json: &str) -> Result<Document, Error> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    match Bson::try_from(value)? {
        Bson::Document(document) => Ok(Document::new(bson::to_vec(&document)?)),
        _ => Err(Error::NotADocument),
    }
}

/// Renders a [`Template`] to JSON text and encodes it as BSON.
#[derive(Debug)]
pub struct BsonTemplate(pub Template);

impl Render for BsonTemplate {
    fn render(&mut self) -> Result<Document, source::Error> {
        let json = self.0.render()?;
        Ok(encode(&json)?)
    }
}

#[cfg(test)]
mod test {
    use mongodb::bson::{Bson, RawDocumentBuf, oid::ObjectId};

    use super::{BsonTemplate, Config, encode, identifier};
    use crate::{source::Render, target::Error, template::Template};

    #[test]
    fn object_ids_become_hex() {
        let oid = ObjectId::new();
        assert_eq!(identifier(&Bson::ObjectId(oid)), oid.to_hex());
        assert_eq!(identifier(&Bson::String("custom".to_string())), "custom");
        assert_eq!(identifier(&Bson::Int32(7)), "7");
    }

    #[test]
    fn encode_understands_extended_json() {
        let document = encode(r#"{"n": 1, "at": {"$date": {"$numberLong": "1700000000000"}}}"#)
            .expect("encode");
        let raw = RawDocumentBuf::from_bytes(document.as_bytes().to_vec()).expect("valid bson");
        let at = raw.get("at").expect("lookup").expect("field present");
        assert!(at.as_datetime().is_some());
        assert_eq!(raw.get_i32("n").expect("n"), 1);
    }

    #[test]
    fn encode_rejects_non_documents() {
        assert!(matches!(encode("[1, 2]"), Err(Error::NotADocument)));
        assert!(matches!(encode("{"), Err(Error::Json(_))));
    }

    #[test]
    fn bson_template_renders_valid_documents() {
        let template = Template::from_config(None).expect("builtin template");
        let mut renderer = BsonTemplate(template);
        for _ in 0..4 {
            let document = renderer.render().expect("render");
            let raw = RawDocumentBuf::from_bytes(document.as_bytes().to_vec()).expect("valid bson");
            assert!(raw.get("created").expect("lookup").is_some());
        }
    }

    #[test]
    fn config_defaults() {
        let config: Config = serde_yaml::from_str("database: perf\n").expect("parse");
        assert_eq!(config.database, "perf");
        assert_eq!(config.collection, "samples");
        assert_eq!(config.connection_string, "mongodb://127.0.0.1:27017");
        assert_eq!(config.max_pool_size, 100);
        assert_eq!(config.operation_timeout_milliseconds, 1_000);
        assert!(config.write_journal);
    }

    #[test]
    fn unacknowledged_writes_are_not_journaled() {
        let config = Config {
            write_acks: 0,
            ..Config::default()
        };
        assert_eq!(config.write_concern().journal, Some(false));
        assert_eq!(Config::default().write_concern().journal, Some(true));
    }
}
