//! Document templates.
//!
//! A template is a JSON document. Any string value that is exactly a
//! `{{ ... }}` placeholder is replaced with generated data on every render,
//! everything else is copied through unchanged:
//!
//! * `{{uuid}}`: a random UUID v4 string
//! * `{{int MIN MAX}}`: an integer in `[MIN, MAX]`
//! * `{{float MIN MAX}}`: a float in `[MIN, MAX)`
//! * `{{bool}}`: a boolean
//! * `{{string LEN}}`: an alphanumeric string of length `LEN`
//! * `{{choice A B ...}}`: one of the given words
//! * `{{now}}`: the current time as an extended JSON `$date`
//! * `{{hostname}}`: this host's name, fixed at load time
//!
//! Placeholders are compiled when the template is loaded so a typo fails the
//! run before any load is generated.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::{Rng, SeedableRng, distr::Alphanumeric, rngs::StdRng};
use serde::Deserialize;
use serde_json::{Map, Value, json};

const BUILTIN_NAME: &str = "builtin";
const BUILTIN: &str = r#"{
    "session": "{{uuid}}",
    "hostname": "{{hostname}}",
    "created": "{{now}}",
    "sequence": "{{int 0 1000000000}}",
    "score": "{{float 0 1}}",
    "active": "{{bool}}",
    "region": "{{choice us-east-1 us-west-2 eu-central-1 ap-southeast-2}}",
    "payload": "{{string 256}}",
    "tags": ["load", "{{choice alpha beta gamma}}"]
}"#;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Template`].
pub enum Error {
    /// The template file could not be read.
    #[error("failed to read template {path:?}: {source}")]
    Io {
        /// Template path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// The template is not valid JSON, or a render could not be serialized.
    #[error("template {name} is not valid JSON: {source}")]
    Json {
        /// Template name
        name: String,
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },
    /// A placeholder could not be compiled.
    #[error("template {name}: invalid placeholder {placeholder:?}: {reason}")]
    Placeholder {
        /// Template name
        name: String,
        /// The offending placeholder, braces included
        placeholder: String,
        /// What is wrong with it
        reason: &'static str,
    },
    /// The rendered document is not a JSON object.
    #[error("template {0} must be a JSON object")]
    NotAnObject(String),
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Configuration for loading a [`Template`].
pub struct Config {
    /// Path to the template file.
    pub path: PathBuf,
    /// Seed for the template's random source. Renders are deterministic when
    /// set.
    #[serde(default)]
    pub seed: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq)]
enum Generator {
    Uuid,
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Bool,
    String { len: usize },
    Choice(Vec<String>),
    Now,
}

impl Generator {
    fn generate<R: Rng>(&self, rng: &mut R) -> Value {
        match self {
            Generator::Uuid => {
                Value::String(uuid::Builder::from_random_bytes(rng.random()).into_uuid().to_string())
            }
            Generator::Int { min, max } => Value::from(rng.random_range(*min..=*max)),
            Generator::Float { min, max } => Value::from(rng.random_range(*min..*max)),
            Generator::Bool => Value::Bool(rng.random()),
            Generator::String { len } => Value::String(
                (0..*len)
                    .map(|_| char::from(rng.sample(Alphanumeric)))
                    .collect(),
            ),
            Generator::Choice(choices) => {
                let idx = rng.random_range(0..choices.len());
                Value::String(choices[idx].clone())
            }
            Generator::Now => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_millis());
                json!({ "$date": { "$numberLong": millis.to_string() } })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Object(Vec<(String, Node)>),
    Array(Vec<Node>),
    Generator(Generator),
}

impl Node {
    fn render<R: Rng>(&self, rng: &mut R) -> Value {
        match self {
            Node::Literal(value) => value.clone(),
            Node::Object(fields) => {
                let mut map = Map::with_capacity(fields.len());
                for (key, node) in fields {
                    map.insert(key.clone(), node.render(rng));
                }
                Value::Object(map)
            }
            Node::Array(nodes) => Value::Array(nodes.iter().map(|n| n.render(rng)).collect()),
            Node::Generator(generator) => generator.generate(rng),
        }
    }
}

struct Compiler<'a> {
    name: &'a str,
    hostname: String,
}

impl Compiler<'_> {
    fn invalid(&self, placeholder: &str, reason: &'static str) -> Error {
        Error::Placeholder {
            name: self.name.to_string(),
            placeholder: placeholder.to_string(),
            reason,
        }
    }

    fn compile(&self, value: Value) -> Result<Node, Error> {
        match value {
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (key, value) in map {
                    fields.push((key, self.compile(value)?));
                }
                Ok(Node::Object(fields))
            }
            Value::Array(values) => Ok(Node::Array(
                values
                    .into_iter()
                    .map(|v| self.compile(v))
                    .collect::<Result<_, _>>()?,
            )),
            Value::String(s) => match s.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
                Some(inner) => self.placeholder(&s, inner),
                None => Ok(Node::Literal(Value::String(s))),
            },
            literal => Ok(Node::Literal(literal)),
        }
    }

    fn placeholder(&self, raw: &str, inner: &str) -> Result<Node, Error> {
        let mut words = inner.split_whitespace();
        let Some(kind) = words.next() else {
            return Err(self.invalid(raw, "empty placeholder"));
        };
        let args: Vec<&str> = words.collect();

        let generator = match (kind, args.as_slice()) {
            ("uuid", []) => Generator::Uuid,
            ("bool", []) => Generator::Bool,
            ("now", []) => Generator::Now,
            ("hostname", []) => return Ok(Node::Literal(Value::String(self.hostname.clone()))),
            ("int", [min, max]) => {
                let min: i64 = min.parse().map_err(|_| self.invalid(raw, "MIN is not an integer"))?;
                let max: i64 = max.parse().map_err(|_| self.invalid(raw, "MAX is not an integer"))?;
                if min > max {
                    return Err(self.invalid(raw, "MIN is greater than MAX"));
                }
                Generator::Int { min, max }
            }
            ("float", [min, max]) => {
                let min: f64 = min.parse().map_err(|_| self.invalid(raw, "MIN is not a number"))?;
                let max: f64 = max.parse().map_err(|_| self.invalid(raw, "MAX is not a number"))?;
                // A span that overflows f64 cannot be sampled.
                if !(max - min).is_finite() || min >= max {
                    return Err(self.invalid(raw, "range must be finite with MIN below MAX"));
                }
                Generator::Float { min, max }
            }
            ("string", [len]) => {
                let len = len.parse().map_err(|_| self.invalid(raw, "LEN is not a length"))?;
                Generator::String { len }
            }
            ("choice", choices) if !choices.is_empty() => {
                Generator::Choice(choices.iter().map(ToString::to_string).collect())
            }
            ("uuid" | "bool" | "now" | "hostname" | "int" | "float" | "string" | "choice", _) => {
                return Err(self.invalid(raw, "wrong number of arguments"));
            }
            _ => return Err(self.invalid(raw, "unknown placeholder")),
        };
        Ok(Node::Generator(generator))
    }
}

/// A compiled template and its random source.
#[derive(Debug)]
pub struct Template {
    name: String,
    root: Node,
    rng: StdRng,
}

impl Template {
    /// Load and compile the template at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not compile.
    pub fn from_path(path: &Path, seed: Option<[u8; 32]>) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&path.display().to_string(), &contents, seed)
    }

    /// Load the configured template, or the built-in one when none is set.
    ///
    /// # Errors
    ///
    /// See [`Template::from_path`].
    pub fn from_config(config: Option<&Config>) -> Result<Self, Error> {
        match config {
            Some(config) => Self::from_path(&config.path, config.seed),
            None => Self::parse(BUILTIN_NAME, BUILTIN, None),
        }
    }

    /// Compile `contents` as a template called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if `contents` is not a JSON object or holds an
    /// invalid placeholder.
    pub fn parse(name: &str, contents: &str, seed: Option<[u8; 32]>) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(contents).map_err(|source| Error::Json {
            name: name.to_string(),
            source,
        })?;
        if !value.is_object() {
            return Err(Error::NotAnObject(name.to_string()));
        }
        let compiler = Compiler {
            name,
            hostname: crate::hostname(),
        };
        let root = compiler.compile(value)?;
        let rng = match seed {
            Some(seed) => StdRng::from_seed(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            name: name.to_string(),
            root,
            rng,
        })
    }

    /// The template's name, its path when loaded from a file.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn render_value(&mut self) -> Value {
        self.root.render(&mut self.rng)
    }

    /// Render a fresh document as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the rendered document cannot be serialized.
    pub fn render(&mut self) -> Result<String, Error> {
        let value = self.render_value();
        serde_json::to_string(&value).map_err(|source| Error::Json {
            name: self.name.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use proptest::prelude::*;
    use serde_json::Value;

    use super::{Error, Template};

    const SEED: [u8; 32] = [7; 32];

    fn render(contents: &str) -> Value {
        Template::parse("test", contents, Some(SEED))
            .expect("template did not compile")
            .render_value()
    }

    #[test]
    fn builtin_template_compiles_and_renders() {
        let mut template = Template::from_config(None).expect("builtin template");
        assert_eq!(template.name(), "builtin");
        let value = template.render_value();
        assert_eq!(value["payload"].as_str().map(str::len), Some(256));
        assert!(value["created"]["$date"]["$numberLong"].is_string());
        assert_eq!(value["tags"][0], "load");
    }

    #[test]
    fn literals_pass_through() {
        let value = render(r#"{"a": "plain", "b": 3, "c": null, "d": "{{ not closed"}"#);
        assert_eq!(value["a"], "plain");
        assert_eq!(value["b"], 3);
        assert!(value["c"].is_null());
        assert_eq!(value["d"], "{{ not closed");
    }

    #[test]
    fn placeholders_render_their_kinds() {
        let value = render(
            r#"{"id": "{{uuid}}", "n": "{{int 5 5}}", "f": "{{float 1 2}}", "b": "{{bool}}",
                "s": "{{string 12}}", "c": "{{choice red}}", "nested": [{"x": "{{int -3 -3}}"}]}"#,
        );
        assert_eq!(value["id"].as_str().map(str::len), Some(36));
        assert_eq!(value["n"], 5);
        let f = value["f"].as_f64().expect("float");
        assert!((1.0..2.0).contains(&f));
        assert!(value["b"].is_boolean());
        let s = value["s"].as_str().expect("string");
        assert_eq!(s.len(), 12);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(value["c"], "red");
        assert_eq!(value["nested"][0]["x"], -3);
    }

    #[test]
    fn seeded_renders_are_deterministic() {
        let contents = r#"{"id": "{{uuid}}", "n": "{{int 0 1000000}}", "s": "{{string 32}}"}"#;
        let mut a = Template::parse("a", contents, Some(SEED)).expect("compile");
        let mut b = Template::parse("b", contents, Some(SEED)).expect("compile");
        for _ in 0..10 {
            assert_eq!(a.render().expect("render"), b.render().expect("render"));
        }
    }

    #[test]
    fn invalid_placeholders_fail_at_load() {
        for bad in [
            "{{}}",
            "{{unknown}}",
            "{{int 1}}",
            "{{int 9 1}}",
            "{{int one 2}}",
            "{{float 2 2}}",
            "{{float -1e308 1e308}}",
            "{{float 0 inf}}",
            "{{string -1}}",
            "{{choice}}",
            "{{uuid extra}}",
        ] {
            let contents = format!(r#"{{"field": "{bad}"}}"#);
            match Template::parse("bad", &contents, None) {
                Err(Error::Placeholder { placeholder, .. }) => assert_eq!(placeholder, bad),
                other => panic!("{bad} compiled: {other:?}"),
            }
        }
    }

    #[test]
    fn top_level_must_be_an_object() {
        assert!(matches!(
            Template::parse("array", "[1, 2]", None),
            Err(Error::NotAnObject(_))
        ));
        assert!(matches!(
            Template::parse("broken", "{", None),
            Err(Error::Json { .. })
        ));
    }

    #[test]
    fn loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"kind": "{{{{choice a}}}}"}}"#).expect("write template");
        let mut template = Template::from_path(file.path(), None).expect("load");
        assert_eq!(template.render_value()["kind"], "a");
    }

    proptest! {
        #[test]
        fn ints_stay_in_range(min in -1_000_000i64..1_000_000, span in 0i64..1_000_000, seed: [u8; 32]) {
            let max = min + span;
            let contents = format!(r#"{{"n": "{{{{int {min} {max}}}}}"}}"#);
            let mut template = Template::parse("range", &contents, Some(seed)).expect("compile");
            for _ in 0..8 {
                let n = template.render_value()["n"].as_i64().expect("integer");
                prop_assert!((min..=max).contains(&n));
            }
        }
    }
}
