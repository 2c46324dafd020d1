//! Resolution job configuration.
//!
//! A job's `config_json` is parsed into [`ResolutionConfig`]: one canonical
//! camelCase name per option, unknown options rejected, and every option
//! validated before any record is touched. [`WorkerConfig`] carries the
//! process-level settings of the polling loop.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ConfigError;

/// Default similarity threshold for semantic matches.
pub const DEFAULT_THRESHOLD: f64 = 0.85;

/// Default record field embedded for semantic matching.
pub const DEFAULT_SEMANTIC_FIELD: &str = "name";

/// Default embedding model identifier echoed into provenance.
pub const DEFAULT_EMBEDDINGS_MODEL: &str = "BAAI/bge-small-en-v1.5";

/// Default sleep between polls that find no queued job.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Length of the hex config hash stored in provenance.
const CONFIG_HASH_LEN: usize = 16;

// ---------------------------------------------------------------------------
// ResolutionConfig
// ---------------------------------------------------------------------------

/// One source record to resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Caller-supplied id, or a generated UUIDv4 string when absent.
    pub source_record_id: String,
    pub keys: Map<String, Value>,
}

/// Validated configuration of one resolution job.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionConfig {
    pub records: Vec<SourceRecord>,
    /// Record fields compared lexically against entity names and identifiers.
    pub join_keys: Vec<String>,
    /// Record fields concatenated and embedded for similarity matching.
    /// Empty disables the semantic step.
    pub semantic_fields: Vec<String>,
    /// Minimum accepted similarity, inclusive.
    pub threshold: f64,
    /// Create a new entity when neither exact nor semantic matching succeeds.
    pub create_if_no_match: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    records: Option<Vec<RawRecord>>,
    #[serde(default)]
    join_keys: Option<Vec<String>>,
    #[serde(default)]
    semantic_fields: Option<Vec<String>>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    create_if_no_match: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    source_record_id: Option<RawRecordId>,
    #[serde(default)]
    keys: Option<Map<String, Value>>,
}

/// Record ids arrive as strings from most loaders and as numbers from some.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRecordId {
    Text(String),
    Number(serde_json::Number),
}

impl ResolutionConfig {
    /// Parse and validate a job's `config_json`.
    ///
    /// Accepts either a JSON object or a JSON string holding the serialized
    /// object (older submitters stored the config as text).
    pub fn from_job_json(config_json: &Value) -> Result<Self, ConfigError> {
        let object = unwrap_config_text(config_json)?;
        let raw: RawConfig = serde_json::from_value(object)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let join_keys = raw.join_keys.unwrap_or_default();
        let semantic_fields = raw
            .semantic_fields
            .unwrap_or_else(|| vec![DEFAULT_SEMANTIC_FIELD.to_string()]);
        let threshold = raw.threshold.unwrap_or(DEFAULT_THRESHOLD);
        let create_if_no_match = raw.create_if_no_match.unwrap_or(false);

        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidThreshold(threshold));
        }
        if join_keys.iter().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::BlankFieldName { field: "joinKeys" });
        }
        if semantic_fields.iter().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::BlankFieldName {
                field: "semanticFields",
            });
        }
        if join_keys.is_empty() && semantic_fields.is_empty() && !create_if_no_match {
            return Err(ConfigError::NoMatchStrategy);
        }

        let records = raw
            .records
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                Ok(SourceRecord {
                    source_record_id: record_id(index, record.source_record_id)?,
                    keys: record.keys.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            records,
            join_keys,
            semantic_fields,
            threshold,
            create_if_no_match,
        })
    }
}

fn unwrap_config_text(config_json: &Value) -> Result<Value, ConfigError> {
    match config_json {
        Value::String(text) => Ok(serde_json::from_str(text)?),
        other => Ok(other.clone()),
    }
}

fn record_id(index: usize, raw: Option<RawRecordId>) -> Result<String, ConfigError> {
    match raw {
        Some(RawRecordId::Text(text)) if !text.is_empty() => {
            if text.trim().is_empty() {
                return Err(ConfigError::InvalidRecordId {
                    index,
                    reason: "id is only whitespace".to_string(),
                });
            }
            Ok(text)
        }
        Some(RawRecordId::Number(n)) => Ok(n.to_string()),
        _ => Ok(Uuid::new_v4().to_string()),
    }
}

/// Stable hash of a job configuration for provenance.
///
/// The config is serialized exactly as Python's
/// `json.dumps(config, sort_keys=True)` does, so hashes recorded by either
/// implementation agree. Returns the first 16 hex chars of the SHA-256
/// digest. A config stored as JSON text hashes like its parsed form.
pub fn config_hash(config_json: &Value) -> Result<String, ConfigError> {
    let parsed = unwrap_config_text(config_json).unwrap_or_else(|_| config_json.clone());
    let canonical = canonical_json(&parsed)?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(CONFIG_HASH_LEN);
    Ok(hex)
}

/// Sorted-key JSON text with `", "` and `": "` separators and non-ASCII
/// escaped as `\uXXXX`.
fn canonical_json(value: &Value) -> Result<String, ConfigError> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PythonJsonFormatter);
    canonicalize(value).serialize(&mut ser)?;
    // Every byte written is ASCII
    Ok(String::from_utf8_lossy(&out).into_owned())
}

struct PythonJsonFormatter;

impl Formatter for PythonJsonFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_f64<W>(&mut self, writer: &mut W, value: f64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(python_float_repr(value).as_bytes())
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if (' '..='~').contains(&ch) {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Shortest round-trip digits laid out like Python's `repr(float)`: fixed
/// notation while the decimal point sits in `(-4, 16]`, otherwise
/// `d.ddde+XX`.
fn python_float_repr(value: f64) -> String {
    let sci = format!("{:e}", value.abs());
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let exp: i32 = exp.parse().unwrap_or(0);
    let decpt = exp + 1;
    let len = digits.len() as i32;

    let body = if -4 < decpt && decpt <= 16 {
        if decpt <= 0 {
            format!("0.{}{digits}", "0".repeat((-decpt) as usize))
        } else if decpt >= len {
            format!("{digits}{}.0", "0".repeat((decpt - len) as usize))
        } else {
            let (int, frac) = digits.split_at(decpt as usize);
            format!("{int}.{frac}")
        }
    } else {
        let (lead, rest) = digits.split_at(1);
        let frac = if rest.is_empty() {
            String::new()
        } else {
            format!(".{rest}")
        };
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{lead}{frac}e{sign}{:02}", exp.abs())
    };

    if value.is_sign_negative() {
        format!("-{body}")
    } else {
        body
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// Settings of one polling worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep after an idle poll or a failed job.
    pub poll_interval: Duration,
    /// Sleep after the claim itself fails (database unreachable).
    pub error_backoff: Duration,
    /// Running jobs older than this are failed as abandoned. `None` disables
    /// the sweep.
    pub stale_job_after: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_backoff: DEFAULT_POLL_INTERVAL,
            stale_job_after: None,
        }
    }
}
