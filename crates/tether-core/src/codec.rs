//! Rich-value codec.
//!
//! [`RichValue`] extends plain JSON with dates, binary payloads, ordered
//! maps with arbitrary keys, and sets. On the wire every extension is a
//! single-key tagged object:
//!
//! | Value | Wire form |
//! |---|---|
//! | date | `{"$date": "2026-01-01T00:00:00Z"}` |
//! | bytes | `{"$bytes": "<base64>"}` |
//! | map | `{"$map": [[k, v], ...]}` |
//! | set | `{"$set": [...]}` |
//!
//! Object keys that start with `$` are escaped by doubling the `$`, so a
//! plain object never collides with a tag.
//!
//! Binary payloads are transcoded on the blocking pool by
//! [`encode_async`]; [`contains_binary`] decides which path a value takes.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

const TAG_DATE: &str = "$date";
const TAG_BYTES: &str = "$bytes";
const TAG_MAP: &str = "$map";
const TAG_SET: &str = "$set";

/// Maximum nesting depth examined by [`contains_binary`].
pub const MAX_SCAN_DEPTH: usize = 8;

/// Maximum number of nodes examined by [`contains_binary`].
pub const MAX_SCAN_NODES: usize = 10_000;

/// Codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Text was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A tagged object carried a malformed payload.
    #[error("invalid {tag} value: {reason}")]
    InvalidTag {
        /// The tag (`$date`, `$bytes`, ...).
        tag: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// The blocking encode task failed.
    #[error("encode task failed: {0}")]
    Join(String),
}

/// A value that survives a round trip through the wire codec.
#[derive(Clone, Debug, PartialEq)]
pub enum RichValue {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(Number),
    /// JSON string.
    String(String),
    /// JSON array.
    Array(Vec<RichValue>),
    /// JSON object with string keys.
    Object(BTreeMap<String, RichValue>),
    /// UTC timestamp.
    Date(DateTime<Utc>),
    /// Binary payload.
    Bytes(Bytes),
    /// Ordered map with arbitrary keys.
    Map(Vec<(RichValue, RichValue)>),
    /// Set of values (order preserved as given).
    Set(Vec<RichValue>),
}

impl RichValue {
    /// Build a binary value.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::Bytes(data.into())
    }

    /// Convert plain JSON without interpreting `$` tags.
    pub fn from_plain(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from_plain).collect()),
            Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_plain(v)))
                    .collect(),
            ),
        }
    }

    /// Serialize any `serde` value into a plain rich value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Ok(Self::from_plain(serde_json::to_value(value)?))
    }

    /// Lossy conversion to plain JSON.
    ///
    /// Dates become RFC 3339 strings, bytes become base64 strings, maps
    /// become arrays of `[key, value]` pairs and sets become arrays.
    pub fn into_plain(self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(b),
            Self::Number(n) => Value::Number(n),
            Self::String(s) => Value::String(s),
            Self::Array(items) | Self::Set(items) => {
                Value::Array(items.into_iter().map(Self::into_plain).collect())
            }
            Self::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_plain()))
                    .collect(),
            ),
            Self::Date(d) => Value::String(format_date(&d)),
            Self::Bytes(b) => Value::String(STANDARD.encode(&b)),
            Self::Map(entries) => Value::Array(
                entries
                    .into_iter()
                    .map(|(k, v)| Value::Array(vec![k.into_plain(), v.into_plain()]))
                    .collect(),
            ),
        }
    }

    /// Deserialize into a typed value via the plain JSON form.
    pub fn deserialize_into<T: DeserializeOwned>(self) -> Result<T, CodecError> {
        Ok(serde_json::from_value(self.into_plain())?)
    }

    /// Object field lookup.
    pub fn get(&self, key: &str) -> Option<&RichValue> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// String contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer contents, if this is an integral number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Binary contents, if this is a bytes value.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Whether this is `null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for RichValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for RichValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<i32> for RichValue {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for RichValue {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for RichValue {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<&str> for RichValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for RichValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Bytes> for RichValue {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<DateTime<Utc>> for RichValue {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl From<Value> for RichValue {
    fn from(v: Value) -> Self {
        Self::from_plain(v)
    }
}

impl From<Vec<RichValue>> for RichValue {
    fn from(items: Vec<RichValue>) -> Self {
        Self::Array(items)
    }
}

impl<T: Into<RichValue>> From<Option<T>> for RichValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl Serialize for RichValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        to_json(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RichValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_json(value).map_err(serde::de::Error::custom)
    }
}

fn format_date(d: &DateTime<Utc>) -> String {
    d.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn escape_key(key: &str) -> String {
    if key.starts_with('$') {
        format!("${key}")
    } else {
        key.to_owned()
    }
}

fn unescape_key(key: String) -> String {
    if key.starts_with("$$") {
        key[1..].to_owned()
    } else {
        key
    }
}

fn tagged(tag: &str, payload: Value) -> Value {
    let mut map = Map::with_capacity(1);
    let _ = map.insert(tag.to_owned(), payload);
    Value::Object(map)
}

/// Convert a rich value to its JSON wire form.
pub fn to_json(value: &RichValue) -> Value {
    match value {
        RichValue::Null => Value::Null,
        RichValue::Bool(b) => Value::Bool(*b),
        RichValue::Number(n) => Value::Number(n.clone()),
        RichValue::String(s) => Value::String(s.clone()),
        RichValue::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        RichValue::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (escape_key(k), to_json(v)))
                .collect(),
        ),
        RichValue::Date(d) => tagged(TAG_DATE, Value::String(format_date(d))),
        RichValue::Bytes(b) => tagged(TAG_BYTES, Value::String(STANDARD.encode(b))),
        RichValue::Map(entries) => tagged(
            TAG_MAP,
            Value::Array(
                entries
                    .iter()
                    .map(|(k, v)| Value::Array(vec![to_json(k), to_json(v)]))
                    .collect(),
            ),
        ),
        RichValue::Set(items) => tagged(TAG_SET, Value::Array(items.iter().map(to_json).collect())),
    }
}

/// Convert a JSON wire form back to a rich value.
pub fn from_json(value: Value) -> Result<RichValue, CodecError> {
    Ok(match value {
        Value::Null => RichValue::Null,
        Value::Bool(b) => RichValue::Bool(b),
        Value::Number(n) => RichValue::Number(n),
        Value::String(s) => RichValue::String(s),
        Value::Array(items) => RichValue::Array(
            items
                .into_iter()
                .map(from_json)
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((key, payload)) = map.iter().next() {
                    if let Some(decoded) = decode_tag(key, payload)? {
                        return Ok(decoded);
                    }
                }
            }
            let mut out = BTreeMap::new();
            for (k, v) in map {
                let _ = out.insert(unescape_key(k), from_json(v)?);
            }
            RichValue::Object(out)
        }
    })
}

fn decode_tag(key: &str, payload: &Value) -> Result<Option<RichValue>, CodecError> {
    let value = match key {
        TAG_DATE => {
            let text = payload.as_str().ok_or_else(|| CodecError::InvalidTag {
                tag: TAG_DATE,
                reason: "expected a string".into(),
            })?;
            let parsed = DateTime::parse_from_rfc3339(text).map_err(|e| CodecError::InvalidTag {
                tag: TAG_DATE,
                reason: e.to_string(),
            })?;
            RichValue::Date(parsed.with_timezone(&Utc))
        }
        TAG_BYTES => {
            let text = payload.as_str().ok_or_else(|| CodecError::InvalidTag {
                tag: TAG_BYTES,
                reason: "expected a base64 string".into(),
            })?;
            let data = STANDARD.decode(text).map_err(|e| CodecError::InvalidTag {
                tag: TAG_BYTES,
                reason: e.to_string(),
            })?;
            RichValue::Bytes(Bytes::from(data))
        }
        TAG_MAP => {
            let entries = payload.as_array().ok_or_else(|| CodecError::InvalidTag {
                tag: TAG_MAP,
                reason: "expected an array of pairs".into(),
            })?;
            let mut out = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry.as_array().map(Vec::as_slice) {
                    Some([k, v]) => out.push((from_json(k.clone())?, from_json(v.clone())?)),
                    _ => {
                        return Err(CodecError::InvalidTag {
                            tag: TAG_MAP,
                            reason: "entry is not a [key, value] pair".into(),
                        });
                    }
                }
            }
            RichValue::Map(out)
        }
        TAG_SET => {
            let items = payload.as_array().ok_or_else(|| CodecError::InvalidTag {
                tag: TAG_SET,
                reason: "expected an array".into(),
            })?;
            RichValue::Set(
                items
                    .iter()
                    .cloned()
                    .map(from_json)
                    .collect::<Result<_, _>>()?,
            )
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Encode a rich value to JSON text.
pub fn encode(value: &RichValue) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&to_json(value))?)
}

/// Encode on the blocking pool; used for graphs carrying binary payloads.
pub async fn encode_async(value: RichValue) -> Result<String, CodecError> {
    tokio::task::spawn_blocking(move || encode(&value))
        .await
        .map_err(|e| CodecError::Join(e.to_string()))?
}

/// Encode, choosing the async path only when `value` holds binary data.
pub async fn encode_auto(value: RichValue) -> Result<String, CodecError> {
    if contains_binary(&value) {
        encode_async(value).await
    } else {
        encode(&value)
    }
}

/// Decode JSON text into a rich value.
pub fn decode(text: &str) -> Result<RichValue, CodecError> {
    from_json(serde_json::from_str(text)?)
}

/// Decode JSON bytes into a rich value.
pub fn decode_slice(data: &[u8]) -> Result<RichValue, CodecError> {
    from_json(serde_json::from_slice(data)?)
}

/// Whether `value` contains a binary node.
///
/// Scans at most [`MAX_SCAN_DEPTH`] levels and [`MAX_SCAN_NODES`] nodes,
/// stops at the first binary node, and does not descend into dates, maps
/// or sets.
pub fn contains_binary(value: &RichValue) -> bool {
    let mut budget = MAX_SCAN_NODES;
    scan(value, 0, &mut budget)
}

fn scan(value: &RichValue, depth: usize, budget: &mut usize) -> bool {
    if *budget == 0 {
        return false;
    }
    *budget -= 1;
    match value {
        RichValue::Bytes(_) => true,
        RichValue::Array(items) if depth < MAX_SCAN_DEPTH => {
            items.iter().any(|item| scan(item, depth + 1, budget))
        }
        RichValue::Object(map) if depth < MAX_SCAN_DEPTH => {
            map.values().any(|item| scan(item, depth + 1, budget))
        }
        _ => false,
    }
}
