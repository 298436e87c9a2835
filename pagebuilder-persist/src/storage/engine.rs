//! Engine contract: a versioned, transactional key-value database with
//! named partitions and secondary indexes.
//!
//! ```text
//! Engine::open(name, version, upgrade)
//!     │  (upgrade runs once when the stored version is behind)
//!     ▼
//! Connection ──begin(partition, mode)──► Transaction
//!                                           │ execute(Request) → Response   (request completes)
//!                                           │ commit()                      (transaction completes)
//!                                           └ abort()
//! ```
//!
//! Engines are synchronous; the adapter in [`crate::db`] moves every call
//! onto the blocking pool so callers only ever see futures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Structured value stored in a partition.
pub type Value = serde_json::Value;

// ─── Keys ─────────────────────────────────────────────────────────────

/// Record or index key. Orders numbers before strings before arrays.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Text(String),
    Array(Vec<Key>),
}

const TAG_INT: u8 = 0x10;
const TAG_TEXT: u8 = 0x20;
const TAG_ARRAY: u8 = 0x30;
const END: u8 = 0x00;
const ESCAPE: u8 = 0xFF;

impl Key {
    /// Key for a structured value. Only integral numbers, strings and
    /// arrays of those are valid keys.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_i64().map(Key::Int).or_else(|| {
                let f = n.as_f64()?;
                (f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64)
                    .then(|| Key::Int(f as i64))
            }),
            Value::String(s) => Some(Key::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    /// Order-preserving, self-delimiting byte encoding: comparing two
    /// encodings bytewise agrees with `Ord`, and no encoding is a prefix
    /// of another, so encodings can be concatenated into composite keys.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Key::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
            }
            Key::Text(s) => {
                out.push(TAG_TEXT);
                for &b in s.as_bytes() {
                    out.push(b);
                    if b == END {
                        out.push(ESCAPE);
                    }
                }
                out.extend_from_slice(&[END, END]);
            }
            Key::Array(items) => {
                out.push(TAG_ARRAY);
                for item in items {
                    item.encode_into(out);
                }
                out.push(END);
            }
        }
    }

    /// Decode one key from the front of `bytes`, returning it with the
    /// number of bytes consumed.
    pub fn decode_prefix(bytes: &[u8]) -> Option<(Key, usize)> {
        let (&tag, rest) = bytes.split_first()?;
        match tag {
            TAG_INT => {
                let raw: [u8; 8] = rest.get(..8)?.try_into().ok()?;
                Some((Key::Int((u64::from_be_bytes(raw) ^ (1 << 63)) as i64), 9))
            }
            TAG_TEXT => {
                let mut buf = Vec::new();
                let mut i = 0;
                loop {
                    let b = *rest.get(i)?;
                    if b != END {
                        buf.push(b);
                        i += 1;
                        continue;
                    }
                    match *rest.get(i + 1)? {
                        END => break,
                        ESCAPE => {
                            buf.push(END);
                            i += 2;
                        }
                        _ => return None,
                    }
                }
                let text = String::from_utf8(buf).ok()?;
                Some((Key::Text(text), 1 + i + 2))
            }
            TAG_ARRAY => {
                let mut items = Vec::new();
                let mut used = 1;
                loop {
                    if *bytes.get(used)? == END {
                        return Some((Key::Array(items), used + 1));
                    }
                    let (item, n) = Key::decode_prefix(&bytes[used..])?;
                    items.push(item);
                    used += n;
                }
            }
            _ => None,
        }
    }

    /// Decode a buffer holding exactly one key.
    pub fn decode(bytes: &[u8]) -> Option<Key> {
        match Key::decode_prefix(bytes)? {
            (key, n) if n == bytes.len() => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Text(s) => f.write_str(s),
            Key::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

// ─── Indexes ──────────────────────────────────────────────────────────

/// Where an index finds its key inside a stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// Dotted path (`"meta.owner"`); the empty path is the value itself.
    Single(String),
    /// Several paths; the index key is the array of their keys.
    Compound(Vec<String>),
}

impl KeyPath {
    pub fn compound<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath::Compound(paths.into_iter().map(Into::into).collect())
    }

    /// Extract the index key from `value`. `None` means the value is not
    /// indexed (missing field or a field that is not a valid key).
    pub fn evaluate(&self, value: &Value) -> Option<Key> {
        match self {
            KeyPath::Single(path) => Key::from_value(resolve(value, path)?),
            KeyPath::Compound(paths) => paths
                .iter()
                .map(|p| Key::from_value(resolve(value, p)?))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
        }
    }
}

fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |v, segment| v.get(segment))
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        KeyPath::Single(path)
    }
}

/// Secondary index declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

// ─── Requests ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// One operation against the partition a transaction was opened on.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get(Key),
    GetAll,
    GetAllKeys,
    IndexGetAll { index: String, key: Key },
    Put { key: Key, value: Value },
    Delete(Key),
    Clear,
}

impl Request {
    pub fn is_write(&self) -> bool {
        matches!(self, Request::Put { .. } | Request::Delete(_) | Request::Clear)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Get(_) => "get",
            Request::GetAll => "getAll",
            Request::GetAllKeys => "getAllKeys",
            Request::IndexGetAll { .. } => "index.getAll",
            Request::Put { .. } => "put",
            Request::Delete(_) => "delete",
            Request::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `Get`: `None` when the key is absent.
    Value(Option<Value>),
    /// `GetAll` / `IndexGetAll`, in primary-key order.
    Values(Vec<Value>),
    /// `GetAllKeys`, ascending.
    Keys(Vec<Key>),
    /// `Put`: the key written.
    Key(Key),
    /// `Delete` / `Clear`.
    Done,
}

// ─── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The engine cannot run in this environment
    Unavailable(String),
    /// Requested version is older than the stored one
    VersionMismatch { requested: u32, stored: u32 },
    /// Partition not declared in the schema
    UnknownPartition(String),
    /// Index not declared on the partition
    UnknownIndex { partition: String, index: String },
    /// Write attempted in a read-only transaction
    ReadOnly,
    /// Unique index already holds this key for another record
    Constraint { index: String, key: Key },
    /// Connection was closed
    Closed,
    /// Transaction was aborted before it committed
    Aborted(String),
    /// Stored bytes could not be decoded
    Corrupted(String),
    /// Underlying storage failure
    Io(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Unavailable(e) => write!(f, "Engine unavailable: {e}"),
            EngineError::VersionMismatch { requested, stored } => write!(
                f,
                "Requested version {requested} is less than the existing version {stored}"
            ),
            EngineError::UnknownPartition(name) => write!(f, "Partition '{name}' not found"),
            EngineError::UnknownIndex { partition, index } => {
                write!(f, "Index '{index}' not found on partition '{partition}'")
            }
            EngineError::ReadOnly => write!(f, "Write attempted in a read-only transaction"),
            EngineError::Constraint { index, key } => {
                write!(f, "Unique index '{index}' already contains key {key}")
            }
            EngineError::Closed => write!(f, "Connection is closed"),
            EngineError::Aborted(e) => write!(f, "Transaction aborted: {e}"),
            EngineError::Corrupted(e) => write!(f, "Corrupted data: {e}"),
            EngineError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

// ─── Traits ───────────────────────────────────────────────────────────

/// Schema access handed to the upgrade callback.
pub trait UpgradeContext {
    /// Version before the upgrade; 0 for a database that did not exist.
    fn old_version(&self) -> u32;

    fn new_version(&self) -> u32;

    fn has_partition(&self, name: &str) -> bool;

    fn create_partition(&mut self, name: &str) -> Result<(), EngineError>;

    fn index_names(&self, partition: &str) -> Result<Vec<String>, EngineError>;

    /// Create an index and build it over existing records.
    fn create_index(&mut self, partition: &str, index: &IndexSpec) -> Result<(), EngineError>;
}

pub type UpgradeFn<'a> = dyn FnMut(&mut dyn UpgradeContext) -> Result<(), EngineError> + 'a;

pub trait Engine: Send + Sync + 'static {
    /// Feature detection. An unsupported engine must never be opened.
    fn is_supported(&self) -> bool {
        true
    }

    /// Open `name`. `version: None` opens the stored version (1 for a new
    /// database). `upgrade` runs once when the target version is ahead of
    /// the stored one; if it fails, the stored version is left unchanged.
    fn open(
        &self,
        name: &str,
        version: Option<u32>,
        upgrade: &mut UpgradeFn<'_>,
    ) -> Result<Arc<dyn Connection>, EngineError>;
}

pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    fn partitions(&self) -> Vec<String>;

    fn begin(&self, partition: &str, mode: TxMode) -> Result<Box<dyn Transaction>, EngineError>;

    fn close(&self) -> Result<(), EngineError>;
}

/// Writes are staged until `commit`, which applies them atomically.
/// Reads observe committed state only.
pub trait Transaction: Send {
    fn execute(&mut self, request: Request) -> Result<Response, EngineError>;

    fn commit(self: Box<Self>) -> Result<(), EngineError>;

    fn abort(self: Box<Self>);
}

/// Index keys for `value` under each of `indexes`, skipping unindexed ones.
pub(crate) fn index_entries<'a>(
    indexes: &'a [IndexSpec],
    value: &'a Value,
) -> impl Iterator<Item = (&'a IndexSpec, Key)> + 'a {
    indexes
        .iter()
        .filter_map(move |spec| spec.key_path.evaluate(value).map(|k| (spec, k)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys() -> Vec<Key> {
        vec![
            Key::Int(i64::MIN),
            Key::Int(-1),
            Key::Int(0),
            Key::Int(42),
            Key::Text(String::new()),
            Key::Text("a".into()),
            Key::Text("a\0".into()),
            Key::Text("ab".into()),
            Key::Array(vec![]),
            Key::Array(vec![Key::Int(1)]),
            Key::Array(vec![Key::Int(1), Key::Text("x".into())]),
            Key::Array(vec![Key::Text("a".into())]),
        ]
    }

    #[test]
    fn test_encoding_preserves_order() {
        let keys = keys();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
            assert!(pair[0].encode() < pair[1].encode(), "{} encodes out of order", pair[0]);
        }
    }

    #[test]
    fn test_decode_inverts_encode() {
        for key in keys() {
            assert_eq!(Key::decode(&key.encode()), Some(key));
        }
    }

    #[test]
    fn test_decode_prefix_of_concatenation() {
        let mut buf = Key::from("partition").encode();
        Key::Int(7).encode_into(&mut buf);
        let (first, n) = Key::decode_prefix(&buf).unwrap();
        assert_eq!(first, Key::from("partition"));
        assert_eq!(Key::decode(&buf[n..]), Some(Key::Int(7)));
        assert_eq!(Key::decode(&buf), None);
    }

    #[test]
    fn test_key_from_value() {
        assert_eq!(Key::from_value(&json!(3)), Some(Key::Int(3)));
        assert_eq!(Key::from_value(&json!(3.0)), Some(Key::Int(3)));
        assert_eq!(Key::from_value(&json!(3.5)), None);
        assert_eq!(Key::from_value(&json!("x")), Some(Key::from("x")));
        assert_eq!(Key::from_value(&json!(null)), None);
        assert_eq!(Key::from_value(&json!(true)), None);
        assert_eq!(Key::from_value(&json!({"a": 1})), None);
        assert_eq!(
            Key::from_value(&json!([1, "b"])),
            Some(Key::Array(vec![Key::Int(1), Key::from("b")]))
        );
    }

    #[test]
    fn test_key_path_evaluate() {
        let value = json!({"tabId": "t1", "meta": {"order": 2}, "flag": true});
        assert_eq!(KeyPath::from("tabId").evaluate(&value), Some(Key::from("t1")));
        assert_eq!(KeyPath::from("meta.order").evaluate(&value), Some(Key::Int(2)));
        assert_eq!(KeyPath::from("missing").evaluate(&value), None);
        assert_eq!(KeyPath::from("flag").evaluate(&value), None);
        assert_eq!(
            KeyPath::compound(["tabId", "meta.order"]).evaluate(&value),
            Some(Key::Array(vec![Key::from("t1"), Key::Int(2)]))
        );
        assert_eq!(KeyPath::compound(["tabId", "missing"]).evaluate(&value), None);
        assert_eq!(KeyPath::from("").evaluate(&json!("self")), Some(Key::from("self")));
    }

    #[test]
    fn test_request_classification() {
        assert!(Request::Clear.is_write());
        assert!(!Request::GetAll.is_write());
        assert_eq!(Request::Delete(Key::Int(1)).name(), "delete");
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Constraint {
            index: "by_slug".into(),
            key: Key::from("home"),
        };
        assert!(err.to_string().contains("by_slug"));
        assert!(EngineError::UnknownPartition("kv".into())
            .to_string()
            .contains("not found"));
    }
}
