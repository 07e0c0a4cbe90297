//! Integrity envelope for persisted records: versioning, checksums, schema
//! checks and best-effort repair.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;

pub const CODEC_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(rename = "type")]
    pub record_type: String,
    pub source: String,
}

/// A payload plus the version, timestamp and checksum it was written with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedRecord {
    pub version: u32,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub data: Value,
    pub checksum: String,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, Copy)]
pub struct WrapOptions<'a> {
    pub version: u32,
    pub record_type: &'a str,
    pub source: &'a str,
}

impl<'a> WrapOptions<'a> {
    pub fn new(record_type: &'a str) -> Self {
        Self {
            version: CODEC_VERSION,
            record_type,
            source: "local",
        }
    }
}

pub type Validator<'a> = &'a dyn Fn(&Value) -> SchemaCheck;

#[derive(Default, Clone, Copy)]
pub struct UnwrapOptions<'a> {
    pub max_version: Option<u32>,
    pub validator: Option<Validator<'a>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnwrapIssue {
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("record version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("record failed validation: {0}")]
    Invalid(String),
    #[error("record is not a wrapped envelope: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unwrapped {
    pub valid: bool,
    pub data: Value,
    pub error: Option<UnwrapIssue>,
}

impl Unwrapped {
    fn ok(data: Value) -> Self {
        Self {
            valid: true,
            data,
            error: None,
        }
    }

    fn invalid(data: Value, issue: UnwrapIssue) -> Self {
        Self {
            valid: false,
            data,
            error: Some(issue),
        }
    }
}

pub fn wrap<T: Serialize + ?Sized>(
    data: &T,
    options: WrapOptions<'_>,
) -> Result<WrappedRecord, CodecError> {
    let data = serde_json::to_value(data)?;
    let checksum = checksum(&data)?;
    Ok(WrappedRecord {
        version: options.version,
        timestamp: now_millis(),
        data,
        checksum,
        metadata: RecordMetadata {
            record_type: options.record_type.to_string(),
            source: options.source.to_string(),
        },
    })
}

/// Checks a record. A checksum mismatch still hands back the payload so
/// callers can attempt a repair.
pub fn unwrap(record: &WrappedRecord, options: &UnwrapOptions<'_>) -> Unwrapped {
    let actual = match checksum(&record.data) {
        Ok(sum) => sum,
        Err(err) => {
            return Unwrapped::invalid(record.data.clone(), UnwrapIssue::Malformed(err.to_string()));
        }
    };
    if actual != record.checksum {
        return Unwrapped::invalid(
            record.data.clone(),
            UnwrapIssue::ChecksumMismatch {
                expected: record.checksum.clone(),
                actual,
            },
        );
    }

    if let Some(max) = options.max_version
        && record.version > max
    {
        return Unwrapped::invalid(
            record.data.clone(),
            UnwrapIssue::UnsupportedVersion {
                found: record.version,
                supported: max,
            },
        );
    }

    if let Some(validator) = options.validator {
        let check = validator(&record.data);
        if !check.valid {
            return Unwrapped::invalid(
                record.data.clone(),
                UnwrapIssue::Invalid(check.error.unwrap_or_default()),
            );
        }
    }

    Unwrapped::ok(record.data.clone())
}

/// Unwraps raw JSON that should hold a [`WrappedRecord`]. Anything else is
/// reported as malformed with the raw value as data.
pub fn unwrap_value(raw: &Value, options: &UnwrapOptions<'_>) -> Unwrapped {
    match WrappedRecord::deserialize(raw) {
        Ok(record) => unwrap(&record, options),
        Err(err) => Unwrapped::invalid(raw.clone(), UnwrapIssue::Malformed(err.to_string())),
    }
}

pub fn checksum(data: &Value) -> Result<String, CodecError> {
    let bytes = canonical_bytes(data)?;
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256:");
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

/// Serializes with object keys sorted at every depth.
pub fn canonical_bytes(data: &Value) -> Result<Vec<u8>, CodecError> {
    let mut value = data.clone();
    sort_json_value(&mut value);
    Ok(serde_json::to_vec(&value)?)
}

fn sort_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, v) in entries.iter_mut() {
                sort_json_value(v);
            }
            map.extend(entries);
        }
        Value::Array(items) => {
            for item in items {
                sort_json_value(item);
            }
        }
        _ => {}
    }
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Object,
    Array,
    String,
    Number,
    Boolean,
    /// Any string, number or boolean.
    Primitive,
}

impl ValueKind {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::Object => value.is_object(),
            ValueKind::Array => value.is_array(),
            ValueKind::String => value.is_string(),
            ValueKind::Number => value.is_number(),
            ValueKind::Boolean => value.is_boolean(),
            ValueKind::Primitive => value.is_string() || value.is_number() || value.is_boolean(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ValueKind::Object => "object",
            ValueKind::Array => "array",
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
            ValueKind::Primitive => "primitive",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub kind: ValueKind,
    pub required: &'static [&'static str],
    pub fields: &'static [(&'static str, ValueKind)],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCheck {
    pub valid: bool,
    pub error: Option<String>,
}

impl SchemaCheck {
    fn pass() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn fail(message: String) -> Self {
        Self {
            valid: false,
            error: Some(message),
        }
    }
}

/// Checks the top-level kind, required fields, and the kind of every typed
/// field that is present. Null counts as absent.
pub fn validate_schema(data: &Value, schema: &Schema) -> SchemaCheck {
    if !schema.kind.matches(data) {
        return SchemaCheck::fail(format!("expected {}", schema.kind.name()));
    }
    let Some(map) = data.as_object() else {
        return SchemaCheck::pass();
    };

    for field in schema.required {
        if map.get(*field).is_none_or(Value::is_null) {
            return SchemaCheck::fail(format!("missing required field `{field}`"));
        }
    }
    for (field, kind) in schema.fields {
        match map.get(*field) {
            None | Some(Value::Null) => {}
            Some(value) if kind.matches(value) => {}
            Some(_) => {
                return SchemaCheck::fail(format!("field `{field}` should be {}", kind.name()));
            }
        }
    }
    SchemaCheck::pass()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions<'a> {
    pub remove_nulls: bool,
    pub defaults: Option<&'a Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    ParsedSerializedString,
    RemovedNull(String),
    FilledDefault(String),
}

impl std::fmt::Display for RepairAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairAction::ParsedSerializedString => f.write_str("parsed serialized string"),
            RepairAction::RemovedNull(field) => write!(f, "removed null `{field}`"),
            RepairAction::FilledDefault(field) => write!(f, "filled default `{field}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub success: bool,
    pub data: Value,
    pub repairs: Vec<RepairAction>,
}

/// Best-effort structural repair. Applying it to its own output changes nothing.
pub fn repair(data: &Value, options: &RepairOptions<'_>) -> RepairOutcome {
    let mut repairs = Vec::new();
    let mut value = data.clone();

    if let Value::String(text) = &value {
        match serde_json::from_str::<Value>(text) {
            Ok(parsed) => {
                value = parsed;
                repairs.push(RepairAction::ParsedSerializedString);
            }
            Err(_) => {
                return RepairOutcome {
                    success: false,
                    data: value,
                    repairs,
                };
            }
        }
    }

    let Value::Object(map) = &mut value else {
        let success = options.defaults.is_none_or(Map::is_empty);
        return RepairOutcome {
            success,
            data: value,
            repairs,
        };
    };

    if options.remove_nulls {
        let nulls: Vec<String> = map
            .iter()
            .filter(|(_, v)| v.is_null())
            .map(|(k, _)| k.clone())
            .collect();
        for key in nulls {
            map.remove(&key);
            repairs.push(RepairAction::RemovedNull(key));
        }
    }

    if let Some(defaults) = options.defaults {
        for (key, default) in defaults {
            if map.get(key).is_none_or(Value::is_null) && map.get(key) != Some(default) {
                map.insert(key.clone(), default.clone());
                repairs.push(RepairAction::FilledDefault(key.clone()));
            }
        }
    }

    RepairOutcome {
        success: true,
        data: value,
        repairs,
    }
}
