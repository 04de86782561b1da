//! Source record model
//!
//! Records arrive from the upstream messaging system already decoded into a
//! structured form: an ordered list of typed fields with their values. A
//! record is immutable once received.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{ConnectError, Result};

/// Logical type of a record field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    /// Microseconds since the unix epoch
    Timestamp,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Timestamp => "timestamp",
        };
        write!(f, "{}", name)
    }
}

/// Field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Value {
    Null,
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Microseconds since the unix epoch
    Timestamp(i64),
}

impl Value {
    /// Check if value is null
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Field type carried by this value, `None` for null
    pub fn field_type(&self) -> Option<FieldType> {
        Some(match self {
            Self::Null => return None,
            Self::Boolean(_) => FieldType::Boolean,
            Self::Int8(_) => FieldType::Int8,
            Self::Int16(_) => FieldType::Int16,
            Self::Int32(_) => FieldType::Int32,
            Self::Int64(_) => FieldType::Int64,
            Self::Float32(_) => FieldType::Float32,
            Self::Float64(_) => FieldType::Float64,
            Self::String(_) => FieldType::String,
            Self::Bytes(_) => FieldType::Bytes,
            Self::Timestamp(_) => FieldType::Timestamp,
        })
    }

    /// Try to view as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(n) => Some(i64::from(*n)),
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) | Self::Timestamp(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Int8(n) => write!(f, "{}", n),
            Self::Int16(n) => write!(f, "{}", n),
            Self::Int32(n) => write!(f, "{}", n),
            Self::Int64(n) => write!(f, "{}", n),
            Self::Float32(n) => write!(f, "{}", n),
            Self::Float64(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{:?}", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Timestamp(us) => write!(f, "{}us", us),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Schema entry for one field of a structured value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub optional: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            optional: true,
        }
    }
}

#[derive(Deserialize)]
struct RawStruct {
    fields: Vec<Field>,
    values: Vec<Value>,
}

/// Structured value: schema fields and the values positionally matching them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStruct")]
pub struct StructValue {
    fields: Vec<Field>,
    values: Vec<Value>,
}

impl TryFrom<RawStruct> for StructValue {
    type Error = ConnectError;

    fn try_from(raw: RawStruct) -> Result<Self> {
        Self::new(raw.fields, raw.values)
    }
}

impl StructValue {
    /// Build a structured value, checking that every value matches its field
    pub fn new(fields: Vec<Field>, values: Vec<Value>) -> Result<Self> {
        if fields.len() != values.len() {
            return Err(ConnectError::Internal(format!(
                "struct has {} fields but {} values",
                fields.len(),
                values.len()
            )));
        }

        let mut seen = HashSet::with_capacity(fields.len());
        for (field, value) in fields.iter().zip(&values) {
            if !seen.insert(field.name.as_str()) {
                return Err(ConnectError::Internal(format!(
                    "duplicate field '{}' in struct",
                    field.name
                )));
            }
            match value.field_type() {
                None if !field.optional => {
                    return Err(ConnectError::Internal(format!(
                        "null value for required field '{}'",
                        field.name
                    )));
                }
                Some(t) if t != field.field_type => {
                    return Err(ConnectError::Internal(format!(
                        "field '{}' declared {} but holds {}",
                        field.name, field.field_type, t
                    )));
                }
                _ => {}
            }
        }

        Ok(Self { fields, values })
    }

    pub fn builder() -> StructBuilder {
        StructBuilder::default()
    }

    /// Look up a field and its value by name
    pub fn get(&self, name: &str) -> Option<(&Field, &Value)> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| (&self.fields[i], &self.values[i]))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Field, &Value)> {
        self.fields.iter().zip(&self.values)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Builder for [`StructValue`]; field types are taken from the values
#[derive(Debug, Default)]
pub struct StructBuilder {
    fields: Vec<Field>,
    values: Vec<Value>,
    error: Option<String>,
}

impl StructBuilder {
    /// Add a required field. A null here is reported by [`StructBuilder::build`];
    /// use [`StructBuilder::optional`] for nullable fields.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match value.field_type() {
            Some(field_type) => {
                self.fields.push(Field::new(name, field_type));
                self.values.push(value);
            }
            None => {
                self.error
                    .get_or_insert_with(|| format!("null value for required field '{}'", name));
            }
        }
        self
    }

    /// Add an optional field with an explicit type, so it can hold null
    pub fn optional(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        value: impl Into<Value>,
    ) -> Self {
        self.fields.push(Field::optional(name, field_type));
        self.values.push(value.into());
        self
    }

    pub fn build(self) -> Result<StructValue> {
        if let Some(error) = self.error {
            return Err(ConnectError::Internal(error));
        }
        StructValue::new(self.fields, self.values)
    }
}

/// A source partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A record delivered by the host pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    #[serde(default)]
    pub key: Option<StructValue>,
    pub value: StructValue,
}

impl Record {
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64, value: StructValue) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value,
        }
    }

    pub fn with_key(mut self, key: StructValue) -> Self {
        self.key = Some(key);
        self
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}
