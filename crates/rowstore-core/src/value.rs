//! Row values and field types
//!
//! `Value` is the totally ordered scalar stored in row fields and used as the
//! key of field keepers. A missing field is the null value; it is never stored
//! as a variant.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Row identifier. 0 means "not assigned yet".
pub type RowId = u64;

/// Scalar field value.
///
/// Ordering: numbers compare numerically across `Int` and `Float` (ties put
/// `Int` first), floats use IEEE total order, and every number sorts before
/// every string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// String payload, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Int(_) | Value::Float(_) => 0,
            Value::Text(_) => 1,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Int(v) => {
                state.write_u8(0);
                v.hash(state);
            }
            Value::Float(v) => {
                state.write_u8(1);
                v.to_bits().hash(state);
            }
            Value::Text(v) => {
                state.write_u8(2);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v as i64) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Text(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::Text(v) }
}

/// Key type usable in a field keeper.
///
/// `as_text` exposes string keys to LIKE evaluation; non-string keys
/// return `None`.
pub trait IndexKey: Ord + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn as_text(&self) -> Option<&str> {
        None
    }
}

impl IndexKey for Value {
    fn as_text(&self) -> Option<&str> {
        Value::as_text(self)
    }
}

impl IndexKey for String {
    fn as_text(&self) -> Option<&str> {
        Some(self)
    }
}

impl IndexKey for i64 {}
impl IndexKey for u64 {}

/// Scalar kinds a model field can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
}

impl FieldType {
    pub const ALL: [FieldType; 8] = [
        FieldType::Byte,
        FieldType::Char,
        FieldType::Short,
        FieldType::Int,
        FieldType::Long,
        FieldType::Float,
        FieldType::Double,
        FieldType::String,
    ];

    /// Lower-case type name.
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Byte => "byte",
            FieldType::Char => "char",
            FieldType::Short => "short",
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::String => "string",
        }
    }

    /// Look a type up by name, ignoring case.
    pub fn from_name(name: &str) -> Option<FieldType> {
        let name = name.trim();
        FieldType::ALL.into_iter().find(|t| t.name().eq_ignore_ascii_case(name))
    }

    /// Parse `text` into a value of this type.
    pub fn parse(&self, text: &str) -> Result<Value, String> {
        let wrong = |e: &dyn fmt::Display| format!("'{}' is not a valid {}: {}", text, self.name(), e);
        match self {
            FieldType::Byte => text.trim().parse::<i8>().map(|v| Value::Int(v as i64)).map_err(|e| wrong(&e)),
            FieldType::Short => text.trim().parse::<i16>().map(|v| Value::Int(v as i64)).map_err(|e| wrong(&e)),
            FieldType::Int => text.trim().parse::<i32>().map(|v| Value::Int(v as i64)).map_err(|e| wrong(&e)),
            FieldType::Long => text.trim().parse::<i64>().map(Value::Int).map_err(|e| wrong(&e)),
            FieldType::Float => text.trim().parse::<f32>().map(|v| Value::Float(v as f64)).map_err(|e| wrong(&e)),
            FieldType::Double => text.trim().parse::<f64>().map(Value::Float).map_err(|e| wrong(&e)),
            FieldType::Char => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(Value::Text(c.to_string())),
                    _ => Err(format!("'{}' is not a valid char: expected exactly one character", text)),
                }
            }
            FieldType::String => Ok(Value::Text(text.to_string())),
        }
    }

    /// Whether `value` is representable in this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Byte, Value::Int(v)) => i8::try_from(*v).is_ok(),
            (FieldType::Short, Value::Int(v)) => i16::try_from(*v).is_ok(),
            (FieldType::Int, Value::Int(v)) => i32::try_from(*v).is_ok(),
            (FieldType::Long, Value::Int(_)) => true,
            (FieldType::Float, Value::Float(v)) => !v.is_finite() || v.abs() <= f32::MAX as f64,
            (FieldType::Double, Value::Float(_)) => true,
            (FieldType::Char, Value::Text(v)) => v.chars().count() == 1,
            (FieldType::String, Value::Text(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stored row: id plus named values. Absent fields are null.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    /// A row without an id; `add` assigns one.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: RowId) -> Self {
        Self { id, fields: BTreeMap::new() }
    }

    /// Builder-style field setter.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(field.into(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }
}
