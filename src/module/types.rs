//! Module Type System
//!
//! Declared parameter/return types, the structured type schemas modules
//! describe, and the values that flow in and out of a call.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use super::Fault;

/// Built-in value kinds (the "standard vocabulary" a raw parameter passes through as)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// Boolean
    Bool,
    /// 64-bit signed integer
    Int,
    /// 64-bit unsigned integer
    UInt,
    /// 64-bit floating point
    Float,
    /// Single character
    Char,
    /// UTF-8 text
    Text,
    /// Date and time
    DateTime,
}

impl PrimitiveKind {
    /// Parse from a type name, case-insensitively, accepting common aliases
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "bool" | "boolean" | "system.boolean" => Some(PrimitiveKind::Bool),
            "int" | "i8" | "i16" | "i32" | "i64" | "int16" | "int32" | "int64" | "long"
            | "short" | "sbyte" | "system.int32" | "system.int64" => Some(PrimitiveKind::Int),
            "uint" | "u8" | "u16" | "u32" | "u64" | "uint16" | "uint32" | "uint64" | "ulong"
            | "ushort" | "byte" => Some(PrimitiveKind::UInt),
            "float" | "double" | "decimal" | "f32" | "f64" | "single" | "system.double" => {
                Some(PrimitiveKind::Float)
            }
            "char" | "system.char" => Some(PrimitiveKind::Char),
            "string" | "text" | "str" | "system.string" => Some(PrimitiveKind::Text),
            "datetime" | "date" | "timestamp" | "system.datetime" => Some(PrimitiveKind::DateTime),
            _ => None,
        }
    }

    /// Whether a JSON `null` is acceptable for this kind when no nullability is declared
    pub fn nullable_by_default(&self) -> bool {
        matches!(self, PrimitiveKind::Text | PrimitiveKind::DateTime)
    }

    /// The value a field of this kind takes when the encoding omits it
    pub fn default_value(&self) -> Value {
        match self {
            PrimitiveKind::Bool => Value::Bool(false),
            PrimitiveKind::Int => Value::Int(0),
            PrimitiveKind::UInt => Value::UInt(0),
            PrimitiveKind::Float => Value::Float(0.0),
            PrimitiveKind::Char => Value::Char('\0'),
            PrimitiveKind::Text | PrimitiveKind::DateTime => Value::Null,
        }
    }

    /// Check that a raw literal is admissible for this kind
    pub fn admits(&self, raw: &str) -> Result<(), String> {
        match self {
            PrimitiveKind::Text => Ok(()),
            _ => parse_literal(*self, raw).map(|_| ()),
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveKind::Bool => write!(f, "bool"),
            PrimitiveKind::Int => write!(f, "int"),
            PrimitiveKind::UInt => write!(f, "uint"),
            PrimitiveKind::Float => write!(f, "float"),
            PrimitiveKind::Char => write!(f, "char"),
            PrimitiveKind::Text => write!(f, "string"),
            PrimitiveKind::DateTime => write!(f, "datetime"),
        }
    }
}

/// Parse a primitive literal into a typed value
pub fn parse_literal(kind: PrimitiveKind, raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();
    match kind {
        PrimitiveKind::Bool => match trimmed.to_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("'{}' is not a boolean", raw)),
        },
        PrimitiveKind::Int => trimmed
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| format!("'{}' is not an integer: {}", raw, e)),
        PrimitiveKind::UInt => trimmed
            .parse::<u64>()
            .map(Value::UInt)
            .map_err(|e| format!("'{}' is not an unsigned integer: {}", raw, e)),
        PrimitiveKind::Float => trimmed
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| format!("'{}' is not a number: {}", raw, e)),
        PrimitiveKind::Char => {
            let mut chars = raw.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Char(c)),
                _ => Err(format!("'{}' is not a single character", raw)),
            }
        }
        PrimitiveKind::Text => Ok(Value::Text(raw.to_string())),
        PrimitiveKind::DateTime => parse_datetime(trimmed)
            .map(Value::DateTime)
            .ok_or_else(|| format!("'{}' is not a date/time", raw)),
    }
}

/// Accepts RFC 3339, a naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` (taken as UTC) or a bare date
fn parse_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    let utc = FixedOffset::east_opt(0)?;
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return naive.and_local_timezone(utc).single();
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| naive.and_local_timezone(utc).single())
}

/// A field of a structured (caller-defined) type
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field name as it appears in the encoding
    pub name: String,
    /// Declared type
    pub ty: TypeRef,
    /// Whether an explicit `null` is accepted
    pub nullable: bool,
    /// Read-only fields are skipped when decoding
    pub writable: bool,
}

impl FieldDef {
    /// A writable field with the type's default nullability
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        let nullable = match &ty {
            TypeRef::Primitive(kind) => kind.nullable_by_default(),
            TypeRef::Struct(_) | TypeRef::Void => true,
        };
        Self {
            name: name.into(),
            ty,
            nullable,
            writable: true,
        }
    }

    /// Accept explicit nulls (e.g. `DateTime?`)
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark the field as read-only
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }
}

/// Schema of a structured type
#[derive(Debug, Clone)]
pub struct StructSchema {
    /// Fully-qualified type name
    pub name: String,
    /// Fields in declaration order
    pub fields: Vec<FieldDef>,
}

impl StructSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Look up a field by exact name
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A declared parameter or return type
#[derive(Debug, Clone)]
pub enum TypeRef {
    /// No value (return types only)
    Void,
    /// Built-in type, passed through as its raw literal
    Primitive(PrimitiveKind),
    /// Caller-defined structure, decoded from a field-name-to-value encoding
    Struct(Arc<StructSchema>),
}

impl TypeRef {
    pub const BOOL: TypeRef = TypeRef::Primitive(PrimitiveKind::Bool);
    pub const INT: TypeRef = TypeRef::Primitive(PrimitiveKind::Int);
    pub const UINT: TypeRef = TypeRef::Primitive(PrimitiveKind::UInt);
    pub const FLOAT: TypeRef = TypeRef::Primitive(PrimitiveKind::Float);
    pub const CHAR: TypeRef = TypeRef::Primitive(PrimitiveKind::Char);
    pub const TEXT: TypeRef = TypeRef::Primitive(PrimitiveKind::Text);
    pub const DATETIME: TypeRef = TypeRef::Primitive(PrimitiveKind::DateTime);

    /// Wrap a schema
    pub fn structure(schema: StructSchema) -> Self {
        TypeRef::Struct(Arc::new(schema))
    }

    /// Check if this is a built-in type
    pub fn is_primitive(&self) -> bool {
        matches!(self, TypeRef::Primitive(_))
    }

    /// Check if this is the void type
    pub fn is_void(&self) -> bool {
        matches!(self, TypeRef::Void)
    }

    /// Type name as shown in errors and descriptions
    pub fn name(&self) -> String {
        match self {
            TypeRef::Void => "void".to_string(),
            TypeRef::Primitive(kind) => kind.to_string(),
            TypeRef::Struct(schema) => schema.name.clone(),
        }
    }
}

impl TypeRef {
    /// Decode a JSON value as an instance of this type.
    ///
    /// Structures match field names exactly; unknown keys and read-only fields
    /// are ignored, absent fields take their kind's default. Primitive kinds
    /// accept either their native JSON form or a string literal.
    pub fn decode_json(&self, json: &serde_json::Value) -> Result<Value, String> {
        match self {
            TypeRef::Void => Ok(Value::Null),
            TypeRef::Primitive(kind) => decode_primitive(*kind, json),
            TypeRef::Struct(schema) => match json {
                serde_json::Value::Null => Ok(Value::Null),
                serde_json::Value::Object(map) => {
                    let mut fields = Vec::with_capacity(schema.fields.len());
                    for field in &schema.fields {
                        let value = match map.get(&field.name) {
                            Some(_) if !field.writable => field.ty.default_value(),
                            Some(serde_json::Value::Null) if field.nullable => Value::Null,
                            Some(serde_json::Value::Null) => {
                                return Err(format!("field '{}' does not accept null", field.name))
                            }
                            Some(v) => field
                                .ty
                                .decode_json(v)
                                .map_err(|e| format!("field '{}': {}", field.name, e))?,
                            None => field.ty.default_value(),
                        };
                        fields.push((field.name.clone(), value));
                    }
                    Ok(Value::Struct(StructValue {
                        type_name: schema.name.clone(),
                        fields,
                    }))
                }
                other => Err(format!(
                    "expected an object for '{}', got {}",
                    schema.name,
                    json_kind(other)
                )),
            },
        }
    }

    /// The value an omitted field of this type takes
    pub fn default_value(&self) -> Value {
        match self {
            TypeRef::Primitive(kind) => kind.default_value(),
            TypeRef::Void | TypeRef::Struct(_) => Value::Null,
        }
    }
}

fn decode_primitive(kind: PrimitiveKind, json: &serde_json::Value) -> Result<Value, String> {
    use serde_json::Value as Json;

    match (kind, json) {
        (_, Json::Null) => Ok(Value::Null),
        (PrimitiveKind::Text, Json::String(s)) => Ok(Value::Text(s.clone())),
        (_, Json::String(s)) => parse_literal(kind, s),
        (PrimitiveKind::Bool, Json::Bool(b)) => Ok(Value::Bool(*b)),
        (PrimitiveKind::Int, Json::Number(n)) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| format!("{} is not an integer", n)),
        (PrimitiveKind::UInt, Json::Number(n)) => n
            .as_u64()
            .map(Value::UInt)
            .ok_or_else(|| format!("{} is not an unsigned integer", n)),
        (PrimitiveKind::Float, Json::Number(n)) => n
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| format!("{} is not a number", n)),
        (kind, other) => Err(format!("expected {}, got {}", kind, json_kind(other))),
    }
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An instance of a structured type, fields in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub type_name: String,
    pub fields: Vec<(String, Value)>,
}

impl StructValue {
    /// Get a field value by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

impl Serialize for StructValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// A typed value: a structure field, a decoded argument or a call result
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Char(char),
    Text(String),
    DateTime(DateTime<FixedOffset>),
    Struct(StructValue),
}

impl Value {
    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::UInt(v) => serializer.serialize_u64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Char(c) => serializer.serialize_char(*c),
            Value::Text(s) => serializer.serialize_str(s),
            Value::DateTime(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            Value::Struct(s) => s.serialize(serializer),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Char(c) => write!(f, "{}", c),
            Value::Text(s) => write!(f, "{}", s),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Struct(s) => {
                let json = serde_json::to_string(s).map_err(|_| fmt::Error)?;
                write!(f, "{}", json)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// A call-ready argument produced by the marshaller
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// Primitive parameter: the wire literal, untouched
    Raw(String),
    /// Structured parameter: `None` when the wire value was empty
    Struct(Option<StructValue>),
}

impl Argument {
    /// The raw literal of a primitive argument
    pub fn text(&self) -> Result<&str, Fault> {
        match self {
            Argument::Raw(s) => Ok(s),
            Argument::Struct(_) => {
                Err(Fault::new("expected a primitive argument, got a structure"))
            }
        }
    }

    /// Parse a primitive argument as the given kind
    pub fn parse(&self, kind: PrimitiveKind) -> Result<Value, Fault> {
        parse_literal(kind, self.text()?).map_err(Fault::new)
    }

    pub fn as_bool(&self) -> Result<bool, Fault> {
        match self.parse(PrimitiveKind::Bool)? {
            Value::Bool(b) => Ok(b),
            _ => Err(Fault::new("not a boolean")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, Fault> {
        match self.parse(PrimitiveKind::Int)? {
            Value::Int(v) => Ok(v),
            _ => Err(Fault::new("not an integer")),
        }
    }

    pub fn as_f64(&self) -> Result<f64, Fault> {
        match self.parse(PrimitiveKind::Float)? {
            Value::Float(v) => Ok(v),
            _ => Err(Fault::new("not a number")),
        }
    }

    pub fn as_datetime(&self) -> Result<DateTime<FixedOffset>, Fault> {
        match self.parse(PrimitiveKind::DateTime)? {
            Value::DateTime(dt) => Ok(dt),
            _ => Err(Fault::new("not a date/time")),
        }
    }

    /// The decoded structure, `None` for a no-value argument
    pub fn structure(&self) -> Result<Option<&StructValue>, Fault> {
        match self {
            Argument::Struct(s) => Ok(s.as_ref()),
            Argument::Raw(_) => Err(Fault::new("expected a structure, got a primitive argument")),
        }
    }

    /// Check if this is a no-value structured argument
    pub fn is_none(&self) -> bool {
        matches!(self, Argument::Struct(None))
    }
}

impl Serialize for Argument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Argument::Raw(s) => serializer.serialize_str(s),
            Argument::Struct(Some(s)) => s.serialize(serializer),
            Argument::Struct(None) => serializer.serialize_unit(),
        }
    }
}
