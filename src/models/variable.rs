// Typed process variables - the data tasks read and write

//! # Variables
//!
//! A [`Variable`] is a named, typed value stored in an instance's variable
//! store and carried inside messages. The type is fixed at creation; reads
//! through another type apply a defined coercion instead of failing.
//!
//! ## Coercion table
//!
//! | from \ to | int          | bool       | string      | float        | time          |
//! |-----------|--------------|------------|-------------|--------------|---------------|
//! | int       | -            | `!= 0`     | decimal     | numeric      | UnixMilli     |
//! | bool      | 1 / 0        | -          | `true/false`| 1.0 / 0.0    | error         |
//! | string    | parse        | non-empty  | -           | parse        | RFC 3339      |
//! | float     | truncate     | `!= 0.0`   | fixed       | -            | UnixMilli     |
//! | time      | UnixMilli    | non-epoch  | RFC 3339    | UnixMilli    | -             |
//!
//! Unparseable strings are errors, never silent zeros.
//!
//! ## Rust Learning Notes:
//!
//! ### Sum Types Instead of Pre-cast Fields
//! [`Value`] is an enum, so a variable holds exactly one representation and
//! the compiler forces every reader to handle every type.
//!
//! ### Serde Representation Structs
//! The wire form (one slot per type plus a `var_type` tag) differs from the
//! in-memory enum. `#[serde(into = ..., try_from = ...)]` routes
//! (de)serialization through a plain struct that mirrors the wire form.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, ThresherError};

/// Default number of fractional digits used when formatting floats
pub const DEFAULT_PRECISION: u8 = 2;

/// Variable type tag, serialized as the numeric `var_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum VarType {
    Int = 0,
    Bool = 1,
    Str = 2,
    Float = 3,
    Time = 4,
}

impl From<VarType> for u8 {
    fn from(t: VarType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for VarType {
    type Error = ThresherError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(VarType::Int),
            1 => Ok(VarType::Bool),
            2 => Ok(VarType::Str),
            3 => Ok(VarType::Float),
            4 => Ok(VarType::Time),
            other => Err(ThresherError::Message(format!("unknown var_type {}", other))),
        }
    }
}

impl std::fmt::Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VarType::Int => "int",
            VarType::Bool => "bool",
            VarType::Str => "string",
            VarType::Float => "float",
            VarType::Time => "time",
        };
        write!(f, "{}", name)
    }
}

/// A single typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Float(f64),
    Time(DateTime<Utc>),
}

fn conversion(from: VarType, to: VarType, reason: impl Into<String>) -> ThresherError {
    ThresherError::Conversion {
        from: from.to_string(),
        to: to.to_string(),
        reason: reason.into(),
    }
}

fn time_from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion(VarType::Int, VarType::Time, format!("{} ms out of range", ms)))
}

impl Value {
    pub fn var_type(&self) -> VarType {
        match self {
            Value::Int(_) => VarType::Int,
            Value::Bool(_) => VarType::Bool,
            Value::Str(_) => VarType::Str,
            Value::Float(_) => VarType::Float,
            Value::Time(_) => VarType::Time,
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Str(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .or_else(|_| s.parse::<f64>().map_err(|e| e.to_string()).and_then(float_to_int))
                    .map_err(|e| conversion(VarType::Str, VarType::Int, e))
            }
            Value::Float(f) => {
                float_to_int(*f).map_err(|e| conversion(VarType::Float, VarType::Int, e))
            }
            Value::Time(t) => Ok(t.timestamp_millis()),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Float(f) => *f != 0.0,
            Value::Time(t) => t.timestamp_millis() != 0 || t.timestamp_subsec_nanos() != 0,
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| conversion(VarType::Str, VarType::Float, e.to_string())),
            Value::Float(f) => Ok(*f),
            Value::Time(t) => Ok(t.timestamp_millis() as f64),
        }
    }

    /// String form; floats use `precision` fractional digits
    pub fn as_string(&self, precision: u8) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s.clone(),
            Value::Float(f) => format!("{:.*}", precision as usize, f),
            Value::Time(t) => t.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }

    pub fn as_time(&self) -> Result<DateTime<Utc>> {
        match self {
            Value::Int(i) => time_from_millis(*i),
            Value::Bool(_) => Err(conversion(VarType::Bool, VarType::Time, "no time representation")),
            Value::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| conversion(VarType::Str, VarType::Time, e.to_string())),
            Value::Float(f) => float_to_int(*f)
                .map_err(|e| conversion(VarType::Float, VarType::Time, e))
                .and_then(time_from_millis),
            Value::Time(t) => Ok(*t),
        }
    }

    /// Convert into a value of type `to`
    pub fn coerce(&self, to: VarType) -> Result<Value> {
        Ok(match to {
            VarType::Int => Value::Int(self.as_int()?),
            VarType::Bool => Value::Bool(self.as_bool()),
            VarType::Str => Value::Str(self.as_string(DEFAULT_PRECISION)),
            VarType::Float => Value::Float(self.as_float()?),
            VarType::Time => Value::Time(self.as_time()?),
        })
    }
}

fn float_to_int(f: f64) -> std::result::Result<i64, String> {
    if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Ok(f.trunc() as i64)
    } else {
        Err(format!("{} is outside the int64 range", f))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

/// Named typed variable
///
/// The name is unique within a variable store or message. The type is fixed
/// by the value the variable was created with; [`Variable::update`] rejects
/// values of another type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "VariableRepr", try_from = "VariableRepr")]
pub struct Variable {
    pub name: String,
    value: Value,
    pub precision: u8,
}

impl Variable {
    pub fn new<S: Into<String>, V: Into<Value>>(name: S, value: V) -> Self {
        Variable {
            name: name.into(),
            value: value.into(),
            precision: DEFAULT_PRECISION,
        }
    }

    pub fn int<S: Into<String>>(name: S, v: i64) -> Self {
        Self::new(name, Value::Int(v))
    }

    pub fn bool<S: Into<String>>(name: S, v: bool) -> Self {
        Self::new(name, Value::Bool(v))
    }

    pub fn string<S: Into<String>, V: Into<String>>(name: S, v: V) -> Self {
        Self::new(name, Value::Str(v.into()))
    }

    pub fn float<S: Into<String>>(name: S, v: f64) -> Self {
        Self::new(name, Value::Float(v))
    }

    pub fn time<S: Into<String>>(name: S, v: DateTime<Utc>) -> Self {
        Self::new(name, Value::Time(v))
    }

    /// Builder-style precision override
    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    pub fn var_type(&self) -> VarType {
        self.value.var_type()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn int_value(&self) -> Result<i64> {
        self.value.as_int()
    }

    pub fn bool_value(&self) -> bool {
        self.value.as_bool()
    }

    pub fn string_value(&self) -> String {
        self.value.as_string(self.precision)
    }

    pub fn float_value(&self) -> Result<f64> {
        self.value.as_float()
    }

    pub fn time_value(&self) -> Result<DateTime<Utc>> {
        self.value.as_time()
    }

    /// Read the value as `ty`, applying the coercion table
    pub fn read_as(&self, ty: VarType) -> Result<Value> {
        if ty == VarType::Str {
            return Ok(Value::Str(self.string_value()));
        }
        self.value.coerce(ty)
    }

    /// Replace the value; the new value must have the same type
    pub fn update<V: Into<Value>>(&mut self, value: V) -> Result<()> {
        let value = value.into();
        if value.var_type() != self.var_type() {
            return Err(ThresherError::TypeMismatch {
                name: self.name.clone(),
                expected: self.var_type().to_string(),
                actual: value.var_type().to_string(),
            });
        }
        self.value = value;
        Ok(())
    }

    /// Display form used by output tasks
    pub fn formatted(&self) -> String {
        self.string_value()
    }
}

/// Wire form of a variable: a type tag plus one slot per type
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VariableRepr {
    name: String,
    var_type: VarType,
    #[serde(default = "default_precision")]
    precision: u8,
    value: ValueRepr,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ValueRepr {
    int: i64,
    bool: bool,
    string: String,
    float: f64,
    time: DateTime<Utc>,
}

fn default_precision() -> u8 {
    DEFAULT_PRECISION
}

impl From<Variable> for VariableRepr {
    fn from(v: Variable) -> Self {
        let var_type = v.var_type();
        let mut value = ValueRepr::default();
        match v.value {
            Value::Int(i) => value.int = i,
            Value::Bool(b) => value.bool = b,
            Value::Str(s) => value.string = s,
            Value::Float(f) => value.float = f,
            Value::Time(t) => value.time = t,
        }
        VariableRepr {
            name: v.name,
            var_type,
            precision: v.precision,
            value,
        }
    }
}

impl TryFrom<VariableRepr> for Variable {
    type Error = ThresherError;

    fn try_from(r: VariableRepr) -> Result<Self> {
        if r.name.is_empty() {
            return Err(ThresherError::Message("variable without a name".to_string()));
        }
        let value = match r.var_type {
            VarType::Int => Value::Int(r.value.int),
            VarType::Bool => Value::Bool(r.value.bool),
            VarType::Str => Value::Str(r.value.string),
            VarType::Float => Value::Float(r.value.float),
            VarType::Time => Value::Time(r.value.time),
        };
        Ok(Variable {
            name: r.name,
            value,
            precision: r.precision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_float_coercion() {
        let v = Variable::int("x", 42);
        assert_eq!(v.float_value().unwrap(), 42.0);
        let f = Variable::float("y", 41.9);
        assert_eq!(f.int_value().unwrap(), 41);
        assert!(Variable::float("big", 1e300).int_value().is_err());
    }

    #[test]
    fn test_bool_coercion() {
        assert!(Variable::int("a", 3).bool_value());
        assert!(!Variable::int("a", 0).bool_value());
        assert!(Variable::string("s", "x").bool_value());
        assert!(!Variable::string("s", "").bool_value());
        assert!(!Variable::time("t", DateTime::<Utc>::default()).bool_value());
        assert!(Variable::time("t", Utc::now()).bool_value());
        assert!(Variable::bool("b", true).time_value().is_err());
    }

    #[test]
    fn test_string_parsing() {
        assert_eq!(Variable::string("s", " 17 ").int_value().unwrap(), 17);
        assert_eq!(Variable::string("s", "2.5").float_value().unwrap(), 2.5);
        assert!(matches!(
            Variable::string("s", "seventeen").int_value(),
            Err(ThresherError::Conversion { .. })
        ));
    }

    #[test]
    fn test_time_coercion() {
        let t = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let v = Variable::time("t", t);
        assert_eq!(v.int_value().unwrap(), 1_700_000_000_123);
        assert_eq!(Variable::int("i", 1_700_000_000_123).time_value().unwrap(), t);

        let s = Variable::string("s", "2024-05-01T10:00:00Z");
        assert_eq!(
            s.time_value().unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_update_requires_same_type() {
        let mut v = Variable::int("x", 1);
        v.update(2i64).unwrap();
        assert_eq!(v.int_value().unwrap(), 2);
        assert!(matches!(v.update("two"), Err(ThresherError::TypeMismatch { .. })));
    }

    #[test]
    fn test_formatting() {
        assert_eq!(Variable::int("x", 10).formatted(), "10");
        assert_eq!(Variable::bool("b", false).formatted(), "false");
        assert_eq!(Variable::float("f", 3.14159).formatted(), "3.14");
        assert_eq!(Variable::float("f", 3.14159).with_precision(4).formatted(), "3.1416");
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(Variable::time("t", t).formatted(), "2024-01-02T03:04:05Z");
    }

    #[test]
    fn test_wire_form() {
        let v = Variable::float("price", 9.5).with_precision(3);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["name"], "price");
        assert_eq!(json["var_type"], 3);
        assert_eq!(json["precision"], 3);
        assert_eq!(json["value"]["float"], 9.5);

        let back: Variable = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_wire_form_rejects_unknown_type() {
        let json = serde_json::json!({
            "name": "x", "var_type": 9, "precision": 2, "value": {}
        });
        assert!(serde_json::from_value::<Variable>(json).is_err());
    }
}
