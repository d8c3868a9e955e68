//! Element types for homogeneous arrays: the `DType` lattice, the `Value`
//! tagged union, type inference over raw data, and elementwise casting.
//!
//! A column of data is homogeneously typed: every present element shares one
//! `DType`, and absent elements are `Value::Undefined`. `Undefined` and the
//! float NaN are both treated as missing by the aggregation layer.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How many leading elements type inference inspects before giving up.
pub const INFERENCE_PREFIX: usize = 100;

/// Element type of an array.
///
/// `Undefined` is the type of an array with no concrete elements; it unifies
/// with every other dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Int,
    Float,
    Bool,
    Str,
    List,
    Dict,
    Undefined,
}

impl DType {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DType::Int => "int",
            DType::Float => "float",
            DType::Bool => "bool",
            DType::Str => "str",
            DType::List => "list",
            DType::Dict => "dict",
            DType::Undefined => "undefined",
        }
    }

    /// True for dtypes that participate in arithmetic.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, DType::Int | DType::Float)
    }

    /// True for dtypes whose elements carry a length (`item_length`).
    #[must_use]
    pub fn is_sized(&self) -> bool {
        matches!(self, DType::Str | DType::List | DType::Dict)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single array element.
///
/// `Float` payloads may be NaN; NaN counts as missing, compares equal to
/// itself under [`Value::eq`], and hashes through a canonical bit pattern so
/// that hashed containers stay coherent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Undefined,
}

const CANONICAL_NAN: u64 = f64::NAN.to_bits();

fn float_bits(f: f64) -> u64 {
    if f.is_nan() { CANONICAL_NAN } else { f.to_bits() }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_bits(*a) == float_bits(*b),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Undefined, Value::Undefined) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Int(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            Value::Float(v) => {
                1u8.hash(state);
                float_bits(*v).hash(state);
            }
            Value::Bool(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            Value::Str(v) => {
                3u8.hash(state);
                v.hash(state);
            }
            Value::List(v) => {
                4u8.hash(state);
                v.hash(state);
            }
            Value::Dict(v) => {
                5u8.hash(state);
                v.hash(state);
            }
            Value::Undefined => 6u8.hash(state),
        }
    }
}

impl Value {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Value::Int(_) => DType::Int,
            Value::Float(_) => DType::Float,
            Value::Bool(_) => DType::Bool,
            Value::Str(_) => DType::Str,
            Value::List(_) => DType::List,
            Value::Dict(_) => DType::Dict,
            Value::Undefined => DType::Undefined,
        }
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Missing means absent or not-a-number; both are skipped by aggregates.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Undefined => true,
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Truthiness: zero, NaN, empty strings, empty containers and missing
    /// elements are falsy; everything else is truthy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0 && !v.is_nan(),
            Value::Bool(v) => *v,
            Value::Str(v) => !v.is_empty(),
            Value::List(v) => !v.is_empty(),
            Value::Dict(v) => !v.is_empty(),
            Value::Undefined => false,
        }
    }

    /// Numeric view for arithmetic and statistics. Bools widen to 0/1.
    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Value::Int(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            Value::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            other => Err(TypeError::NotNumeric { dtype: other.dtype() }),
        }
    }

    /// Total order used by sorting and extrema. `Undefined` sorts before
    /// everything; NaN sorts before other floats; values of distinct
    /// non-numeric dtypes order by dtype.
    #[must_use]
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => Ordering::Equal,
            (Value::Undefined, _) => Ordering::Less,
            (_, Value::Undefined) => Ordering::Greater,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.total_cmp(y) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Dict(a), Value::Dict(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    match ka.cmp(kb) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                    match va.total_cmp(vb) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => a.dtype().cmp(&b.dtype()),
        }
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

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// An element refused participation in an operation because of its dtype.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("{dtype} values are not numeric")]
    NotNumeric { dtype: DType },
    #[error("operation `{op}` is not defined for {dtype} values")]
    Unsupported { op: &'static str, dtype: DType },
}

/// A value could not be converted to the requested dtype.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CastError {
    #[error("cannot cast {from} to {to}")]
    Unsupported { from: DType, to: DType },
    #[error("cannot parse {text:?} as {to}")]
    Parse { text: String, to: DType },
    #[error("float {value} has no int representation")]
    IntOverflow { value: f64 },
}

/// Infer the dtype of raw data from the first concrete element in its
/// leading [`INFERENCE_PREFIX`] positions. All-missing (or empty) data
/// infers `Undefined`.
#[must_use]
pub fn infer_dtype(values: &[Value]) -> DType {
    values
        .iter()
        .take(INFERENCE_PREFIX)
        .find(|v| !v.is_missing())
        .map_or(DType::Undefined, Value::dtype)
}

fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Undefined,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => {
            Value::List(items.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(entries) => Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .collect(),
        ),
    }
}

fn cast_str(text: &str, target: DType) -> Result<Value, CastError> {
    let parse_err = || CastError::Parse {
        text: text.to_owned(),
        to: target,
    };
    match target {
        DType::Int => text
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| parse_err()),
        DType::Float => text
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| parse_err()),
        DType::Bool => Ok(Value::Bool(!text.is_empty())),
        DType::List => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Array(items)) => {
                Ok(Value::List(items.into_iter().map(json_to_value).collect()))
            }
            _ => Err(parse_err()),
        },
        DType::Dict => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Object(entries)) => Ok(Value::Dict(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, json_to_value(v)))
                    .collect(),
            )),
            _ => Err(parse_err()),
        },
        // Str-to-Str and casts to Undefined never reach here.
        DType::Str | DType::Undefined => Err(parse_err()),
    }
}

/// Convert `value` to `target`, consuming it.
///
/// `Undefined` passes through any cast unchanged. Numeric casts truncate
/// toward zero; string casts parse (ints, floats, JSON arrays and objects);
/// casting to `Str` renders a canonical text form. Everything else is
/// [`CastError::Unsupported`].
pub fn cast_value(value: Value, target: DType) -> Result<Value, CastError> {
    if value.is_undefined() || value.dtype() == target {
        return Ok(value);
    }
    let from = value.dtype();
    if target == DType::Undefined {
        return Err(CastError::Unsupported { from, to: target });
    }
    match (value, target) {
        (Value::Int(v), DType::Float) => Ok(Value::Float(v as f64)),
        (Value::Int(v), DType::Bool) => Ok(Value::Bool(v != 0)),
        (Value::Int(v), DType::Str) => Ok(Value::Str(v.to_string())),
        (Value::Float(v), DType::Int) => {
            let t = v.trunc();
            if v.is_finite() && t >= i64::MIN as f64 && t <= i64::MAX as f64 {
                Ok(Value::Int(t as i64))
            } else {
                Err(CastError::IntOverflow { value: v })
            }
        }
        (Value::Float(v), DType::Bool) => Ok(Value::Bool(v != 0.0 && !v.is_nan())),
        (Value::Float(v), DType::Str) => Ok(Value::Str(format!("{v:?}"))),
        (Value::Bool(v), DType::Int) => Ok(Value::Int(i64::from(v))),
        (Value::Bool(v), DType::Float) => Ok(Value::Float(if v { 1.0 } else { 0.0 })),
        (Value::Bool(v), DType::Str) => Ok(Value::Str(v.to_string())),
        (Value::Str(s), t) => cast_str(&s, t),
        (_, to) => Err(CastError::Unsupported { from, to }),
    }
}

/// Render an element the way plain-text output writes it: strings bare,
/// floats with a decimal point, containers as JSON, missing as the empty
/// string.
#[must_use]
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Float(v) => format!("{v:?}"),
        Value::Bool(v) => v.to_string(),
        Value::Str(v) => v.clone(),
        Value::List(_) | Value::Dict(_) => {
            serde_json::to_string(&value_to_json(value)).unwrap_or_default()
        }
        Value::Undefined => String::new(),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(v) => serde_json::Value::from(*v),
        Value::Float(v) => serde_json::Number::from_f64(*v)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Bool(v) => serde_json::Value::Bool(*v),
        Value::Str(v) => serde_json::Value::String(v.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Dict(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
        Value::Undefined => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: Vec<Value>) -> Value {
        Value::List(items)
    }

    #[test]
    fn infer_picks_first_concrete_element() {
        assert_eq!(
            infer_dtype(&[Value::Undefined, Value::Float(1.5), Value::Int(2)]),
            DType::Float
        );
        assert_eq!(infer_dtype(&[Value::Int(1)]), DType::Int);
    }

    #[test]
    fn infer_all_missing_is_undefined() {
        assert_eq!(infer_dtype(&[]), DType::Undefined);
        assert_eq!(
            infer_dtype(&[Value::Undefined, Value::Float(f64::NAN)]),
            DType::Undefined
        );
    }

    #[test]
    fn nan_is_missing_and_self_equal() {
        let nan = Value::Float(f64::NAN);
        assert!(nan.is_missing());
        assert!(!nan.is_undefined());
        assert_eq!(nan, Value::Float(f64::NAN));
    }

    #[test]
    fn truthiness_table() {
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(-3).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::Float(f64::NAN).is_truthy());
        assert!(Value::Float(0.5).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Str("x".into()).is_truthy());
        assert!(!list(vec![]).is_truthy());
        assert!(list(vec![Value::Int(0)]).is_truthy());
        assert!(!Value::Undefined.is_truthy());
    }

    #[test]
    fn cast_int_to_float_and_back() {
        assert_eq!(
            cast_value(Value::Int(3), DType::Float),
            Ok(Value::Float(3.0))
        );
        assert_eq!(
            cast_value(Value::Float(-2.9), DType::Int),
            Ok(Value::Int(-2))
        );
    }

    #[test]
    fn cast_nonfinite_float_to_int_fails() {
        assert!(matches!(
            cast_value(Value::Float(f64::INFINITY), DType::Int),
            Err(CastError::IntOverflow { .. })
        ));
    }

    #[test]
    fn cast_str_parses_numbers() {
        assert_eq!(
            cast_value(Value::Str(" 42 ".into()), DType::Int),
            Ok(Value::Int(42))
        );
        assert_eq!(
            cast_value(Value::Str("1.5".into()), DType::Float),
            Ok(Value::Float(1.5))
        );
        assert!(matches!(
            cast_value(Value::Str("c".into()), DType::Int),
            Err(CastError::Parse { .. })
        ));
    }

    #[test]
    fn cast_str_parses_json_containers() {
        let got = cast_value(Value::Str("[1,2,3]".into()), DType::List).unwrap();
        assert_eq!(
            got,
            list(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        let got = cast_value(Value::Str(r#"{"a": 1}"#.into()), DType::Dict).unwrap();
        let Value::Dict(d) = got else {
            panic!("expected dict")
        };
        assert_eq!(d.get("a"), Some(&Value::Int(1)));
    }

    #[test]
    fn cast_undefined_passes_through() {
        assert_eq!(
            cast_value(Value::Undefined, DType::Int),
            Ok(Value::Undefined)
        );
    }

    #[test]
    fn cast_containers_only_to_themselves() {
        assert!(matches!(
            cast_value(list(vec![Value::Int(1)]), DType::Int),
            Err(CastError::Unsupported { .. })
        ));
        assert!(matches!(
            cast_value(list(vec![Value::Int(1)]), DType::Bool),
            Err(CastError::Unsupported { .. })
        ));
        let same = list(vec![Value::Int(1)]);
        assert_eq!(cast_value(same.clone(), DType::List), Ok(same));
    }

    #[test]
    fn total_cmp_orders_mixed_numerics() {
        assert_eq!(
            Value::Int(1).total_cmp(&Value::Float(1.5)),
            Ordering::Less
        );
        assert_eq!(
            Value::Float(2.0).total_cmp(&Value::Int(2)),
            Ordering::Equal
        );
        assert_eq!(Value::Undefined.total_cmp(&Value::Int(0)), Ordering::Less);
    }

    #[test]
    fn render_forms() {
        assert_eq!(render_value(&Value::Float(1.0)), "1.0");
        assert_eq!(render_value(&Value::Str("hi".into())), "hi");
        assert_eq!(render_value(&Value::Undefined), "");
        assert_eq!(
            render_value(&list(vec![Value::Int(1), Value::Int(2)])),
            "[1,2]"
        );
    }
}
