use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

/// A single scalar stored in a `log` column. Booleans deserialize as
/// `Integer(0 | 1)`, the way SQLite stores them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Parameter tuple keyed by column name.
pub type Params = BTreeMap<String, ParamValue>;

impl ParamValue {
    /// Parses a command-line literal: integers first, then floats, else text.
    pub fn parse_literal(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return ParamValue::Integer(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return ParamValue::Real(f);
            }
        }
        ParamValue::Text(raw.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => Ok(()),
            ParamValue::Integer(i) => write!(f, "{}", i),
            ParamValue::Real(r) => write!(f, "{:?}", r),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

struct ParamValueVisitor;

impl<'de> Visitor<'de> for ParamValueVisitor {
    type Value = ParamValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("null, a boolean, a number or a string")
    }

    fn visit_unit<E: de::Error>(self) -> Result<ParamValue, E> {
        Ok(ParamValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<ParamValue, E> {
        Ok(ParamValue::Null)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<ParamValue, E> {
        Ok(ParamValue::Integer(i64::from(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ParamValue, E> {
        Ok(ParamValue::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ParamValue, E> {
        Ok(match i64::try_from(v) {
            Ok(i) => ParamValue::Integer(i),
            Err(_) => ParamValue::Real(v as f64),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ParamValue, E> {
        Ok(ParamValue::Real(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ParamValue, E> {
        Ok(ParamValue::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<ParamValue, E> {
        Ok(ParamValue::Text(v))
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ParamValueVisitor)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Real(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl ToSql for ParamValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ParamValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            ParamValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            ParamValue::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            ParamValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl FromSql for ParamValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(ParamValue::Null),
            ValueRef::Integer(i) => Ok(ParamValue::Integer(i)),
            ValueRef::Real(r) => Ok(ParamValue::Real(r)),
            ValueRef::Text(t) => std::str::from_utf8(t)
                .map(|s| ParamValue::Text(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            ValueRef::Blob(_) => Err(FromSqlError::InvalidType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_literal_prefers_integers_then_reals() {
        assert_eq!(ParamValue::parse_literal("32"), ParamValue::Integer(32));
        assert_eq!(ParamValue::parse_literal("0.1"), ParamValue::Real(0.1));
        assert_eq!(ParamValue::parse_literal("1e-3"), ParamValue::Real(0.001));
        assert_eq!(
            ParamValue::parse_literal("adam"),
            ParamValue::Text("adam".to_string())
        );
        assert_eq!(
            ParamValue::parse_literal("inf"),
            ParamValue::Text("inf".to_string())
        );
    }

    #[test]
    fn display_keeps_real_formatting_distinct_from_integers() {
        assert_eq!(ParamValue::Integer(3).to_string(), "3");
        assert_eq!(ParamValue::Real(3.0).to_string(), "3.0");
        assert_eq!(ParamValue::Real(0.25).to_string(), "0.25");
        assert_eq!(ParamValue::Null.to_string(), "");
    }

    #[test]
    fn yaml_scalars_deserialize_with_booleans_as_integers() {
        let v: Vec<ParamValue> =
            serde_yaml::from_str("[1, -2, 0.5, name, ~, true, false]").expect("yaml");
        assert_eq!(
            v,
            vec![
                ParamValue::Integer(1),
                ParamValue::Integer(-2),
                ParamValue::Real(0.5),
                ParamValue::Text("name".to_string()),
                ParamValue::Null,
                ParamValue::Integer(1),
                ParamValue::Integer(0),
            ]
        );
    }
}
