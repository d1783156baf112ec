//! Conversion between field-snapshot JSON values and `SQLite` values

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};

use crate::error::{Error, Result};
use crate::models::{Column, ColumnType};

/// Convert a snapshot value into the storage representation of `column`.
pub fn to_sql(column: Column, value: &Value) -> Result<SqlValue> {
    let invalid = || {
        Error::MalformedMessage(format!(
            "value {value} is not valid for column '{}'",
            column.name
        ))
    };

    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    match column.ty {
        ColumnType::Text => match value {
            Value::String(text) => Ok(SqlValue::Text(text.clone())),
            Value::Number(number) => Ok(SqlValue::Text(number.to_string())),
            _ => Err(invalid()),
        },
        ColumnType::Integer => match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(round_to_i64))
                .map(SqlValue::Integer)
                .ok_or_else(invalid),
            Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
            _ => Err(invalid()),
        },
        ColumnType::Real => value.as_f64().map(SqlValue::Real).ok_or_else(invalid),
        ColumnType::Bool => match value {
            Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
            Value::Number(number) => Ok(SqlValue::Integer(i64::from(
                number.as_f64().is_some_and(|n| n != 0.0),
            ))),
            _ => Err(invalid()),
        },
    }
}

/// Convert a stored value back into its snapshot representation.
pub fn from_sql(ty: ColumnType, value: ValueRef<'_>) -> Value {
    match (ty, value) {
        (_, ValueRef::Null) => Value::Null,
        (ColumnType::Bool, ValueRef::Integer(flag)) => Value::Bool(flag != 0),
        (ColumnType::Real, ValueRef::Integer(number)) => {
            #[allow(clippy::cast_precision_loss)]
            let number = number as f64;
            Number::from_f64(number).map_or(Value::Null, Value::Number)
        }
        (_, ValueRef::Integer(number)) => Value::Number(number.into()),
        (_, ValueRef::Real(number)) => Number::from_f64(number).map_or(Value::Null, Value::Number),
        (_, ValueRef::Text(text)) => Value::String(String::from_utf8_lossy(text).into_owned()),
        (_, ValueRef::Blob(_)) => Value::Null,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn round_to_i64(value: f64) -> i64 {
    value.round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NAME: Column = Column {
        name: "name",
        ty: ColumnType::Text,
    };
    const DURATION: Column = Column {
        name: "duration_ms",
        ty: ColumnType::Integer,
    };
    const DONE: Column = Column {
        name: "is_completed",
        ty: ColumnType::Bool,
    };

    #[test]
    fn test_to_sql_coerces_numbers() {
        assert_eq!(
            to_sql(DURATION, &json!(12.6)).unwrap(),
            SqlValue::Integer(13)
        );
        assert_eq!(to_sql(DONE, &json!(1)).unwrap(), SqlValue::Integer(1));
        assert_eq!(to_sql(NAME, &Value::Null).unwrap(), SqlValue::Null);
    }

    #[test]
    fn test_to_sql_rejects_structured_values() {
        assert!(matches!(
            to_sql(NAME, &json!({"nested": true})),
            Err(Error::MalformedMessage(_))
        ));
        assert!(to_sql(DURATION, &json!("soon")).is_err());
    }

    #[test]
    fn test_from_sql_restores_bools() {
        assert_eq!(
            from_sql(ColumnType::Bool, ValueRef::Integer(1)),
            Value::Bool(true)
        );
        assert_eq!(
            from_sql(ColumnType::Real, ValueRef::Integer(3)),
            json!(3.0)
        );
    }
}
