//! Mapping between endpoint schemas, JSON values, and `DuckDB` columns.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use vmhub_pipeline_models::{FieldMode, FieldType, SchemaField};

/// A JSON value converted to what gets bound for a column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

/// `DuckDB` column type for a schema field.
///
/// Nested and repeated fields are stored as JSON text.
#[must_use]
pub fn column_type(field: &SchemaField) -> &'static str {
    if field.is_nested() {
        return "VARCHAR";
    }
    match field.field_type {
        FieldType::String | FieldType::Record => "VARCHAR",
        FieldType::Integer => "BIGINT",
        FieldType::Float => "DOUBLE",
        FieldType::Numeric => "DECIMAL(38, 9)",
        FieldType::Boolean => "BOOLEAN",
        FieldType::Timestamp | FieldType::Datetime => "TIMESTAMP",
        FieldType::Date => "DATE",
    }
}

/// Placeholder for a field in a multi-row `VALUES` list.
///
/// Temporal and decimal values are bound as text and cast explicitly.
#[must_use]
pub fn placeholder(field: &SchemaField) -> String {
    match column_type(field) {
        ty @ ("DECIMAL(38, 9)" | "TIMESTAMP" | "DATE") => format!("CAST(? AS {ty})"),
        _ => "?".to_string(),
    }
}

/// Double-quotes an identifier for SQL.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Converts `value` to the bound representation of `field`.
///
/// Missing or `null` values become [`SqlValue::Null`]; required-ness is
/// checked by validation, not here.
///
/// # Errors
///
/// Returns a human-readable message if the value does not conform to the
/// field's type.
pub fn coerce(field: &SchemaField, value: Option<&Value>) -> Result<SqlValue, String> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(SqlValue::Null);
    };

    if field.is_nested() {
        return Ok(SqlValue::Text(value.to_string()));
    }

    coerce_scalar(field.field_type, value).map_err(|expected| {
        format!("{}: expected {expected}, got {value}", field.name)
    })
}

/// Converts one non-null scalar. The error is the expected type name.
fn coerce_scalar(field_type: FieldType, value: &Value) -> Result<SqlValue, &'static str> {
    match field_type {
        FieldType::String => match value {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
            Value::Bool(b) => Ok(SqlValue::Text(b.to_string())),
            _ => Err("a string"),
        },
        FieldType::Integer => match value {
            Value::Number(n) => n.as_i64().map(SqlValue::Integer).ok_or("an integer"),
            Value::String(s) => s.trim().parse().map(SqlValue::Integer).map_err(|_| "an integer"),
            _ => Err("an integer"),
        },
        FieldType::Float => match value {
            Value::Number(n) => n.as_f64().map(SqlValue::Float).ok_or("a number"),
            Value::String(s) => s.trim().parse().map(SqlValue::Float).map_err(|_| "a number"),
            _ => Err("a number"),
        },
        FieldType::Numeric => {
            let text = match value {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => return Err(DECIMAL_EXPECTED),
            };
            decimal_text(&text)
                .map(SqlValue::Text)
                .ok_or(DECIMAL_EXPECTED)
        }
        FieldType::Boolean => match value {
            Value::Bool(b) => Ok(SqlValue::Bool(*b)),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(SqlValue::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(SqlValue::Bool(false)),
            _ => Err("a boolean"),
        },
        FieldType::Timestamp | FieldType::Datetime => value
            .as_str()
            .and_then(parse_timestamp)
            .map(|ts| SqlValue::Text(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .ok_or("a timestamp"),
        FieldType::Date => value
            .as_str()
            .and_then(parse_date)
            .map(|d| SqlValue::Text(d.format("%Y-%m-%d").to_string()))
            .ok_or("a date"),
        FieldType::Record => Err("an object"),
    }
}

/// Integer digits a `DECIMAL(38, 9)` column holds.
const DECIMAL_INTEGER_DIGITS: usize = 29;

const DECIMAL_EXPECTED: &str = "a finite decimal with at most 29 integer digits";

/// Normalizes `s` to plain decimal text that casts to `DECIMAL(38, 9)`.
///
/// Exponent notation is expanded. Non-finite values and values with more
/// than [`DECIMAL_INTEGER_DIGITS`] integer digits yield `None`.
fn decimal_text(s: &str) -> Option<String> {
    let s = s.trim();
    let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let is_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());

    let text = if !unsigned.is_empty()
        && int_part.len() + frac_part.len() > 0
        && is_digits(int_part)
        && is_digits(frac_part)
    {
        s.strip_prefix('+').unwrap_or(s).to_string()
    } else {
        let parsed: f64 = s.parse().ok()?;
        if !parsed.is_finite() {
            return None;
        }
        // `Display` for f64 never uses exponent notation.
        format!("{parsed}")
    };

    let digits = text.trim_start_matches('-');
    let integer_digits = digits
        .split('.')
        .next()
        .unwrap_or_default()
        .trim_start_matches('0')
        .len();
    (integer_digits <= DECIMAL_INTEGER_DIGITS).then_some(text)
}

/// Parses the timestamp shapes the API emits into naive UTC.
///
/// Offsets are converted to UTC; timestamps without an offset are taken
/// as-is.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parses a date, accepting a full timestamp and keeping its date part.
#[must_use]
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
}

/// Checks a value against a field, recursing into records and repeated
/// fields. Violations are appended to `out` with `path` as prefix.
pub(crate) fn check_field(field: &SchemaField, value: Option<&Value>, path: &str, out: &mut Vec<String>) {
    let name = if path.is_empty() {
        field.name.clone()
    } else {
        format!("{path}.{}", field.name)
    };

    let Some(value) = value.filter(|v| !v.is_null()) else {
        if field.mode == FieldMode::Required {
            out.push(format!("{name}: required field is missing"));
        }
        return;
    };

    if field.mode == FieldMode::Repeated {
        let Value::Array(items) = value else {
            out.push(format!("{name}: expected an array, got {value}"));
            return;
        };
        for (index, item) in items.iter().enumerate() {
            check_single(field, item, &format!("{name}[{index}]"), out);
        }
        return;
    }

    check_single(field, value, &name, out);
}

fn check_single(field: &SchemaField, value: &Value, name: &str, out: &mut Vec<String>) {
    if field.field_type == FieldType::Record {
        let Value::Object(fields) = value else {
            out.push(format!("{name}: expected an object, got {value}"));
            return;
        };
        for child in &field.fields {
            check_field(child, fields.get(&child.name), name, out);
        }
        return;
    }

    if value.is_null() {
        return;
    }
    if let Err(expected) = coerce_scalar(field.field_type, value) {
        out.push(format!("{name}: expected {expected}, got {value}"));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn field(name: &str, field_type: FieldType) -> SchemaField {
        SchemaField {
            name: name.to_string(),
            field_type,
            mode: FieldMode::Nullable,
            fields: Vec::new(),
        }
    }

    #[test]
    fn accepts_api_timestamp_shapes() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(13, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-01-15T13:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15 13:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T10:30:00-03:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T13:30:00Z"), Some(expected));
        assert!(parse_timestamp("15/01/2024").is_none());
    }

    #[test]
    fn coerces_numeric_strings() {
        assert_eq!(
            coerce(&field("n", FieldType::Integer), Some(&json!("42"))),
            Ok(SqlValue::Integer(42))
        );
        assert_eq!(
            coerce(&field("v", FieldType::Numeric), Some(&json!(10.5))),
            Ok(SqlValue::Text("10.5".to_string()))
        );
        assert!(coerce(&field("n", FieldType::Integer), Some(&json!("abc"))).is_err());
        assert!(coerce(&field("n", FieldType::Integer), Some(&json!(1.5))).is_err());
    }

    #[test]
    fn numeric_rejects_what_decimal_columns_cannot_hold() {
        let valor = field("valorTotal", FieldType::Numeric);
        for bad in [json!("NaN"), json!("inf"), json!("-infinity"), json!(1e30), json!("1e30")] {
            assert!(coerce(&valor, Some(&bad)).is_err(), "{bad} should be rejected");
        }
        assert!(coerce(&valor, Some(&json!("."))).is_err());

        assert_eq!(
            coerce(&valor, Some(&json!(" +12.50 "))),
            Ok(SqlValue::Text("12.50".to_string()))
        );
        assert_eq!(
            coerce(&valor, Some(&json!("1.5e3"))),
            Ok(SqlValue::Text("1500".to_string()))
        );
        let widest = format!("-{}.5", "9".repeat(29));
        assert_eq!(coerce(&valor, Some(&json!(widest.as_str()))), Ok(SqlValue::Text(widest)));
        assert!(coerce(&valor, Some(&json!(format!("1{}", "0".repeat(29))))).is_err());
    }

    #[test]
    fn nested_values_become_json_text() {
        let mut itens = field("itens", FieldType::Record);
        itens.mode = FieldMode::Repeated;
        itens.fields = vec![field("valor", FieldType::Numeric)];
        assert_eq!(column_type(&itens), "VARCHAR");
        assert_eq!(
            coerce(&itens, Some(&json!([{"valor": 1}]))),
            Ok(SqlValue::Text("[{\"valor\":1}]".to_string()))
        );
    }

    #[test]
    fn null_is_null_for_every_type() {
        assert_eq!(coerce(&field("d", FieldType::Date), Some(&Value::Null)), Ok(SqlValue::Null));
        assert_eq!(coerce(&field("d", FieldType::Date), None), Ok(SqlValue::Null));
    }

    #[test]
    fn placeholders_cast_text_bound_types() {
        assert_eq!(placeholder(&field("d", FieldType::Date)), "CAST(? AS DATE)");
        assert_eq!(placeholder(&field("s", FieldType::String)), "?");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
