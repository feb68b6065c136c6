use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A literal that can be inlined into generated SQL text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Json(Value),
}

impl SqlValue {
    /// Render as a SQLite literal. Text is single-quote escaped, booleans map
    /// to 0/1 and structured JSON is serialized to text.
    #[must_use]
    pub fn to_sql_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(value) => if *value { "1" } else { "0" }.to_string(),
            Self::Integer(value) => value.to_string(),
            Self::Real(value) => {
                if value.is_finite() {
                    let rendered = value.to_string();
                    if rendered.contains(['.', 'e', 'E']) {
                        rendered
                    } else {
                        format!("{rendered}.0")
                    }
                } else {
                    "NULL".to_string()
                }
            }
            Self::Text(value) => quote_literal(value),
            Self::Json(value) => match value {
                Value::String(text) => quote_literal(text),
                other => quote_literal(&other.to_string()),
            },
        }
    }
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Self::Integer(int)
                } else {
                    number.as_f64().map_or(Self::Null, Self::Real)
                }
            }
            Value::String(text) => Self::Text(text.clone()),
            Value::Array(_) | Value::Object(_) => Self::Json(value.clone()),
        }
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        Self::from(&value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Double-quote an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, doubling embedded quotes.
#[must_use]
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
