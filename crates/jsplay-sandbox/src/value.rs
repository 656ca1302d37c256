//! The tagged, acyclic representation of JavaScript values.
//!
//! On the wire every value is `{"type": <tag>, "value": <payload>}`;
//! `undefined` omits the payload. Conversion to and from that shape goes
//! through `serde_json::Value` so the encoding lives in one place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Largest integer a JavaScript number represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Marker reason for an object already on the current path.
pub const CIRCULAR_REFERENCE: &str = "circular reference";

/// Marker reason for nesting past the depth limit.
pub const MAX_DEPTH_EXCEEDED: &str = "maximum depth exceeded";

/// What an unrepresentable date renders as.
pub const INVALID_DATE: &str = "Invalid Date";

/// A JavaScript value converted to plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub enum SerializedValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// A boolean primitive.
    Boolean(bool),
    /// A number primitive, including `NaN` and the infinities.
    Number(f64),
    /// A string primitive.
    String(String),
    /// A bigint, as its decimal digits.
    BigInt(String),
    /// A symbol, rendered as `Symbol(description)`.
    Symbol(String),
    /// A function, rendered as its source text.
    Function(String),
    /// An array, element by element.
    Array(Vec<SerializedValue>),
    /// A date as an ISO-8601 string, or `Invalid Date`.
    Date(String),
    /// An error object or an inline fault marker.
    Error(ErrorValue),
    /// Own enumerable string-keyed properties.
    Object(BTreeMap<String, SerializedValue>),
}

/// Payload of the `error` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorValue {
    /// A real error object.
    Details {
        /// `error.name`
        name: String,
        /// `error.message`
        message: String,
        /// `error.stack`, when it is a string.
        stack: Option<String>,
    },
    /// A placeholder standing in for a value that could not be read.
    Marker(String),
}

impl SerializedValue {
    /// An inline fault marker.
    pub fn marker(reason: impl Into<String>) -> Self {
        Self::Error(ErrorValue::Marker(reason.into()))
    }

    /// The wire tag of this value.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::BigInt(_) => "bigint",
            Self::Symbol(_) => "symbol",
            Self::Function(_) => "function",
            Self::Array(_) => "array",
            Self::Date(_) => "date",
            Self::Error(_) => "error",
            Self::Object(_) => "object",
        }
    }

    /// Project to the JSON a script would see after `JSON.parse(JSON.stringify(v))`,
    /// except that dates stay ISO strings and bigints become their digits.
    ///
    /// `undefined`, functions, symbols and non-finite numbers become `null`.
    pub fn to_plain_json(&self) -> Value {
        match self {
            Self::Undefined | Self::Null | Self::Function(_) | Self::Symbol(_) => Value::Null,
            Self::Boolean(b) => Value::Bool(*b),
            Self::Number(n) => plain_number(*n),
            Self::String(s) | Self::BigInt(s) | Self::Date(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_plain_json).collect()),
            Self::Error(ErrorValue::Details {
                name,
                message,
                stack,
            }) => serde_json::json!({ "name": name, "message": message, "stack": stack }),
            Self::Error(ErrorValue::Marker(reason)) => Value::String(reason.clone()),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_plain_json()))
                    .collect(),
            ),
        }
    }

    /// Build the tagged form of plain JSON data.
    pub fn from_plain_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Boolean(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from_plain_json).collect()),
            Value::Object(fields) => Self::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_plain_json(v)))
                    .collect(),
            ),
        }
    }

    fn to_tagged_json(&self) -> Value {
        let payload = match self {
            Self::Undefined => None,
            Self::Null => Some(Value::Null),
            Self::Boolean(b) => Some(Value::Bool(*b)),
            Self::Number(n) => Some(tagged_number(*n)),
            Self::String(s)
            | Self::BigInt(s)
            | Self::Symbol(s)
            | Self::Function(s)
            | Self::Date(s) => Some(Value::String(s.clone())),
            Self::Array(items) => Some(Value::Array(
                items.iter().map(Self::to_tagged_json).collect(),
            )),
            Self::Error(ErrorValue::Details {
                name,
                message,
                stack,
            }) => Some(serde_json::json!({ "name": name, "message": message, "stack": stack })),
            Self::Error(ErrorValue::Marker(reason)) => Some(Value::String(reason.clone())),
            Self::Object(fields) => Some(Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_tagged_json()))
                    .collect(),
            )),
        };

        let mut obj = Map::new();
        obj.insert("type".into(), Value::String(self.tag().into()));
        if let Some(payload) = payload {
            obj.insert("value".into(), payload);
        }
        Value::Object(obj)
    }

    fn from_tagged_json(value: Value) -> Result<Self, String> {
        let Value::Object(mut obj) = value else {
            return Err("serialized value must be an object".into());
        };
        let tag = match obj.remove("type") {
            Some(Value::String(tag)) => tag,
            _ => return Err("serialized value is missing its \"type\" tag".into()),
        };
        let payload = obj.remove("value").unwrap_or(Value::Null);

        let text = |payload: Value| match payload {
            Value::String(s) => Ok(s),
            other => Err(format!("expected a string payload for '{tag}', got {other}")),
        };

        match tag.as_str() {
            "undefined" => Ok(Self::Undefined),
            "null" => Ok(Self::Null),
            "boolean" => payload
                .as_bool()
                .map(Self::Boolean)
                .ok_or_else(|| "expected a boolean payload".to_string()),
            "number" => parse_tagged_number(&payload).map(Self::Number),
            "string" => text(payload).map(Self::String),
            "bigint" => text(payload).map(Self::BigInt),
            "symbol" => text(payload).map(Self::Symbol),
            "function" => text(payload).map(Self::Function),
            "date" => text(payload).map(Self::Date),
            "array" => match payload {
                Value::Array(items) => items
                    .into_iter()
                    .map(Self::from_tagged_json)
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::Array),
                other => Err(format!("expected an array payload, got {other}")),
            },
            "object" => match payload {
                Value::Object(fields) => fields
                    .into_iter()
                    .map(|(k, v)| Self::from_tagged_json(v).map(|v| (k, v)))
                    .collect::<Result<BTreeMap<_, _>, _>>()
                    .map(Self::Object),
                other => Err(format!("expected an object payload, got {other}")),
            },
            "error" => match payload {
                Value::String(reason) => Ok(Self::marker(reason)),
                Value::Object(fields) => {
                    let field = |key: &str| fields.get(key).and_then(Value::as_str).map(String::from);
                    Ok(Self::Error(ErrorValue::Details {
                        name: field("name").unwrap_or_else(|| "Error".into()),
                        message: field("message").unwrap_or_default(),
                        stack: field("stack"),
                    }))
                }
                other => Err(format!("expected an error payload, got {other}")),
            },
            other => Err(format!("unknown serialized value type '{other}'")),
        }
    }
}

impl From<SerializedValue> for Value {
    fn from(value: SerializedValue) -> Self {
        value.to_tagged_json()
    }
}

impl TryFrom<Value> for SerializedValue {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, <Self as TryFrom<Value>>::Error> {
        Self::from_tagged_json(value)
    }
}

/// Render a value the way the console pane shows it.
///
/// Objects are pretty-printed with `JSON.stringify` member rules. Never
/// fails: an object `JSON.stringify` would throw on (a bigint member, a
/// cycle, a getter that threw) renders as `[Object]`.
pub fn stringify_for_console(value: &SerializedValue) -> String {
    match value {
        SerializedValue::Undefined => "undefined".into(),
        SerializedValue::Null => "null".into(),
        SerializedValue::Boolean(b) => b.to_string(),
        SerializedValue::Number(n) => format_js_number(*n),
        SerializedValue::BigInt(digits) => digits.clone(),
        SerializedValue::String(s)
        | SerializedValue::Symbol(s)
        | SerializedValue::Function(s)
        | SerializedValue::Date(s) => s.clone(),
        SerializedValue::Array(items) => {
            let inner: Vec<String> = items.iter().map(stringify_for_console).collect();
            format!("[{}]", inner.join(", "))
        }
        SerializedValue::Error(ErrorValue::Details { name, message, .. }) => {
            if message.is_empty() {
                name.clone()
            } else {
                format!("{name}: {message}")
            }
        }
        SerializedValue::Error(ErrorValue::Marker(reason)) => format!("[error: {reason}]"),
        SerializedValue::Object(_) => match console_json(value) {
            Ok(Some(json)) => {
                serde_json::to_string_pretty(&json).unwrap_or_else(|_| "[Object]".into())
            }
            _ => "[Object]".into(),
        },
    }
}

/// `JSON.stringify` would throw on this value.
struct NotJson;

/// The JSON `JSON.stringify` produces for a nested value. `None` is a
/// member it skips: dropped from objects, `null` inside arrays.
fn console_json(value: &SerializedValue) -> Result<Option<Value>, NotJson> {
    let json = match value {
        SerializedValue::Undefined | SerializedValue::Function(_) | SerializedValue::Symbol(_) => {
            return Ok(None)
        }
        SerializedValue::BigInt(_) | SerializedValue::Error(ErrorValue::Marker(_)) => {
            return Err(NotJson)
        }
        SerializedValue::Null => Value::Null,
        SerializedValue::Boolean(b) => Value::Bool(*b),
        SerializedValue::Number(n) => plain_number(*n),
        SerializedValue::String(s) => Value::String(s.clone()),
        SerializedValue::Date(s) if s == INVALID_DATE => Value::Null,
        SerializedValue::Date(s) => Value::String(s.clone()),
        // name, message and stack are not own enumerable properties
        SerializedValue::Error(ErrorValue::Details { .. }) => Value::Object(Map::new()),
        SerializedValue::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| Ok(console_json(item)?.unwrap_or(Value::Null)))
                .collect::<Result<_, NotJson>>()?,
        ),
        SerializedValue::Object(fields) => {
            let mut members = Map::new();
            for (key, field) in fields {
                if let Some(json) = console_json(field)? {
                    members.insert(key.clone(), json);
                }
            }
            Value::Object(members)
        }
    };
    Ok(Some(json))
}

/// Format a number the way `String(n)` does.
pub fn format_js_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.into();
    }
    if n == 0.0 {
        return "0".into();
    }
    let abs = n.abs();
    if !(1e-6..1e21).contains(&abs) {
        // JS writes the exponent sign explicitly: 1e+21, 1e-7
        let formatted = format!("{n:e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => formatted,
        };
    }
    if n.fract() == 0.0 {
        return format!("{n:.0}");
    }
    n.to_string()
}

fn tagged_number(n: f64) -> Value {
    if n.is_nan() {
        Value::String("NaN".into())
    } else if n.is_infinite() {
        Value::String(if n > 0.0 { "Infinity" } else { "-Infinity" }.into())
    } else {
        plain_number(n)
    }
}

fn plain_number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn parse_tagged_number(payload: &Value) -> Result<f64, String> {
    match payload {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("number payload out of range: {n}")),
        Value::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => Err(format!("unrecognized number payload '{other}'")),
        },
        other => Err(format!("expected a number payload, got {other}")),
    }
}
