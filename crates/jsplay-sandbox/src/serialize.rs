//! Walks live V8 values into [`SerializedValue`] trees.
//!
//! The walk is total. Property reads run under a `TryCatch`, so a throwing
//! getter or proxy trap turns into an inline error marker for that field
//! and the rest of the value survives.

use deno_core::v8;

use crate::value::{
    ErrorValue, SerializedValue, CIRCULAR_REFERENCE, INVALID_DATE, MAX_DEPTH_EXCEEDED,
};

/// Deepest array/object nesting walked before substituting a marker.
pub const MAX_DEPTH: usize = 64;

/// Serialize `value` into plain data.
pub fn serialize<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> SerializedValue {
    let mut walker = Walker {
        ancestors: Vec::new(),
    };
    walker.walk(scope, value, 0)
}

/// Render a thrown value as `Name: message` (or its string conversion).
pub fn describe_exception<'s>(
    scope: &mut v8::HandleScope<'s>,
    exception: v8::Local<'s, v8::Value>,
) -> String {
    match serialize(scope, exception) {
        SerializedValue::Error(ErrorValue::Details { name, message, .. }) => {
            if message.is_empty() {
                name
            } else {
                format!("{name}: {message}")
            }
        }
        other => crate::value::stringify_for_console(&other),
    }
}

struct Walker<'s> {
    /// Arrays and objects on the path from the root to the current value.
    ancestors: Vec<v8::Local<'s, v8::Value>>,
}

impl<'s> Walker<'s> {
    fn walk(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> SerializedValue {
        if value.is_undefined() {
            return SerializedValue::Undefined;
        }
        if value.is_null() {
            return SerializedValue::Null;
        }
        if value.is_function() {
            return match guarded(scope, |scope| value.to_string(scope)) {
                Ok(source) => SerializedValue::Function(source.to_rust_string_lossy(scope)),
                Err(reason) => SerializedValue::marker(reason),
            };
        }
        if value.is_symbol() {
            return SerializedValue::Symbol(symbol_rendering(scope, value));
        }
        if value.is_big_int() {
            return SerializedValue::BigInt(display(scope, value));
        }
        if value.is_string() {
            return SerializedValue::String(display(scope, value));
        }
        if value.is_number() {
            return SerializedValue::Number(value.number_value(scope).unwrap_or(f64::NAN));
        }
        if value.is_boolean() {
            return SerializedValue::Boolean(value.is_true());
        }
        if value.is_date() {
            return SerializedValue::Date(date_rendering(scope, value));
        }
        if value.is_native_error() {
            return self.error(scope, value);
        }
        if value.is_array() || value.is_object() {
            if self.ancestors.iter().any(|a| a.strict_equals(value)) {
                return SerializedValue::marker(CIRCULAR_REFERENCE);
            }
            if depth >= MAX_DEPTH {
                return SerializedValue::marker(MAX_DEPTH_EXCEEDED);
            }
            self.ancestors.push(value);
            let walked = if value.is_array() {
                self.array(scope, value, depth)
            } else {
                self.object(scope, value, depth)
            };
            self.ancestors.pop();
            return walked;
        }
        // Remaining primitives have no dedicated tag
        SerializedValue::String(display(scope, value))
    }

    fn array(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> SerializedValue {
        let Ok(array) = v8::Local::<v8::Array>::try_from(value) else {
            return SerializedValue::Array(Vec::new());
        };
        let len = array.length();
        let mut items = Vec::with_capacity(len as usize);
        for index in 0..len {
            let item = match guarded(scope, |scope| array.get_index(scope, index)) {
                Ok(item) => self.walk(scope, item, depth + 1),
                Err(reason) => SerializedValue::marker(reason),
            };
            items.push(item);
        }
        SerializedValue::Array(items)
    }

    fn object(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> SerializedValue {
        let Ok(object) = v8::Local::<v8::Object>::try_from(value) else {
            return SerializedValue::Object(Default::default());
        };
        let args = v8::GetPropertyNamesArgs {
            key_conversion: v8::KeyConversionMode::ConvertToString,
            ..Default::default()
        };
        let names = match guarded(scope, |scope| object.get_own_property_names(scope, args)) {
            Ok(names) => names,
            Err(reason) => return SerializedValue::marker(reason),
        };

        let mut fields = std::collections::BTreeMap::new();
        for index in 0..names.length() {
            let Some(key) = names.get_index(scope, index) else {
                continue;
            };
            let name = display(scope, key);
            let field = match guarded(scope, |scope| object.get(scope, key)) {
                Ok(field) => self.walk(scope, field, depth + 1),
                Err(reason) => SerializedValue::marker(reason),
            };
            fields.insert(name, field);
        }
        SerializedValue::Object(fields)
    }

    fn error(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> SerializedValue {
        let Ok(object) = v8::Local::<v8::Object>::try_from(value) else {
            return SerializedValue::marker("unreadable error");
        };
        let name = read_string_field(scope, object, "name").unwrap_or_else(|| "Error".into());
        let message = read_string_field(scope, object, "message").unwrap_or_default();
        let stack = read_string_field(scope, object, "stack");
        SerializedValue::Error(ErrorValue::Details {
            name,
            message,
            stack,
        })
    }
}

/// Run `read` under a `TryCatch`, turning an empty result into the text of
/// whatever was thrown.
fn guarded<'s, T>(
    scope: &mut v8::HandleScope<'s>,
    read: impl FnOnce(&mut v8::HandleScope<'s>) -> Option<T>,
) -> Result<T, String> {
    let tc = &mut v8::TryCatch::new(scope);
    match read(tc) {
        Some(value) => Ok(value),
        None => Err(exception_text(tc)),
    }
}

fn exception_text(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    if tc.has_terminated() {
        return "execution terminated".into();
    }
    match tc.exception() {
        Some(exception) => {
            let text = exception
                .to_string(tc)
                .map(|s| s.to_rust_string_lossy(tc))
                .unwrap_or_default();
            if text.is_empty() {
                "exception while reading value".into()
            } else {
                text
            }
        }
        None => "value could not be read".into(),
    }
}

/// `String(value)`, or an empty string if the conversion throws.
fn display<'s>(scope: &mut v8::HandleScope<'s>, value: v8::Local<'s, v8::Value>) -> String {
    match guarded(scope, |scope| value.to_string(scope)) {
        Ok(text) => text.to_rust_string_lossy(scope),
        Err(_) => String::new(),
    }
}

fn read_string_field<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    field: &str,
) -> Option<String> {
    let key = v8::String::new(scope, field)?;
    let value = guarded(scope, |scope| object.get(scope, key.into())).ok()?;
    if value.is_undefined() {
        return None;
    }
    Some(display(scope, value))
}

fn symbol_rendering<'s>(scope: &mut v8::HandleScope<'s>, value: v8::Local<'s, v8::Value>) -> String {
    let Ok(symbol) = v8::Local::<v8::Symbol>::try_from(value) else {
        return "Symbol()".into();
    };
    let description = symbol.description(scope);
    if description.is_undefined() {
        "Symbol()".into()
    } else {
        format!("Symbol({})", display(scope, description))
    }
}

/// The date's own `toISOString()`, which covers extended years
/// (`+275760-09-13T00:00:00.000Z`) the way the engine writes them.
fn date_rendering<'s>(scope: &mut v8::HandleScope<'s>, value: v8::Local<'s, v8::Value>) -> String {
    let valid = v8::Local::<v8::Date>::try_from(value)
        .map(|date| date.value_of().is_finite())
        .unwrap_or(false);
    if !valid {
        return INVALID_DATE.into();
    }
    let iso = guarded(scope, |scope| {
        let object = value.to_object(scope)?;
        let key = v8::String::new(scope, "toISOString")?;
        let method = object.get(scope, key.into())?;
        let method = v8::Local::<v8::Function>::try_from(method).ok()?;
        method.call(scope, value, &[])
    });
    match iso {
        Ok(text) if text.is_string() => display(scope, text),
        _ => INVALID_DATE.into(),
    }
}
