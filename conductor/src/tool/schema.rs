//! JSON-schema vocabulary for describing tool signatures.
//!
//! The mapping mirrors how declared parameter types render into schemas:
//! basic types become primitive schemas, optional values become an `anyOf`
//! with null, lists become arrays, maps become objects with
//! `additionalProperties`, fixed choices become an `enum`. Anything the
//! vocabulary cannot express falls back to a string.

use serde_json::{Value, json};

/// `{"type": "string"}`
#[must_use]
pub fn string() -> Value {
    json!({"type": "string"})
}

/// `{"type": "integer"}`
#[must_use]
pub fn integer() -> Value {
    json!({"type": "integer"})
}

/// `{"type": "number"}`
#[must_use]
pub fn number() -> Value {
    json!({"type": "number"})
}

/// `{"type": "boolean"}`
#[must_use]
pub fn boolean() -> Value {
    json!({"type": "boolean"})
}

/// `{"type": "null"}`
#[must_use]
pub fn null() -> Value {
    json!({"type": "null"})
}

/// An optional value: `anyOf` of the inner schema and null.
#[must_use]
pub fn optional(inner: Value) -> Value {
    json!({"anyOf": [inner, {"type": "null"}]})
}

/// An array with typed items.
#[must_use]
pub fn array(items: Value) -> Value {
    json!({"type": "array", "items": items})
}

/// A string-keyed map with typed values.
#[must_use]
pub fn map(values: Value) -> Value {
    json!({"type": "object", "additionalProperties": values})
}

/// A fixed set of allowed values.
#[must_use]
pub fn enumeration(values: &[&str]) -> Value {
    json!({"enum": values})
}

/// Attach a default to a schema; defaulted parameters are not required.
#[must_use]
pub fn with_default(mut schema: Value, default: Value) -> Value {
    if let Some(obj) = schema.as_object_mut() {
        obj.insert("default".to_owned(), default);
    }
    schema
}
