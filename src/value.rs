//! Normalised property/filter values.
//!
//! Channel metadata and client filter entries both boil down to one of
//! four matcher variants, regardless of the native wire type a
//! connection manager or client declared them with. Narrower integer
//! and character types widen to 64-bit on the way in; see
//! [`Value::widen_from_code`] for the type-code table used by
//! [`crate::registry::descriptor`].

use std::collections::BTreeMap;

/// A normalised channel property or filter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    ObjectPath(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
}

impl Value {
    /// Semantic equality used by the filter matcher: strings and
    /// object paths compare exactly, booleans compare logically, and
    /// integers compare numerically after widening (so a `u32` filter
    /// entry matches an `i64` property holding the same number).
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::ObjectPath(a), Value::ObjectPath(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Int(a), Value::UInt(b)) | (Value::UInt(b), Value::Int(a)) => {
                *a >= 0 && (*a as u64) == *b
            }
            _ => false,
        }
    }

    /// Parse a value given one of the type codes recognised in client
    /// descriptor files: `s` string, `o` object-path, `b` boolean,
    /// `y`/`q`/`u`/`t` unsigned (byte, 16, 32, 64-bit), `n`/`i`/`x`
    /// signed (16, 32, 64-bit).
    pub fn widen_from_code(code: char, raw: &str) -> Option<Value> {
        match code {
            's' => Some(Value::Str(raw.to_string())),
            'o' => Some(Value::ObjectPath(raw.to_string())),
            'b' => raw.parse::<bool>().ok().map(Value::Bool),
            'y' | 'q' | 'u' | 't' => raw.parse::<u64>().ok().map(Value::UInt),
            'n' | 'i' | 'x' => raw.parse::<i64>().ok().map(Value::Int),
            _ => None,
        }
    }
}

/// A channel's property map: string property name to normalised value.
pub type PropertyMap = BTreeMap<String, Value>;
