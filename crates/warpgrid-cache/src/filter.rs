//! Field-wise object filters for `show`.
//!
//! A filter is an object of the same type. An object matches when every
//! field that is set in the filter (differs from the type's `Default`)
//! equals the object's field. Nested structs are compared field by field,
//! so a filter can select on part of a composite key.

use serde::Serialize;
use serde_json::Value;

/// Serialized form of a filter and of the type's default value, prepared
/// once per `show` call.
pub(crate) struct Filter {
    want: Value,
    unset: Value,
}

impl Filter {
    pub(crate) fn new<T: Serialize + Default>(filter: &T) -> Option<Self> {
        let want = serde_json::to_value(filter).ok()?;
        let unset = serde_json::to_value(T::default()).ok()?;
        Some(Self { want, unset })
    }

    pub(crate) fn matches<T: Serialize>(&self, obj: &T) -> bool {
        match serde_json::to_value(obj) {
            Ok(value) => value_matches(&value, &self.want, &self.unset),
            Err(_) => false,
        }
    }
}

/// `unset` is the default value at the same path as `want`.
fn value_matches(obj: &Value, want: &Value, unset: &Value) -> bool {
    if want == unset {
        return true;
    }
    match (obj, want) {
        (Value::Object(obj_fields), Value::Object(want_fields)) => {
            want_fields.iter().all(|(name, want)| {
                let have = obj_fields.get(name).unwrap_or(&Value::Null);
                let unset = unset.get(name).unwrap_or(&Value::Null);
                value_matches(have, want, unset)
            })
        }
        _ => obj == want,
    }
}
