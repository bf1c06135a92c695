//! Database key layout.
//!
//! One logical namespace per object type: `{Type}/{key_string}`. The
//! schema version marker lives at the bare key [`VERSION_KEY`], outside
//! every object namespace.

/// Reserved key holding the current data model version hash.
pub const VERSION_KEY: &str = "Version";

/// Build the full database key for an object.
pub fn db_key(typ: &str, key_string: &str) -> String {
    format!("{typ}/{key_string}")
}

/// Prefix shared by every object of the given type.
pub fn db_key_prefix(typ: &str) -> String {
    format!("{typ}/")
}

/// Split a database key into its type and key string.
///
/// A key without a `/` is a single-element entry (such as the version
/// marker): the type is the whole key and the key string is empty.
pub fn parse_db_key(key: &str) -> (&str, &str) {
    match key.split_once('/') {
        Some((typ, rest)) => (typ, rest),
        None => (key, ""),
    }
}
