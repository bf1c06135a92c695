//! redb table definitions for the WarpGrid backing store.
//!
//! Object values use `&str` keys and `&[u8]` values (JSON-serialized).
//! Keys follow the pattern `{Type}/{key_string}`; see [`crate::keys`].

use redb::TableDefinition;

/// Object values keyed by `{Type}/{key_string}`.
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

/// Per-key `(version, mod_revision)` metadata, same keys as [`OBJECTS`].
pub const OBJECT_META: TableDefinition<&str, (u64, u64)> = TableDefinition::new("object_meta");

/// Store-wide counters.
pub const STORE_META: TableDefinition<&str, u64> = TableDefinition::new("store_meta");

/// Key in [`STORE_META`] holding the last committed revision.
pub const REVISION_KEY: &str = "revision";
