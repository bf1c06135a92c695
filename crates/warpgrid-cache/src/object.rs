//! Traits shared by every cached object type.

use std::fmt;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;
use warpgrid_state::{db_key, parse_db_key};

use crate::error::{CacheError, CacheResult};

/// Identity of a cached object.
///
/// Keys are plain data: comparable, hashable, and serializable. The JSON
/// form of a key is its stable string representation in the store.
pub trait ObjectKey:
    Clone + Eq + Hash + Ord + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> ObjectKey for K where
    K: Clone + Eq + Hash + Ord + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// An object type that can live in an [`ObjectCache`](crate::ObjectCache).
pub trait CacheObject:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Key: ObjectKey;

    /// Type name, used as the store key prefix and in notify ordering.
    const TYPE_NAME: &'static str;

    fn key(&self) -> &Self::Key;
}

/// Stable string form of a key (canonical JSON, fields in declaration order).
pub fn key_string<K: ObjectKey>(key: &K) -> CacheResult<String> {
    serde_json::to_string(key).map_err(|e| CacheError::Encode {
        typ: "key",
        reason: e.to_string(),
    })
}

/// Full store key for an object.
pub fn object_db_key<T: CacheObject>(key: &T::Key) -> CacheResult<String> {
    Ok(db_key(T::TYPE_NAME, &key_string(key)?))
}

/// Decode a stored value.
pub fn decode_object<T: CacheObject>(value: &[u8]) -> CacheResult<T> {
    serde_json::from_slice(value).map_err(|e| CacheError::Decode {
        typ: T::TYPE_NAME,
        reason: e.to_string(),
    })
}

/// Recover the object key from a full store key.
pub fn parse_object_key<T: CacheObject>(db_key: &str) -> CacheResult<T::Key> {
    let (_, key) = parse_db_key(db_key);
    serde_json::from_str(key).map_err(|e| CacheError::Decode {
        typ: T::TYPE_NAME,
        reason: format!("key {key}: {e}"),
    })
}

/// Outcome of an [`ObjectCache::update_mod_func`](crate::ObjectCache::update_mod_func)
/// closure.
#[derive(Debug)]
pub enum Modify<T, E> {
    /// Store this value.
    Apply(T),
    /// Leave the cache untouched; not an error.
    Unchanged,
    /// Leave the cache untouched and return this error to the caller.
    Reject(E),
}
