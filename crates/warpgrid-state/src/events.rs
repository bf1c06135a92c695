//! Change-feed events published by the store after each commit.

use crate::kv::Revision;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Key was written.
    Update,
    /// Key was removed.
    Delete,
    /// A full listing is about to be replayed.
    ListStart,
    /// One entry of a full listing.
    List,
    /// The full listing is complete; anything not listed is gone.
    ListEnd,
}

/// A single change, as seen by cache sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub action: SyncAction,
    /// Full database key. Empty for `ListStart` / `ListEnd`.
    pub key: String,
    /// New value. Empty for deletes and list markers.
    pub value: Vec<u8>,
    /// Revision of the transaction that produced this event.
    pub rev: Revision,
    /// Last-modified revision of the key.
    pub mod_rev: Revision,
    /// More events belonging to the same revision follow.
    pub more_events: bool,
}

impl SyncEvent {
    /// A list marker (`ListStart` or `ListEnd`) at the given revision.
    pub fn marker(action: SyncAction, rev: Revision) -> Self {
        Self {
            action,
            key: String::new(),
            value: Vec::new(),
            rev,
            mod_rev: rev,
            more_events: false,
        }
    }
}
