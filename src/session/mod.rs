//! Ephemeral upload-session state.
//!
//! Holds the in-flight coordination state for each transfer (multipart
//! session identity, accumulated parts, finalize gate) in a fast,
//! TTL-capable store, keyed by content hash.

pub mod memory;
pub mod sqlite;
pub mod store;
