//! Metadata storage layer.
//!
//! Durable file records keyed by content hash.  The
//! [`store::MetadataStore`] trait defines the interface;
//! [`sqlite::SqliteMetadataStore`] is the default implementation and
//! [`memory::MemoryMetadataStore`] backs tests.

pub mod memory;
pub mod sqlite;
pub mod store;
