//! Object-store gateways.
//!
//! Abstraction over the remote object store's multipart protocol:
//! begin, upload-part, complete, abort.

pub mod aws;
pub mod backend;
pub mod memory;
