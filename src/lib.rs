//! ChunkFlow library -- resumable chunked-upload coordination service.
//!
//! This crate provides the core components for running a file-storage
//! frontend that accepts large files as independently-uploaded chunks,
//! deduplicates by content hash, drives a multipart session against a
//! remote object store, and finalizes the object exactly once when all
//! parts have arrived.

use std::sync::Arc;

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod keys;
pub mod metadata;
pub mod metrics;
pub mod server;
pub mod session;

use crate::config::Config;
use crate::coordinator::UploadCoordinator;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The upload coordinator, which owns the session store, the object
    /// store gateway, and the durable metadata store.
    pub coordinator: Arc<UploadCoordinator>,
}
