//! Embeddings service facade and HTTP transport.
//!
//! Provides:
//! - `EmbeddingsService`: every API operation as a thin pass-through to the
//!   model manager, the query builder and the document store
//! - `StorageMirror`: model load state mirrored into `system_models`
//! - `SearchNotifier`: best-effort index-config push to the search service
//! - JSON routes over axum with graceful shutdown

pub mod api;
pub mod error;
pub mod mirror;
pub mod notifier;
pub mod server;
pub mod service;

pub use error::ServiceError;
pub use mirror::StorageMirror;
pub use notifier::SearchNotifier;
pub use server::{router, run_server, run_server_with_shutdown};
pub use service::{EmbeddingsService, ServiceInfo};
