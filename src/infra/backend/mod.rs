//! Concrete [`BackendApi`](crate::services::backend_api::BackendApi) implementations.

mod http;
mod memory;

pub use http::HttpBackend;
pub use memory::InMemoryBackend;
