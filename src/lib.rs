pub mod config;
pub mod error;
pub mod fetch;
pub mod geo;
pub mod geofence;
pub mod infra;
pub mod model;
pub mod queue;
pub mod sampler;
pub mod services;
pub mod session;
pub mod stops;
pub mod storage;
pub mod sync;
pub mod trip;
