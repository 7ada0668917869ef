pub mod api;
pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod limiter;
pub mod staging;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{DealBackend, State};
pub use config::{BatchConfig, Config};
pub use error::{BackendError, InitPhase};
