//! HTTP service mode.
//!
//! Exposes the backup cycle as two endpoints meant to be driven by an
//! external scheduler: `/create` asks the cloud service to start an export
//! task, `/download` streams a finished backup straight into the configured
//! storage. Splitting the cycle keeps each request reasonably short, an
//! export can take hours and no sane HTTP client waits that long.

pub mod routes;
pub mod server;

pub use server::ApiServer;
