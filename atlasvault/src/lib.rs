pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod pulse;
pub mod runner;
pub mod secret;
pub mod source;
pub mod uploader;

pub use config::Config;
pub use error::{Error, Result};
