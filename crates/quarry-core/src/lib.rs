//! Configuration loading and the application context shared by every command.

pub mod bootstrap;
pub mod config;

pub use bootstrap::{AppContext, IndexStatus, create_connector, create_provider};
pub use config::Config;
