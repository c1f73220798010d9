//! Configuration module

pub mod cli;
pub mod client_config;
pub mod test_hooks;
pub mod tls_config;

pub use cli::{CliArgs, OutputFormat};
pub use client_config::{ClientConfig, Credentials, ServerLocation, MIN_ACK_INTERVAL};
pub use test_hooks::TestHooks;
pub use tls_config::TlsConfig;
