pub mod cli;
pub mod config;
pub mod error;
pub mod server;

pub use config::AppConfig;
pub use error::{PeriscopeError, Result};
pub use server::AppServer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
