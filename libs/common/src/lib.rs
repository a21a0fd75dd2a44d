//! Shared plumbing for canbench crates
//!
//! - logging (console + daily file)
//! - layered configuration loading
//! - hex formatting of ids and payloads
//! - shutdown signal handling

pub mod config_loader;
pub mod hex;
pub mod logging;
pub mod shutdown;

pub use serde;
pub use tokio;
