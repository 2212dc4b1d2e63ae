//! RxP CLI Library
//!
//! Shared functionality for the RxP file transfer tools.

pub mod config;
pub mod fxa;
pub mod stats;

pub use config::{Config, ConfigError, EndpointConfig, ProtocolConfig};
pub use fxa::{FrameEvent, FrameReader, FxaError, Session};
pub use stats::{connection_summary, format_bytes, format_duration};

use tracing_subscriber::EnvFilter;

/// Install the log subscriber; `RUST_LOG` wins over `verbose`
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
