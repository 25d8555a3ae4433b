//! Log output for the CLI.
//!
//! Logs go to stderr so stdout stays clean for tables and JSON.

use tracing_subscriber::EnvFilter;

/// Create an environment filter based on verbosity level.
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("podtunnel=warn,podtunnel_core=warn"),
            1 => EnvFilter::new("podtunnel=info,podtunnel_core=info"),
            2 => EnvFilter::new("podtunnel=debug,podtunnel_core=debug"),
            _ => EnvFilter::new("podtunnel=trace,podtunnel_core=trace"),
        }
    }
}

pub fn init_logging(verbosity: u8) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(create_env_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(verbosity >= 2)
        .try_init();
}
