//! Logging and tracing configuration for FFX Ingest
//!
//! Structured logging through the `tracing` crate. Chain-of-custody events go
//! to the `forensic_audit` target (see [`crate::common::audit`]).
//!
//! # Environment Variable Control
//!
//! Set `RUST_LOG` to control log levels at runtime:
//! ```bash
//! RUST_LOG=debug ffx-ingest csv out.csv                      # All debug logs
//! RUST_LOG=ffx_ingest_lib::engine=trace ffx-ingest csv out.csv
//! RUST_LOG=warn,forensic_audit=info ffx-ingest tool-output dir/  # Audit trail only
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset
///
/// Debug builds and builds with the `debug-logging` feature log at debug.
fn default_directives() -> &'static str {
    if cfg!(any(debug_assertions, feature = "debug-logging")) {
        "ffx_ingest=debug,ffx_ingest_lib=debug,forensic_audit=info"
    } else {
        "ffx_ingest=info,ffx_ingest_lib=info,forensic_audit=info"
    }
}

/// Initialize the logging/tracing system
///
/// Call once at startup. Logs go to stderr so JSON summaries on stdout stay clean.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives()));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact(),
    );

    // Ignore the error if a subscriber is already set
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize logging with file:line and thread ids, everything at trace
pub fn init_verbose() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .pretty(),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Check if debug logging is enabled
#[inline]
pub fn is_debug_enabled() -> bool {
    tracing::enabled!(Level::DEBUG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info};

    #[test]
    fn test_init() {
        init();
        info!("Test log message");
        debug!(key = "value", "Structured log");
        // Second init is a no-op
        init();
    }

    #[test]
    fn test_default_directives_follow_build() {
        let verbose = cfg!(any(debug_assertions, feature = "debug-logging"));
        assert_eq!(default_directives().contains("ffx_ingest_lib=debug"), verbose);
        assert!(default_directives().contains("forensic_audit=info"));
    }
}
