//! Tracing initialisation.
//!
//! The log level from [`ApplicationConfig`] becomes the default directive for
//! this crate; `RUST_LOG` still wins for fine-grained filtering:
//!
//! ```bash
//! RUST_LOG=beamline_devices::device=trace beamline-sim move sample_x 2.5
//! ```

use crate::config::ApplicationConfig;
use tracing_subscriber::EnvFilter;

/// Errors raised while installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// A directive in `RUST_LOG` or the configured level failed to parse.
    #[error("Invalid log directive: {0}")]
    Directive(#[from] tracing_subscriber::filter::ParseError),
    /// A global subscriber was already installed.
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Build the filter: `RUST_LOG` if set, else `beamline_devices=<log_level>`.
pub fn build_filter(application: &ApplicationConfig) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => {
            let directive = format!("beamline_devices={}", application.log_level).parse()?;
            Ok(EnvFilter::new("warn").add_directive(directive))
        }
    }
}

/// Install the global subscriber according to the application config.
///
/// Fails if a global subscriber has already been installed.
pub fn init_from_config(application: &ApplicationConfig) -> Result<(), LoggingError> {
    let filter = build_filter(application)?;
    // stdout is reserved for command output
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match application.log_format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    result.map_err(|e| LoggingError::Install(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_config() {
        let application = ApplicationConfig {
            log_level: "debug".into(),
            ..Default::default()
        };
        let filter = build_filter(&application).unwrap();
        if std::env::var("RUST_LOG").is_err() {
            assert!(filter.to_string().contains("beamline_devices=debug"));
        }
    }
}
