//! Logging setup
//!
//! Logs go to `config.log_file` when set, stderr otherwise.
//! `RUST_LOG` replaces the default filter entirely.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use snow_core::Config;

fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "warn" };
    EnvFilter::new(format!("snow_core={},snow_cli={}", level, level))
}

/// Initialize the global subscriber (ignored if one is already set)
pub fn init(config: &Config, verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

    match &config.log_file {
        Some(path) => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not open log file {:?}: {}", path, e);
                    return;
                }
            };
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }

    debug!(log_file = ?config.log_file, "Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        let quiet = default_filter(false).to_string();
        assert!(quiet.contains("snow_core=warn"));
        assert!(quiet.contains("snow_cli=warn"));

        let verbose = default_filter(true).to_string();
        assert!(verbose.contains("snow_core=debug"));
        assert!(verbose.contains("snow_cli=debug"));
    }
}
