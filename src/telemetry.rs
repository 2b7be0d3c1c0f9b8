use crate::settings::{ENV_LOG_FORMAT, ENV_LOG_LEVEL};
use std::env;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogOptions {
    pub level: String,
    pub json: bool,
}

impl LogOptions {
    pub fn from_env() -> Self {
        let level = env::var(ENV_LOG_LEVEL)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string());
        let json = env::var(ENV_LOG_FORMAT)
            .map(|v| v.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        Self { level, json }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// level. Output goes to stderr so command output on stdout stays clean.
pub fn init_logging(options: &LogOptions) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .map_err(|e| format!("invalid log level {:?}: {e}", options.level))?;

    let subscriber = tracing_subscriber::registry().with(filter);
    if options.json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| e.to_string())
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_text_at_info() {
        // SAFETY: only this test touches the log variables.
        unsafe {
            env::remove_var(ENV_LOG_LEVEL);
            env::remove_var(ENV_LOG_FORMAT);
        }
        let defaults = LogOptions::from_env();
        assert_eq!(defaults.level, "info");
        assert!(!defaults.json);

        unsafe {
            env::set_var(ENV_LOG_LEVEL, " debug ");
            env::set_var(ENV_LOG_FORMAT, "JSON");
        }
        let custom = LogOptions::from_env();
        assert_eq!(custom.level, "debug");
        assert!(custom.json);

        unsafe {
            env::remove_var(ENV_LOG_LEVEL);
            env::remove_var(ENV_LOG_FORMAT);
        }
    }
}
