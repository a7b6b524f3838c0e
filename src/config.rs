//! Process-wide runtime configuration
//!
//! Read from the environment once, on first use:
//! - `DGPU_LOG_RUNTIME_CALLS`: integer; non-zero traces every C ABI entry
//!   and exit on stdout
//! - `DGPU_LOG`: `tracing` filter directive for the runtime's logs
//! - `DGPU_RECOVERABLE_ERRORS`: integer; non-zero makes failed C ABI calls
//!   return null and record the error instead of aborting the process

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_CALLS_VAR: &str = "DGPU_LOG_RUNTIME_CALLS";
pub const LOG_FILTER_VAR: &str = "DGPU_LOG";
pub const RECOVERABLE_ERRORS_VAR: &str = "DGPU_RECOVERABLE_ERRORS";

const DEFAULT_FILTER: &str = "warn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Print `"<entry> enter"` / `"<entry> exit"` around ABI calls
    pub log_calls: bool,

    /// Filter directive for the tracing subscriber
    pub log_filter: String,

    /// Failed ABI calls report through the last-error slot instead of aborting
    pub recoverable_errors: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_calls: false,
            log_filter: DEFAULT_FILTER.to_string(),
            recoverable_errors: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_calls = lookup(LOG_CALLS_VAR).is_some_and(|v| parse_flag(&v));
        let log_filter = lookup(LOG_FILTER_VAR)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let recoverable_errors = lookup(RECOVERABLE_ERRORS_VAR).is_some_and(|v| parse_flag(&v));
        Self {
            log_calls,
            log_filter,
            recoverable_errors,
        }
    }

    /// The configuration of this process, read on first call
    pub fn global() -> &'static RuntimeConfig {
        static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();
        CONFIG.get_or_init(RuntimeConfig::from_env)
    }
}

/// Integer switch: leading whitespace, optional sign, then digits; anything
/// else (or nothing) reads as 0
pub fn parse_flag(value: &str) -> bool {
    let value = value.trim_start();
    value
        .strip_prefix(['+', '-'])
        .unwrap_or(value)
        .bytes()
        .take_while(u8::is_ascii_digit)
        .any(|b| b != b'0')
}

/// Install the global tracing subscriber. Returns `false` if one was already
/// installed (by the host application or an earlier call).
pub fn init_logging(filter: &str) -> bool {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|err| {
        eprintln!("dgpu: ignoring invalid log filter `{}`: {}", filter, err);
        EnvFilter::new(DEFAULT_FILTER)
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .is_ok()
}
