//! Log output control.
//!
//! The crate logs through `tracing`. Applications that install their own
//! subscriber keep full control. Otherwise [`set_level`] installs a `fmt`
//! subscriber whose filter can be changed at runtime. When `RUST_LOG` is set
//! it takes precedence over levels set here.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

use crate::core::{Error, Result};

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages.
    Info,
    /// Debug output, including channel attempts.
    Debug,
    /// Everything, including per-frame tracing.
    Trace,
}

impl LogLevel {
    /// Lowercase name, as accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(Error::InvalidArgument),
        }
    }
}

static FILTER: OnceLock<Option<reload::Handle<EnvFilter, Registry>>> = OnceLock::new();

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::new(format!("edgelink={level}"))
}

fn from_env() -> bool {
    std::env::var_os(EnvFilter::DEFAULT_ENV).is_some()
}

fn install(level: LogLevel) -> Option<reload::Handle<EnvFilter, Registry>> {
    let filter = if from_env() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level))
    } else {
        filter_for(level)
    };
    let (layer, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(layer)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    // Someone else owns the global subscriber; leave it alone.
    installed.then_some(handle)
}

/// Set the crate's log level, installing the subscriber on first use.
pub fn set_level(level: LogLevel) -> Result<()> {
    let mut first = false;
    let handle = FILTER.get_or_init(|| {
        first = true;
        install(level)
    });

    if first || from_env() {
        return Ok(());
    }
    match handle {
        Some(handle) => handle
            .reload(filter_for(level))
            .map_err(|_| Error::Unknown),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!("error".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("trace".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!("loud".parse::<LogLevel>(), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_display_roundtrips() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert_eq!(level.to_string().parse::<LogLevel>(), Ok(level));
        }
    }

    // No test calls `set_level`: it installs the process-wide subscriber.
    #[test]
    fn test_filter_targets_crate() {
        for level in [LogLevel::Error, LogLevel::Debug, LogLevel::Trace] {
            let directive = format!("edgelink={level}");
            assert!(EnvFilter::try_new(&directive).is_ok());
            assert_eq!(filter_for(level).to_string(), directive);
        }
    }
}
