//! tracing setup with a reloadable level filter, so the operator can change
//! verbosity over the control topic.

use anyhow::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Verbosity levels accepted by the `log_level` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Map a wire code (`0..=4`) to a level.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Off),
            1 => Some(Self::Error),
            2 => Some(Self::Warn),
            3 => Some(Self::Info),
            4 => Some(Self::Debug),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Error => 1,
            Self::Warn => 2,
            Self::Info => 3,
            Self::Debug => 4,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// Something that can change the process's log verbosity.
pub trait LevelControl {
    fn apply(&self, level: LogLevel) -> anyhow::Result<()>;
}

/// Handle for swapping the active filter at runtime.
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LevelControl for LogControl {
    fn apply(&self, level: LogLevel) -> anyhow::Result<()> {
        self.handle
            .reload(EnvFilter::new(level.directive()))
            .context("failed to reload log filter")
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the `info` default.
pub fn init() -> LogControl {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    LogControl { handle }
}
