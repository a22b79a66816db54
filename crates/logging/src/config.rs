//! crates/logging/src/config.rs
//! Log level, output format and the combined configuration.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Level used when neither the configuration nor `RUST_LOG` sets one.
pub const DEFAULT_LEVEL: LogLevel = LogLevel::Info;
/// Output format used by default.
pub const DEFAULT_FORMAT: LogFormat = LogFormat::Full;
/// Whether ANSI colours are enabled by default.
pub const DEFAULT_ANSI: bool = true;

/// Maximum verbosity of emitted events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LogLevel {
    /// Only errors.
    Error,
    /// Errors and warnings.
    Warn,
    /// Lifecycle events.
    #[default]
    Info,
    /// Per-message state transitions.
    Debug,
    /// Byte-level detail.
    Trace,
}

impl LogLevel {
    /// All levels from least to most verbose.
    pub const ALL: [Self; 5] = [Self::Error, Self::Warn, Self::Info, Self::Debug, Self::Trace];

    /// Maps a repeated `-v` count onto a level, starting from `warn`.
    #[must_use]
    pub const fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Warn,
            1 => Self::Info,
            2 => Self::Debug,
            _ => Self::Trace,
        }
    }

    /// The `EnvFilter` directive for this level.
    #[must_use]
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

impl FromStr for LogLevel {
    type Err = ParseLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_directive().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseLogError::Level(s.to_owned()))
    }
}

/// Shape of each emitted line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LogFormat {
    /// Timestamp, level, target, fields and span context.
    #[default]
    Full,
    /// Single-line format without span context.
    Compact,
    /// One JSON object per line. Needs the `json` feature.
    Json,
}

impl LogFormat {
    /// Lowercase name accepted by [`FromStr`].
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogFormat {
    type Err = ParseLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(ParseLogError::Format(s.to_owned())),
        }
    }
}

/// Rejected level or format names.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseLogError {
    /// Unknown level name.
    #[error("unknown log level `{0}` (expected error, warn, info, debug or trace)")]
    Level(String),
    /// Unknown format name.
    #[error("unknown log format `{0}` (expected full, compact or json)")]
    Format(String),
}

/// Subscriber configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LogConfig {
    level: LogLevel,
    format: LogFormat,
    ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            format: DEFAULT_FORMAT,
            ansi: DEFAULT_ANSI,
        }
    }
}

impl LogConfig {
    /// Sets the default level.
    #[must_use]
    pub const fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the output format.
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables or disables ANSI colours.
    #[must_use]
    pub const fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Default level.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }

    /// Output format.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }

    /// Whether ANSI colours are enabled.
    #[must_use]
    pub const fn ansi(&self) -> bool {
        self.ansi
    }
}
