//! Command-line configuration.
//!
//! Parses the process arguments into an immutable [`Config`], then applies
//! environment overrides for the realtime endpoint. The API key is never
//! printed by the `Debug` implementation.

use std::ffi::OsString;
use std::fmt;

use clap::Parser;
use thiserror::Error;

use crate::constants::{DEFAULT_REALTIME_HOST, WILDCARD_EVENT};

/// Environment variable overriding the realtime host.
pub const ENV_REALTIME_HOST: &str = "CHANNEL_TAIL_REALTIME_HOST";

/// Environment variable disabling TLS (`1` or `true`), for local servers.
pub const ENV_INSECURE: &str = "CHANNEL_TAIL_INSECURE";

/// Raw command-line surface.
#[derive(Parser, Debug)]
#[command(name = "channel-tail")]
#[command(version)]
#[command(about = "Subscribe to a realtime channel and print its messages")]
struct Cli {
    /// API key for the messaging service
    #[arg(short = 'k', long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Channel to subscribe to
    #[arg(short = 'c', long = "channel", value_name = "NAME")]
    channel: Option<String>,

    /// Only render messages with this event name ("*" renders everything)
    #[arg(short = 'e', long = "event", value_name = "NAME", default_value = WILDCARD_EVENT)]
    event: String,

    /// Suppress verbose diagnostic logging
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Dump raw events and presence updates
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

/// Errors produced while building a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required flag was not given.
    #[error("missing required flag {flag}")]
    Missing {
        /// Long form of the flag.
        flag: &'static str,
    },

    /// A flag was given an empty value.
    #[error("{flag} must not be empty")]
    Empty {
        /// Long form of the flag.
        flag: &'static str,
    },

    /// Clap rejected the arguments, or `--help`/`--version` was requested.
    #[error(transparent)]
    Usage(#[from] clap::Error),
}

impl ConfigError {
    /// The flag this error refers to, if any.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            Self::Missing { flag } | Self::Empty { flag } => Some(flag),
            Self::Usage(_) => None,
        }
    }
}

/// Session configuration, read-only after startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    /// Credential for the messaging service.
    pub api_key: String,
    /// Channel to subscribe to.
    pub channel: String,
    /// Event-name filter; [`WILDCARD_EVENT`] disables filtering.
    pub event_filter: String,
    /// Suppress verbose diagnostic logging.
    pub quiet: bool,
    /// Emit raw event dumps and presence output.
    pub debug: bool,
    /// Realtime endpoint host (optionally `host:port`).
    pub realtime_host: String,
    /// Whether to connect over TLS.
    pub use_tls: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &redact_key(&self.api_key))
            .field("channel", &self.channel)
            .field("event_filter", &self.event_filter)
            .field("quiet", &self.quiet)
            .field("debug", &self.debug)
            .field("realtime_host", &self.realtime_host)
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Keep the public key name (`app.key`) and hide the secret.
fn redact_key(key: &str) -> String {
    match key.split_once(':') {
        Some((name, _)) => format!("{name}:***"),
        None => "***".to_string(),
    }
}

impl Config {
    /// Builds a configuration from process-style arguments (program name first).
    ///
    /// Environment overrides are applied from the real process environment.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut config = Self::parse_args(args)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parses arguments without consulting the environment.
    pub fn parse_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)?;

        let api_key = required(cli.api_key, "--api-key")?;
        let channel = required(cli.channel, "--channel")?;
        if cli.event.is_empty() {
            return Err(ConfigError::Empty { flag: "--event" });
        }

        Ok(Self {
            api_key,
            channel,
            event_filter: cli.event,
            quiet: cli.quiet,
            debug: cli.debug,
            realtime_host: DEFAULT_REALTIME_HOST.to_string(),
            use_tls: true,
        })
    }

    /// Applies environment overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup(ENV_REALTIME_HOST).filter(|h| !h.is_empty()) {
            self.realtime_host = host;
        }

        if let Some(insecure) = lookup(ENV_INSECURE) {
            self.use_tls = !matches!(insecure.as_str(), "1" | "true");
        }
    }

    /// Returns `true` if no event filtering applies.
    pub fn is_wildcard(&self) -> bool {
        self.event_filter == WILDCARD_EVENT
    }

    /// Returns `true` if a message with this name passes the filter.
    pub fn accepts_event(&self, name: Option<&str>) -> bool {
        self.is_wildcard() || name == Some(self.event_filter.as_str())
    }

    /// Log level implied by the flags. `quiet` wins over `debug`.
    pub fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            log::LevelFilter::Warn
        } else if self.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}

fn required(value: Option<String>, flag: &'static str) -> Result<String, ConfigError> {
    match value {
        None => Err(ConfigError::Missing { flag }),
        Some(v) if v.trim().is_empty() => Err(ConfigError::Empty { flag }),
        Some(v) => Ok(v),
    }
}
