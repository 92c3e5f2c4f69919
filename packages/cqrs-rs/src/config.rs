use std::env;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

/// How the event bus runs the handlers of a single event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventHandlerMode {
    /// Start every handler in registration order and await them together.
    #[default]
    Concurrent,
    /// Run handlers one after another in registration order.
    Sequential,
}

impl FromStr for EventHandlerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concurrent" => Ok(EventHandlerMode::Concurrent),
            "sequential" => Ok(EventHandlerMode::Sequential),
            other => Err(anyhow!(
                "unknown event handler mode {other:?} (expected \"concurrent\" or \"sequential\")"
            )),
        }
    }
}

impl fmt::Display for EventHandlerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventHandlerMode::Concurrent => write!(f, "concurrent"),
            EventHandlerMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqrsConfig {
    pub event_handler_mode: EventHandlerMode,
    /// Log every unhandled exception record with `error!`.
    pub log_unhandled_exceptions: bool,
}

impl Default for CqrsConfig {
    fn default() -> Self {
        Self {
            event_handler_mode: EventHandlerMode::Concurrent,
            log_unhandled_exceptions: true,
        }
    }
}

impl CqrsConfig {
    /// Load configuration from environment variables
    ///
    /// - `CQRS_EVENT_HANDLER_MODE`: `concurrent` (default) or `sequential`
    /// - `CQRS_LOG_UNHANDLED`: `true` (default) or `false`
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            event_handler_mode: match lookup("CQRS_EVENT_HANDLER_MODE") {
                Some(value) => value
                    .parse()
                    .context("CQRS_EVENT_HANDLER_MODE must be concurrent or sequential")?,
                None => defaults.event_handler_mode,
            },
            log_unhandled_exceptions: match lookup("CQRS_LOG_UNHANDLED") {
                Some(value) => value
                    .trim()
                    .parse()
                    .context("CQRS_LOG_UNHANDLED must be true or false")?,
                None => defaults.log_unhandled_exceptions,
            },
        })
    }
}
