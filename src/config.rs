// Layered configuration for the engine and the demo binary

//! # Configuration
//!
//! [`ThresherConfig`] is assembled from three layers, later layers winning:
//!
//! 1. built-in defaults ([`ThresherConfig::default`])
//! 2. an optional file: the explicit path, or `thresher.{toml,yaml,json}`
//!    in the working directory
//! 3. environment variables prefixed `THRESHER_`, with `__` separating
//!    nested keys (`THRESHER_BUS=nats`, `THRESHER_NATS__URL=nats://host:4222`)

use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Which message bus implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    #[default]
    Memory,
    Nats,
}

impl std::str::FromStr for BusBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BusBackend::Memory),
            "nats" => Ok(BusBackend::Nats),
            other => Err(format!("unknown bus backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    pub url: String,
    /// JetStream stream holding every queue
    pub stream: String,
    /// Subjects are `<subject_prefix>.<queue>`
    pub subject_prefix: String,
}

impl Default for NatsSettings {
    fn default() -> Self {
        NatsSettings {
            url: "nats://localhost:4222".to_string(),
            stream: "THRESHER_MESSAGES".to_string(),
            subject_prefix: "thresher.mq".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresherConfig {
    pub bus: BusBackend,
    pub nats: NatsSettings,
    /// How long a bus `get` stream stays open without traffic
    pub bus_wait_ms: u64,
    /// Capacity of the lifecycle event broadcast channel
    pub event_capacity: usize,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for ThresherConfig {
    fn default() -> Self {
        ThresherConfig {
            bus: BusBackend::Memory,
            nats: NatsSettings::default(),
            bus_wait_ms: 1000,
            event_capacity: 1000,
            log_filter: "thresher=info".to_string(),
        }
    }
}

impl ThresherConfig {
    /// Load defaults, then the optional file, then `THRESHER_*` variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&ThresherConfig::default())?);

        builder = match path {
            Some(path) => builder.add_source(File::with_name(path).required(true)),
            None => builder.add_source(File::with_name("thresher").required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("THRESHER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn bus_wait(&self) -> Duration {
        Duration::from_millis(self.bus_wait_ms)
    }
}
