//! Client configuration

use crate::error::{Error, Result};
use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment fallbacks applied to fields the caller left unset.
#[derive(Envconfig)]
struct EnvDefaults {
    #[envconfig(from = "ZONE")]
    zone: Option<String>,

    #[envconfig(from = "DEPLOY_ENV")]
    deploy_env: Option<String>,
}

/// Configuration for a [`Discovery`](crate::Discovery) client.
///
/// `domain` (the `host:port` of the local discovery entry point) is
/// required. `zone`, `env` and `host` default from the `ZONE` and
/// `DEPLOY_ENV` environment variables and the OS hostname when left unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    domain: String,
    zone: String,
    env: String,
    host: String,
}

impl Config {
    /// Create a configuration pointing at `domain` (`host:port`).
    pub fn new<S: Into<String>>(domain: S) -> Self {
        Self {
            domain: domain.into(),
            zone: String::new(),
            env: String::new(),
            host: String::new(),
        }
    }

    /// Set the zone this process runs in.
    pub fn with_zone<S: Into<String>>(mut self, zone: S) -> Self {
        self.zone = zone.into();
        self
    }

    /// Set the logical environment (prod, test, ...).
    pub fn with_env<S: Into<String>>(mut self, env: S) -> Self {
        self.env = env.into();
        self
    }

    /// Set the hostname reported to the server.
    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    /// The discovery entry point (`host:port`).
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The zone label.
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// The logical environment.
    pub fn env(&self) -> &str {
        &self.env
    }

    /// The reported hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(Error::config("domain must not be empty"));
        }
        Ok(())
    }

    /// Fill unset fields from the environment, the way the server expects
    /// deployments to be labelled.
    pub(crate) fn fill_from_env(&mut self) {
        if self.zone.is_empty() || self.env.is_empty() {
            if let Ok(defaults) = EnvDefaults::init_from_env() {
                if self.zone.is_empty() {
                    self.zone = defaults.zone.unwrap_or_default();
                }
                if self.env.is_empty() {
                    self.env = defaults.deploy_env.unwrap_or_default();
                }
            }
        }
        if self.host.is_empty() {
            self.host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default();
        }
    }
}

/// Transport tuning for the discovery HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    connect_timeout: Duration,
    keepalive: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            keepalive: Duration::from_secs(40),
        }
    }
}

impl HttpConfig {
    /// Create a transport configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the TCP keepalive interval.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Get the TCP connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Get the TCP keepalive interval.
    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }
}
