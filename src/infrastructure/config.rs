//! File configuration.
//!
//! A deployment describes its governance in TOML:
//!
//! ```toml
//! failure_policy = "fail-closed"
//!
//! [rate_limit]
//! default = "200/minute"
//!
//! [rate_limit.routes."orders.create"]
//! rate = "5/minute"
//! key = "user"
//!
//! [idempotency]
//! default_ttl = "24h"
//! lease = "30s"
//! concurrency = "wait"
//! wait_timeout = "5s"
//!
//! [idempotency.routes."payments.capture"]
//! ttl = "1h"
//! scope = "global"
//!
//! [idempotency.routes.health]
//! enabled = false
//! ```
//!
//! Every string is parsed and checked in [`GovernanceConfig::settings`], so
//! a bad rate or duration fails at startup rather than on a request.

use crate::application::governor::{GovernorSettings, RouteLimit};
use crate::application::idempotency::{IdempotencyConfig, RouteIdempotency};
use crate::domain::key::{IdempotencyScope, KeyStrategy};
use crate::domain::policy::{ConcurrencyPolicy, FailurePolicy};
use crate::domain::rate::{parse_ttl, Rate, RateParseError, TtlParseError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error raised while loading or validating governance configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Rate(#[from] RateParseError),

    #[error(transparent)]
    Duration(#[from] TtlParseError),

    #[error("unknown key strategy '{0}': expected 'ip' or 'user'")]
    UnknownKeyStrategy(String),

    #[error("unknown concurrency policy '{0}': expected 'reject' or 'wait'")]
    UnknownConcurrency(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("idempotency header name must not be empty")]
    EmptyHeader,
}

/// Root of the TOML document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernanceConfig {
    pub failure_policy: FailurePolicy,
    pub rate_limit: RateLimitSection,
    pub idempotency: IdempotencySection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSection {
    /// Rate applied to every route without an override.
    pub default: Option<String>,
    /// Default key strategy, `"ip"` or `"user"`.
    pub key: Option<String>,
    pub routes: BTreeMap<String, RouteSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteSection {
    pub rate: Option<String>,
    pub key: Option<String>,
    pub exempt: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdempotencySection {
    pub header: Option<String>,
    pub default_ttl: Option<DurationValue>,
    pub lease: Option<DurationValue>,
    pub prefix: Option<String>,
    pub scope: Option<IdempotencyScope>,
    pub methods: Option<Vec<String>>,
    /// `"reject"` or `"wait"`.
    pub concurrency: Option<String>,
    pub wait_timeout: Option<DurationValue>,
    pub poll_interval: Option<DurationValue>,
    /// Guard routes not listed under `routes`.
    pub all_routes: Option<bool>,
    pub routes: BTreeMap<String, IdempotentRouteSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdempotentRouteSection {
    pub enabled: bool,
    pub ttl: Option<DurationValue>,
    pub scope: Option<IdempotencyScope>,
    pub methods: Option<Vec<String>>,
}

impl Default for IdempotentRouteSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
            scope: None,
            methods: None,
        }
    }
}

/// A duration written either as seconds or as a suffixed string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration, TtlParseError> {
        match self {
            DurationValue::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            DurationValue::Text(text) => parse_ttl(text),
        }
    }
}

impl GovernanceConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns an error on malformed TOML or unknown keys. Values are not
    /// checked until [`settings`](Self::settings).
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Turn the document into validated governor settings.
    pub fn settings(&self) -> Result<GovernorSettings, ConfigError> {
        let rate_limit = &self.rate_limit;
        let default_rate = rate_limit.default.as_deref().map(str::parse).transpose()?;
        let default_key = match &rate_limit.key {
            Some(name) => parse_key_strategy(name)?,
            None => KeyStrategy::default(),
        };

        let mut routes = std::collections::HashMap::new();
        for (route, section) in &rate_limit.routes {
            let limit = RouteLimit {
                rate: section
                    .rate
                    .as_deref()
                    .map(str::parse::<Rate>)
                    .transpose()?,
                key: section.key.as_deref().map(parse_key_strategy).transpose()?,
                exempt: section.exempt,
            };
            routes.insert(route.clone(), limit);
        }

        let settings = GovernorSettings {
            default_rate,
            default_key,
            routes,
            failure_policy: self.failure_policy,
            idempotency: self.idempotency.to_config()?,
        };
        validate(&settings)?;
        Ok(settings)
    }
}

impl IdempotencySection {
    fn to_config(&self) -> Result<IdempotencyConfig, ConfigError> {
        let mut config = IdempotencyConfig::default();
        if let Some(header) = &self.header {
            config.header = header.clone();
        }
        if let Some(ttl) = &self.default_ttl {
            config.default_ttl = ttl.to_duration()?;
        }
        if let Some(lease) = &self.lease {
            config.lease = lease.to_duration()?;
        }
        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(scope) = self.scope {
            config.scope = scope;
        }
        if let Some(methods) = &self.methods {
            config.methods = methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        }

        let timeout = self
            .wait_timeout
            .as_ref()
            .map(DurationValue::to_duration)
            .transpose()?;
        let poll = self
            .poll_interval
            .as_ref()
            .map(DurationValue::to_duration)
            .transpose()?;
        config.concurrency = match self.concurrency.as_deref() {
            None | Some("reject") => ConcurrencyPolicy::Reject,
            Some("wait") => ConcurrencyPolicy::WaitAndReplay {
                timeout: timeout.unwrap_or(ConcurrencyPolicy::DEFAULT_WAIT_TIMEOUT),
                poll_interval: poll.unwrap_or(ConcurrencyPolicy::DEFAULT_POLL_INTERVAL),
            },
            Some(other) => return Err(ConfigError::UnknownConcurrency(other.to_string())),
        };

        if let Some(all_routes) = self.all_routes {
            config.all_routes = all_routes;
        }
        for (route, section) in &self.routes {
            config.routes.insert(route.clone(), section.to_route()?);
        }
        Ok(config)
    }
}

impl IdempotentRouteSection {
    fn to_route(&self) -> Result<RouteIdempotency, ConfigError> {
        Ok(RouteIdempotency {
            enabled: self.enabled,
            ttl: self
                .ttl
                .as_ref()
                .map(DurationValue::to_duration)
                .transpose()?,
            scope: self.scope,
            methods: self
                .methods
                .as_ref()
                .map(|methods| methods.iter().map(|m| m.to_ascii_uppercase()).collect()),
        })
    }
}

fn parse_key_strategy(name: &str) -> Result<KeyStrategy, ConfigError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "ip" => Ok(KeyStrategy::Ip),
        "user" => Ok(KeyStrategy::User),
        _ => Err(ConfigError::UnknownKeyStrategy(name.to_string())),
    }
}

/// Checks shared by file configuration and the builder.
pub(crate) fn validate(settings: &GovernorSettings) -> Result<(), ConfigError> {
    let idempotency = &settings.idempotency;
    if idempotency.header.trim().is_empty() {
        return Err(ConfigError::EmptyHeader);
    }
    if idempotency.lease.is_zero() {
        return Err(ConfigError::Zero("idempotency lease"));
    }
    if idempotency.default_ttl.is_zero() {
        return Err(ConfigError::Zero("idempotency default_ttl"));
    }
    if idempotency.routes.values().any(|r| r.ttl.is_some_and(|t| t.is_zero())) {
        return Err(ConfigError::Zero("idempotency route ttl"));
    }
    if let ConcurrencyPolicy::WaitAndReplay {
        timeout,
        poll_interval,
    } = idempotency.concurrency
    {
        if timeout.is_zero() {
            return Err(ConfigError::Zero("wait_timeout"));
        }
        if poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }
    }
    Ok(())
}
