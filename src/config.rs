//! Configuration surface.
//!
//! Loaded with the [`config`] crate: an optional file (format chosen by its
//! extension: TOML, YAML, JSON, …) layered under `TESSERA__*` environment
//! variables, e.g. `TESSERA__BIND=127.0.0.1:8080` or
//! `TESSERA__NAMESPACES__ADMIN__POLICY=fallthrough`.
//!
//! ```toml
//! bind = "0.0.0.0:3000"
//! drain_timeout_ms = 10000
//!
//! middleware = [
//!     { type = "request_id" },
//!     { type = "trace" },
//!     { type = "timeout", ms = 5000 },
//! ]
//!
//! [namespaces.admin]
//! prefix = "/admin"
//! policy = "strict"
//! tokens = { "s3cret" = "ops" }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File};
use serde::Deserialize;

use crate::auth::AuthPolicy;
use crate::error::Error;

/// Top-level settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port` the transport binds to.
    pub bind: String,
    /// How long in-flight requests may run after the shutdown signal.
    pub drain_timeout_ms: u64,
    /// Outermost first.
    pub middleware: Vec<MiddlewareConfig>,
    pub namespaces: HashMap<String, NamespaceConfig>,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_owned(),
            drain_timeout_ms: 30_000,
            middleware: Vec::new(),
            namespaces: HashMap::new(),
            log: LogConfig::default(),
        }
    }
}

/// One entry of the ordered middleware list.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MiddlewareConfig {
    Trace,
    RequestId,
    SetHeader { name: String, value: String },
    Timeout { ms: u64 },
}

/// An authenticated namespace.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NamespaceConfig {
    pub prefix: String,
    #[serde(default)]
    pub policy: AuthPolicy,
    /// Bearer token → principal name.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `tessera=debug,hyper=warn`.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_owned(), json: false }
    }
}

impl Config {
    /// Loads defaults, then `path` (if any), then the environment, and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let cfg: Config = builder
            .add_source(Environment::with_prefix("TESSERA").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.bind_addr()?;
        if self.drain_timeout_ms == 0 {
            return Err(Error::InvalidConfig("drain_timeout_ms must be greater than zero".into()));
        }
        for (name, ns) in &self.namespaces {
            if !ns.prefix.starts_with('/') {
                return Err(Error::InvalidConfig(format!(
                    "namespace `{name}`: prefix `{}` must start with `/`",
                    ns.prefix
                )));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, Error> {
        self.bind.parse().map_err(|source| Error::Address { addr: self.bind.clone(), source })
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Policy for a namespace; strict when the namespace is not configured.
    pub fn policy_for(&self, namespace: &str) -> AuthPolicy {
        self.namespaces.get(namespace).map(|ns| ns.policy).unwrap_or_default()
    }
}
