//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, net::SocketAddr, path::PathBuf, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
pub const DEFAULT_CONCURRENCY: u16 = 2;
pub const DEFAULT_REQUEUE: u64 = 5;
pub const DEFAULT_BACKOFF: u64 = 500;

pub const DEFAULT_INVENTORY_SYNC: &str = "SpecSynced";
pub const DEFAULT_CONNECTION_SYNC: &str = "ReadyForBinding";
pub const DEFAULT_INSTANCE_SYNC: &str = "ProvisionReady";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
    /// number of reconciliations of the same kind running at the same time
    #[serde(rename = "concurrency")]
    pub concurrency: u16,
    /// delay in seconds before looking again at a resource that waits on
    /// something else
    #[serde(rename = "requeue")]
    pub requeue: u64,
    /// delay in milliseconds before retrying a failed reconciliation
    #[serde(rename = "backoff")]
    pub backoff: u64,
}

impl Default for Operator {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            concurrency: DEFAULT_CONCURRENCY,
            requeue: DEFAULT_REQUEUE,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl Operator {
    pub fn requeue(&self) -> Duration {
        Duration::from_secs(self.requeue)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff)
    }
}

// -----------------------------------------------------------------------------
// Conditions structure

/// Type of the condition that each provider reports on its own resource to
/// tell that it is in sync with the desired state, per logical kind.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Conditions {
    #[serde(rename = "inventory")]
    pub inventory: String,
    #[serde(rename = "connection")]
    pub connection: String,
    #[serde(rename = "instance")]
    pub instance: String,
}

impl Default for Conditions {
    fn default() -> Self {
        Self {
            inventory: DEFAULT_INVENTORY_SYNC.to_string(),
            connection: DEFAULT_CONNECTION_SYNC.to_string(),
            instance: DEFAULT_INSTANCE_SYNC.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load file '{0:?}', {1}")]
    File(PathBuf, ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "conditions")]
    pub conditions: Conditions,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        let builder = defaults()?.add_source(File::from(path.to_owned()).required(true));

        Self::build(builder.add_source(environment()))
            .map_err(|err| Error::File(path, err))
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let mut builder = defaults()?;

        let paths = [
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!(
                "{}/.config/{}/config",
                std::env::var("HOME").unwrap_or_default(),
                env!("CARGO_PKG_NAME")
            )),
            PathBuf::from("config"),
        ];

        for path in paths {
            builder = builder.add_source(File::from(path).required(false));
        }

        Self::build(builder.add_source(environment())).map_err(Error::Build)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder.build()?.try_deserialize()
    }

    /// log the configuration at debug level
    pub fn help(&self) {
        tracing::debug!(
            listen = self.operator.listen.to_string(),
            concurrency = self.operator.concurrency,
            requeue = self.operator.requeue,
            backoff = self.operator.backoff,
            inventory = &self.conditions.inventory,
            connection = &self.conditions.connection,
            instance = &self.conditions.instance,
            "Loaded configuration",
        );
    }
}

// -----------------------------------------------------------------------------
// helpers

fn defaults() -> Result<ConfigBuilder<DefaultState>, Error> {
    let defaults: [(&str, config::Value); 7] = [
        ("operator.listen", DEFAULT_LISTEN.into()),
        ("operator.concurrency", (DEFAULT_CONCURRENCY as i64).into()),
        ("operator.requeue", (DEFAULT_REQUEUE as i64).into()),
        ("operator.backoff", (DEFAULT_BACKOFF as i64).into()),
        ("conditions.inventory", DEFAULT_INVENTORY_SYNC.into()),
        ("conditions.connection", DEFAULT_CONNECTION_SYNC.into()),
        ("conditions.instance", DEFAULT_INSTANCE_SYNC.into()),
    ];

    defaults
        .into_iter()
        .try_fold(Config::builder(), |builder, (key, value)| {
            builder
                .set_default(key, value)
                .map_err(|err| Error::Default(key.to_string(), err))
        })
}

fn environment() -> Environment {
    Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_"))
        .separator("__")
        .try_parsing(true)
}
