//! # Command module
//!
//! This module provide command line interface structures and helpers
use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};

use crate::{
    cmd::crd::CustomResourceDefinitionError,
    svc::{
        cfg::Configuration,
        crd::{connection, instance, inventory, tenant},
        k8s::{client, store::KubeStore, Context, Watcher},
        telemetry::{self, gauge::Telemetry},
    },
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// CommandError enum

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<CommandError>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(CustomResourceDefinitionError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[clap(name = "custom-resource-definition", aliases = &["crd"], subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
}

#[async_trait]
impl Executor for Command {
    type Error = CommandError;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(CommandError::CustomResourceDefinition)
                .map_err(|err| {
                    CommandError::Execution("custom-resource-definition".into(), Arc::new(err))
                }),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to handle termintion signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to register metrics, {0}")]
    Telemetry(telemetry::gauge::Error),
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Register gauges of delegated resources
    let telemetry = Telemetry::try_new(prometheus::default_registry())
        .map_err(DaemonError::Telemetry)?;

    // -------------------------------------------------------------------------
    // Create context to give to each reconciler
    let context = Arc::new(Context::new(
        Arc::new(KubeStore::from(kube_client.to_owned())),
        config.to_owned(),
        Arc::new(telemetry),
    ));

    // -------------------------------------------------------------------------
    // Start the http server that exposes health and metrics
    let listen = config.operator.listen;
    let mut handles = vec![tokio::spawn(async move {
        if let Err(err) = telemetry::serve(listen).await {
            error!(error = err.to_string(), "Could not serve http requests");
        }
    })];

    // -------------------------------------------------------------------------
    // Create reconcilers
    let (client, ctx) = (kube_client.to_owned(), context.to_owned());
    handles.push(tokio::spawn(async move {
        info!("Start to listen for events of inventory custom resource");
        inventory::Reconciler::default().watch(client, ctx).await;
    }));

    let (client, ctx) = (kube_client.to_owned(), context.to_owned());
    handles.push(tokio::spawn(async move {
        info!("Start to listen for events of instance custom resource");
        instance::Reconciler::default().watch(client, ctx).await;
    }));

    let (client, ctx) = (kube_client.to_owned(), context.to_owned());
    handles.push(tokio::spawn(async move {
        info!("Start to listen for events of connection custom resource");
        connection::Reconciler::default().watch(client, ctx).await;
    }));

    let (client, ctx) = (kube_client, context);
    handles.push(tokio::spawn(async move {
        info!("Start to listen for events of tenant custom resource");
        tenant::Reconciler::default().watch(client, ctx).await;
    }));

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c()
        .await
        .map_err(DaemonError::SigTerm)?;

    // -------------------------------------------------------------------------
    // Cancel reconcilers
    handles.iter().for_each(|handle| handle.abort());

    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(error = err.to_string(), "could not wait for the task to complete");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_line_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn verbosity_is_counted() {
        let args = Args::try_parse_from(["dbaas-operator", "-vvv", "-t"]).expect("arguments to parse");

        assert_eq!(3, args.verbosity);
        assert!(args.check);
        assert!(args.command.is_none());
    }
}
