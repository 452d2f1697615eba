//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface function
//! implementation

use std::{error::Error, str::FromStr, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use kube::CustomResourceExt;

use crate::{
    cmd::Executor,
    svc::{
        cfg::Configuration,
        crd::{
            connection::DBaaSConnection, instance::DBaaSInstance, inventory::DBaaSInventory,
            provider::DBaaSProvider, tenant::DBaaSTenant,
        },
    },
};

// -----------------------------------------------------------------------------
// CustomResource enum

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub enum CustomResource {
    Provider,
    Tenant,
    Inventory,
    Instance,
    Connection,
}

impl FromStr for CustomResource {
    type Err = Box<dyn Error + Send + Sync>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "provider" => Ok(Self::Provider),
            "tenant" => Ok(Self::Tenant),
            "inventory" => Ok(Self::Inventory),
            "instance" => Ok(Self::Instance),
            "connection" => Ok(Self::Connection),
            _ => Err(format!("failed to parse '{}', available options are 'provider', 'tenant', 'inventory', 'instance' or 'connection'", s).into()),
        }
    }
}

impl CustomResource {
    pub const ALL: [Self; 5] = [
        Self::Provider,
        Self::Tenant,
        Self::Inventory,
        Self::Instance,
        Self::Connection,
    ];

    /// returns the definition of the custom resource as yaml
    pub fn definition(&self) -> Result<String, CustomResourceDefinitionError> {
        match self {
            Self::Provider => serde_yaml::to_string(&DBaaSProvider::crd()),
            Self::Tenant => serde_yaml::to_string(&DBaaSTenant::crd()),
            Self::Inventory => serde_yaml::to_string(&DBaaSInventory::crd()),
            Self::Instance => serde_yaml::to_string(&DBaaSInstance::crd()),
            Self::Connection => serde_yaml::to_string(&DBaaSConnection::crd()),
        }
        .map_err(CustomResourceDefinitionError::Serialize)
    }
}

// -----------------------------------------------------------------------------
// CustomResourceDefinitionError enum

#[derive(thiserror::Error, Debug)]
pub enum CustomResourceDefinitionError {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// CustomResourceDefinition enum

#[derive(Subcommand, Clone, Debug)]
pub enum CustomResourceDefinition {
    /// View custom resource definition
    #[clap(name = "view", aliases = &["v"])]
    View {
        #[clap(name = "custom-resource")]
        custom_resource: Option<CustomResource>,
    },
}

#[async_trait]
impl Executor for CustomResourceDefinition {
    type Error = CustomResourceDefinitionError;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::View { custom_resource } => view(config, custom_resource).await,
        }
    }
}

// -----------------------------------------------------------------------------
// view function

pub async fn view(
    _config: Arc<Configuration>,
    custom_resource: &Option<CustomResource>,
) -> Result<(), CustomResourceDefinitionError> {
    let crds = match custom_resource {
        Some(cr) => vec![cr.definition()?],
        None => CustomResource::ALL
            .iter()
            .map(CustomResource::definition)
            .collect::<Result<Vec<_>, _>>()?,
    };

    print!("{}", crds.join("---\n"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_parsed() {
        for (name, kind) in ["provider", "Tenant", "inventory", "instance", "CONNECTION"]
            .iter()
            .zip(CustomResource::ALL)
        {
            assert_eq!(kind, CustomResource::from_str(name).expect("kind to parse"));
        }

        assert!(CustomResource::from_str("postgresql").is_err());
    }

    #[test]
    fn definitions_are_yaml() {
        let definition = CustomResource::Connection.definition().expect("definition to serialize");

        assert!(definition.contains("name: dbaasconnections.dbaas.redhat.com"));
        assert!(definition.contains("scope: Namespaced"));
    }
}
