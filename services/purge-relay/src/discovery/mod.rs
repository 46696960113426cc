//! Backend Discovery
//!
//! Trait-based providers that list the current cache fleet. Each cloud is
//! a separate implementation selected on the command line:
//!
//! - **aws**: running EC2 instances matching tag filters
//! - **gce**: running Compute Engine instances matching a name prefix
//! - **static**: a fixed list of addresses

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::ProviderCommand;
use crate::types::Address;

pub mod aws;
pub mod gce;
mod static_list;

pub use aws::AwsProvider;
pub use gce::GceProvider;
pub use static_list::StaticProvider;

/// Capability to list the backends that should receive purges
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Short provider name used in logs and errors
    fn name(&self) -> &'static str;

    /// Acquire whatever credentials the inventory lookup needs
    async fn authenticate(&self) -> Result<()>;

    /// List the private addresses of every current backend
    async fn list_backend_addresses(&self) -> Result<Vec<Address>>;
}

/// Build the provider selected on the command line.
pub fn build_provider(command: &ProviderCommand) -> Result<Arc<dyn DiscoveryProvider>> {
    let provider: Arc<dyn DiscoveryProvider> = match command {
        ProviderCommand::Aws { region, tags } => {
            Arc::new(AwsProvider::new(region.clone(), tags.clone())?)
        }
        ProviderCommand::Gce {
            project,
            region,
            name_prefix,
            credentials,
        } => Arc::new(GceProvider::new(
            project,
            region,
            name_prefix,
            credentials.clone(),
        )?),
        ProviderCommand::Static { backends } => Arc::new(StaticProvider::new(backends.clone())),
    };

    info!(provider = provider.name(), "Discovery provider selected");
    Ok(provider)
}
