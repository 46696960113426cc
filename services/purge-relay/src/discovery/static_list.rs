//! Fixed backend list

use anyhow::Result;
use async_trait::async_trait;

use super::DiscoveryProvider;
use crate::types::Address;

/// Provider that always returns the configured addresses
pub struct StaticProvider {
    backends: Vec<Address>,
}

impl StaticProvider {
    pub fn new(backends: Vec<Address>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl DiscoveryProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn list_backend_addresses(&self) -> Result<Vec<Address>> {
        Ok(self.backends.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_returns_configured_list() {
        let provider = StaticProvider::new(vec![
            Address::new("10.0.0.1", None),
            Address::new("10.0.0.2", Some(6081)),
        ]);

        provider.authenticate().await.unwrap();
        let addresses = provider.list_backend_addresses().await.unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[1].port(), Some(6081));
    }
}
