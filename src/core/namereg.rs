//! Bridge to the external name service, independent of the hub.
//!
//! The hub's own address is published here so that a later process, which
//! has no other way to find the hub, can resolve it.

use crate::core::backend::NameService;
use crate::core::config::NameRegConfig;
use crate::core::error::KeystoneError;
use std::sync::Arc;
use tracing::info;

pub struct NameRegistry {
    names: Arc<dyn NameService>,
    ttl: u64,
    fee: u64,
}

impl NameRegistry {
    pub fn new(names: Arc<dyn NameService>, config: &NameRegConfig) -> Self {
        Self {
            names,
            ttl: config.ttl,
            fee: config.fee,
        }
    }

    pub async fn publish(&self, name: &str, value: &str) -> Result<(), KeystoneError> {
        self.names
            .publish(name, value, self.ttl, self.fee)
            .await
            .map_err(|e| KeystoneError::Publish {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        info!(name, value, ttl = self.ttl, "published to name service");
        Ok(())
    }

    /// A missing entry is `Ok(None)`; only transport failures are errors.
    pub async fn resolve(&self, name: &str) -> Result<Option<String>, KeystoneError> {
        self.names
            .resolve(name)
            .await
            .map_err(|e| KeystoneError::Backend(format!("name service resolve {}: {}", name, e)))
    }
}
