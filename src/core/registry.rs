//! Client for the hub: the on-backend name → address directory.

use crate::core::address::Address;
use crate::core::artifact::ArtifactId;
use crate::core::backend::Connection;
use crate::core::codec::{Call, Word};
use crate::core::error::KeystoneError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const REGISTER_METHOD: &str = "register";
pub const LOOKUP_METHOD: &str = "lookup";
/// The hub keeps names in 32-byte words.
pub const MAX_NAME_BYTES: usize = 32;

/// What to do when a name is already registered to a different address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    #[default]
    Reject,
    Overwrite,
}

pub struct HubClient {
    conn: Connection,
    id: ArtifactId,
    address: Address,
    policy: DuplicatePolicy,
}

impl HubClient {
    pub fn new(conn: Connection, id: ArtifactId, address: Address, policy: DuplicatePolicy) -> Self {
        Self {
            conn,
            id,
            address,
            policy,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn register(&self, name: &str, address: Address) -> Result<(), KeystoneError> {
        if name.is_empty() || name.len() > MAX_NAME_BYTES {
            return Err(KeystoneError::Plan(format!(
                "hub name '{}' must be 1..={} bytes",
                name, MAX_NAME_BYTES
            )));
        }

        if let Some(existing) = self.try_lookup(name).await? {
            if existing == address {
                info!(name, address = %address, "already registered, skipping");
                return Ok(());
            }
            match self.policy {
                DuplicatePolicy::Reject => {
                    return Err(KeystoneError::DuplicateRegistration {
                        name: name.to_string(),
                        existing: existing.to_string(),
                        requested: address.to_string(),
                    });
                }
                DuplicatePolicy::Overwrite => {
                    warn!(name, previous = %existing, address = %address, "overwriting hub entry");
                }
            }
        }

        let call = Call::new(
            REGISTER_METHOD,
            vec![Word::Text(name.to_string()), Word::Address(address)],
        );
        let payload = self.conn.codec.encode_call(&self.id, &call)?;
        self.conn
            .backend
            .invoke(self.address, payload, false)
            .await
            .map_err(|e| KeystoneError::Backend(format!("hub register {}: {}", name, e)))?;
        info!(name, address = %address, "registered");
        Ok(())
    }

    /// `None` when the hub has no entry for `name` (it answers with null or
    /// the zero address).
    pub async fn try_lookup(&self, name: &str) -> Result<Option<Address>, KeystoneError> {
        let call = Call::new(LOOKUP_METHOD, vec![Word::Text(name.to_string())]);
        let payload = self.conn.codec.encode_call(&self.id, &call)?;
        let data = self
            .conn
            .backend
            .invoke(self.address, payload, true)
            .await
            .map_err(|e| KeystoneError::Backend(format!("hub lookup {}: {}", name, e)))?;
        let word = self.conn.codec.decode_return(&self.id, LOOKUP_METHOD, &data)?;
        match word {
            Word::Null => Ok(None),
            other => match other.as_address() {
                Some(a) if a.is_zero() => Ok(None),
                Some(a) => Ok(Some(a)),
                None => Err(KeystoneError::Codec(format!(
                    "hub lookup {} returned {}, not an address",
                    name, other
                ))),
            },
        }
    }

    pub async fn lookup(&self, name: &str) -> Result<Address, KeystoneError> {
        self.try_lookup(name)
            .await?
            .ok_or_else(|| KeystoneError::NotFound(format!("hub entry '{}'", name)))
    }
}
