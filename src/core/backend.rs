//! Traits for the execution backend and the external name service.
//!
//! Both are consumed as trait objects so that a simulated backend can stand in
//! for a real node. Methods return boxed futures for that reason.

use crate::core::address::Address;
use crate::core::codec::Codec;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

/// Rejection or transport failure reported by a backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A linked image plus its encoded constructor input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployPayload {
    pub code: Vec<u8>,
    pub constructor: Vec<u8>,
}

impl DeployPayload {
    /// Wire form: the code immediately followed by the constructor input.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut data = self.code;
        data.extend(self.constructor);
        data
    }
}

pub trait Backend: Send + Sync {
    /// Instantiate an artifact. Not idempotent: every call creates a new one.
    fn deploy(&self, payload: DeployPayload) -> BoxFuture<'_, Result<Address, BackendError>>;

    /// Call a deployed artifact. `read_only` calls must not mutate state.
    fn invoke(
        &self,
        address: Address,
        payload: Vec<u8>,
        read_only: bool,
    ) -> BoxFuture<'_, Result<Vec<u8>, BackendError>>;
}

pub trait NameService: Send + Sync {
    fn publish<'a>(
        &'a self,
        name: &'a str,
        value: &'a str,
        ttl: u64,
        fee: u64,
    ) -> BoxFuture<'a, Result<(), BackendError>>;

    /// `Ok(None)` when the name has no entry.
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>, BackendError>>;
}

/// Everything a run needs to talk to the outside world.
#[derive(Clone)]
pub struct Connection {
    pub backend: Arc<dyn Backend>,
    pub names: Arc<dyn NameService>,
    pub codec: Arc<dyn Codec>,
}

impl Connection {
    pub fn new(
        backend: Arc<dyn Backend>,
        names: Arc<dyn NameService>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            backend,
            names,
            codec,
        }
    }
}
