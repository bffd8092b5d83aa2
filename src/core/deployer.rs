use crate::core::address::ResolvedAddress;
use crate::core::artifact::ArtifactId;
use crate::core::backend::{Connection, DeployPayload};
use crate::core::codec::Arg;
use crate::core::error::KeystoneError;
use tracing::{debug, info};

/// Submits linked images to the backend.
///
/// There is no retry: a second submission would create a second artifact.
pub struct Deployer {
    conn: Connection,
}

impl Deployer {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn deploy(
        &self,
        artifact: &ArtifactId,
        code: Vec<u8>,
        args: &[Arg],
    ) -> Result<ResolvedAddress, KeystoneError> {
        let constructor = self.conn.codec.encode_constructor(artifact, args)?;
        debug!(
            artifact = %artifact,
            code_bytes = code.len(),
            constructor_bytes = constructor.len(),
            "submitting deployment"
        );

        let address = self
            .conn
            .backend
            .deploy(DeployPayload { code, constructor })
            .await
            .map_err(|e| KeystoneError::Deployment {
                artifact: artifact.clone(),
                message: e.to_string(),
            })?;

        if address.is_zero() {
            return Err(KeystoneError::Deployment {
                artifact: artifact.clone(),
                message: "backend returned the zero address".to_string(),
            });
        }

        info!(artifact = %artifact, address = %address, "deployed");
        Ok(ResolvedAddress::new(artifact.clone(), address))
    }
}
