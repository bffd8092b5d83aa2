use crate::core::address::Address;
use crate::core::artifact::ArtifactId;
use crate::core::backend::Connection;
use crate::core::codec::{Call, Word};
use crate::core::error::KeystoneError;
use std::future::Future;
use tracing::{debug, error};

/// Post-condition checks against live backend state.
///
/// A mismatch is fatal. Nothing is repaired.
pub struct ConsistencyVerifier {
    conn: Connection,
}

impl ConsistencyVerifier {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn verify<F, Fut>(
        &self,
        subject: &str,
        expected: &Word,
        actual_reader: F,
    ) -> Result<(), KeystoneError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Word, KeystoneError>>,
    {
        let actual = actual_reader().await?;
        if !expected.matches(&actual) {
            error!(subject, expected = %expected, actual = %actual, "consistency check failed");
            return Err(KeystoneError::Consistency {
                subject: subject.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        debug!(subject, value = %actual, "consistent");
        Ok(())
    }

    /// Read-only call against a deployed artifact.
    pub async fn read(
        &self,
        target: &ArtifactId,
        address: Address,
        call: &Call,
    ) -> Result<Word, KeystoneError> {
        let payload = self.conn.codec.encode_call(target, call)?;
        let data = self
            .conn
            .backend
            .invoke(address, payload, true)
            .await
            .map_err(|e| KeystoneError::Backend(format!("{}.{}: {}", target, call.method, e)))?;
        self.conn.codec.decode_return(target, &call.method, &data)
    }
}
