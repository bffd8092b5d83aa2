use crate::core::artifact::ArtifactId;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoneError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Unresolved link placeholder {placeholder}")]
    UnresolvedPlaceholder { placeholder: String },
    #[error("Link placeholder {placeholder} matches both {first} and {second}")]
    AmbiguousPlaceholder {
        placeholder: String,
        first: ArtifactId,
        second: ArtifactId,
    },
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Deployment of {artifact} rejected: {message}")]
    Deployment { artifact: ArtifactId, message: String },
    #[error("{artifact} landed at {address} but could not be journalled: {message}")]
    Unrecorded {
        artifact: ArtifactId,
        address: String,
        message: String,
    },
    #[error("Consistency check failed for {subject}: expected {expected}, found {actual}")]
    Consistency {
        subject: String,
        expected: String,
        actual: String,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Name {name} is already registered to {existing}, refusing to register {requested}")]
    DuplicateRegistration {
        name: String,
        existing: String,
        requested: String,
    },
    #[error("Publishing {name} to the name service failed: {message}")]
    Publish { name: String, message: String },
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Plan error: {0}")]
    Plan(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("{0}")]
    Run(#[from] RunError),
}

/// The step of an artifact's bring-up that was running when a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    Link,
    Deploy,
    Bind,
    Register,
    Verify,
    Publish,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Link => "link",
            Phase::Deploy => "deploy",
            Phase::Bind => "bind",
            Phase::Register => "register",
            Phase::Verify => "verify",
            Phase::Publish => "publish",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First fatal error of a bootstrap run, annotated with where it happened.
///
/// Cheap to clone: dependents of a failed artifact fail with the same error.
#[derive(Error, Debug, Clone)]
#[error("{phase} failed{}: {source}", .artifact.as_ref().map(|a| format!(" for {a}")).unwrap_or_default())]
pub struct RunError {
    pub artifact: Option<ArtifactId>,
    pub phase: Phase,
    #[source]
    pub source: Arc<KeystoneError>,
}

impl RunError {
    pub fn new(artifact: &ArtifactId, phase: Phase, source: KeystoneError) -> Self {
        Self {
            artifact: Some(artifact.clone()),
            phase,
            source: Arc::new(source),
        }
    }

    pub fn plan(source: KeystoneError) -> Self {
        Self {
            artifact: None,
            phase: Phase::Plan,
            source: Arc::new(source),
        }
    }
}
