//! Marshalling boundary between typed calls and backend payloads.
//!
//! The engine never builds payloads itself: constructor inputs and method
//! calls go through a [`Codec`]. [`JsonCodec`] is the reference encoding used
//! by the simulated backend; an ABI codec plugs in the same way.

use crate::core::address::Address;
use crate::core::artifact::ArtifactId;
use crate::core::error::KeystoneError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A resolved, typed value as it crosses the backend boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Word {
    Address(Address),
    Text(String),
    Uint(u64),
    Bool(bool),
    Null,
}

impl Word {
    pub fn as_address(&self) -> Option<Address> {
        match self {
            Word::Address(a) => Some(*a),
            Word::Text(s) => Address::from_str(s).ok(),
            _ => None,
        }
    }

    /// Equality that treats an address and its hex text as the same value.
    pub fn matches(&self, other: &Word) -> bool {
        match (self, other) {
            (Word::Address(a), Word::Text(_)) => other.as_address() == Some(*a),
            (Word::Text(_), Word::Address(b)) => self.as_address() == Some(*b),
            _ => self == other,
        }
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Word::Address(a) => write!(f, "{}", a),
            Word::Text(s) => write!(f, "{:?}", s),
            Word::Uint(n) => write!(f, "{}", n),
            Word::Bool(b) => write!(f, "{}", b),
            Word::Null => f.write_str("null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: Word,
}

impl Arg {
    pub fn positional(value: Word) -> Self {
        Self { name: None, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Arg>,
}

impl Call {
    pub fn new(method: &str, args: Vec<Word>) -> Self {
        Self {
            method: method.to_string(),
            args: args.into_iter().map(Arg::positional).collect(),
        }
    }
}

pub trait Codec: Send + Sync {
    fn encode_constructor(&self, artifact: &ArtifactId, args: &[Arg]) -> Result<Vec<u8>, KeystoneError>;
    fn encode_call(&self, artifact: &ArtifactId, call: &Call) -> Result<Vec<u8>, KeystoneError>;
    fn decode_return(
        &self,
        artifact: &ArtifactId,
        method: &str,
        data: &[u8],
    ) -> Result<Word, KeystoneError>;
}

/// JSON payloads: constructors are an argument list, calls are `{method, args}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn decode_constructor(data: &[u8]) -> Result<Vec<Arg>, KeystoneError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(data).map_err(|e| KeystoneError::Codec(e.to_string()))
    }

    pub fn decode_call(data: &[u8]) -> Result<Call, KeystoneError> {
        serde_json::from_slice(data).map_err(|e| KeystoneError::Codec(e.to_string()))
    }

    pub fn encode_return(word: &Word) -> Result<Vec<u8>, KeystoneError> {
        serde_json::to_vec(word).map_err(|e| KeystoneError::Codec(e.to_string()))
    }
}

impl Codec for JsonCodec {
    fn encode_constructor(&self, artifact: &ArtifactId, args: &[Arg]) -> Result<Vec<u8>, KeystoneError> {
        if args.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::to_vec(args)
            .map_err(|e| KeystoneError::Codec(format!("constructor of {}: {}", artifact, e)))
    }

    fn encode_call(&self, artifact: &ArtifactId, call: &Call) -> Result<Vec<u8>, KeystoneError> {
        serde_json::to_vec(call)
            .map_err(|e| KeystoneError::Codec(format!("{}.{}: {}", artifact, call.method, e)))
    }

    fn decode_return(
        &self,
        artifact: &ArtifactId,
        method: &str,
        data: &[u8],
    ) -> Result<Word, KeystoneError> {
        if data.is_empty() {
            return Ok(Word::Null);
        }
        serde_json::from_slice(data)
            .map_err(|e| KeystoneError::Codec(format!("{}.{} returned {}", artifact, method, e)))
    }
}
