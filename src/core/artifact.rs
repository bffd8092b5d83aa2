//! Artifact definitions: the static inputs of a bootstrap run.
//!
//! An artifact is a deployable unit (library, data store or module) with a
//! bytecode template, constructor params and the post-deploy steps that wire
//! it into the network. Its dependencies are derived from those fields:
//!
//! - **link dependencies** (`links`) are libraries whose addresses get
//!   substituted into the template before deployment;
//! - **argument dependencies** are `ref` constructor params;
//! - **peer references** are artifacts named by bindings and checks. They only
//!   need to be deployed, not settled, so two artifacts may wire each other.

use crate::core::address::Address;
use crate::core::codec::Word;
use crate::core::error::KeystoneError;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Stable symbolic identifier of an artifact, unique within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ArtifactId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArtifactId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Linked into other artifacts' bytecode by address substitution.
    Library,
    DataStore,
    Module,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &str {
        match self {
            ArtifactKind::Library => "library",
            ArtifactKind::DataStore => "datastore",
            ArtifactKind::Module => "module",
        }
    }
}

/// Hex bytecode text that may embed 40-character link placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Template(String);

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        let text: String = text.into();
        let trimmed = text.trim();
        let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        Self(body.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A typed value as written in a plan, before addresses are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    /// Address of another artifact in the plan.
    Ref(ArtifactId),
    Address(Address),
    Text(String),
    Uint(u64),
    Bool(bool),
}

impl Value {
    pub fn reference(&self) -> Option<&ArtifactId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// Replace artifact references with their deployed addresses.
    pub fn resolve(&self, addresses: &BTreeMap<ArtifactId, Address>) -> Result<Word, KeystoneError> {
        Ok(match self {
            Value::Ref(id) => Word::Address(*addresses.get(id).ok_or_else(|| {
                KeystoneError::NotFound(format!("address of artifact {}", id))
            })?),
            Value::Address(a) => Word::Address(*a),
            Value::Text(s) => Word::Text(s.clone()),
            Value::Uint(n) => Word::Uint(*n),
            Value::Bool(b) => Word::Bool(*b),
        })
    }
}

/// An optionally named value: constructor inputs, call arguments, expectations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawParam")]
pub struct Param {
    pub name: Option<String>,
    pub value: Value,
}

impl Param {
    pub fn new(name: Option<&str>, value: Value) -> Self {
        Self {
            name: name.map(str::to_string),
            value,
        }
    }

    pub fn reference(id: &str) -> Self {
        Self::new(None, Value::Ref(ArtifactId::from(id)))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParam {
    name: Option<String>,
    #[serde(rename = "ref")]
    reference: Option<String>,
    address: Option<Address>,
    text: Option<String>,
    uint: Option<u64>,
    bool: Option<bool>,
}

impl TryFrom<RawParam> for Param {
    type Error = String;

    fn try_from(raw: RawParam) -> Result<Self, Self::Error> {
        let mut values = Vec::new();
        if let Some(id) = raw.reference {
            values.push(Value::Ref(ArtifactId::new(id)));
        }
        if let Some(a) = raw.address {
            values.push(Value::Address(a));
        }
        if let Some(s) = raw.text {
            values.push(Value::Text(s));
        }
        if let Some(n) = raw.uint {
            values.push(Value::Uint(n));
        }
        if let Some(b) = raw.bool {
            values.push(Value::Bool(b));
        }
        if values.len() != 1 {
            return Err(format!(
                "a param needs exactly one of ref/address/text/uint/bool, found {}",
                values.len()
            ));
        }
        Ok(Param {
            name: raw.name,
            value: values.remove(0),
        })
    }
}

/// Read-only call whose result must equal `expect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadBack {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Param>,
    pub expect: Param,
}

/// A post-deploy call that wires an artifact to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
    /// Artifact receiving the call; the binding's owner when absent.
    pub target: Option<ArtifactId>,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Param>,
    pub readback: Option<ReadBack>,
}

/// A post-registration assertion against live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Check {
    pub target: Option<ArtifactId>,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Param>,
    pub expect: Param,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    #[serde(default)]
    pub template: Template,
    /// Loaded into `template` by the plan loader, relative to the plan file.
    #[serde(default, skip_serializing)]
    pub template_file: Option<PathBuf>,
    #[serde(default)]
    pub links: Vec<ArtifactId>,
    #[serde(default)]
    pub args: Vec<Param>,
    /// Hub name this artifact is registered under.
    pub register: Option<String>,
    #[serde(default)]
    pub bind: Vec<Binding>,
    #[serde(default)]
    pub verify: Vec<Check>,
}

impl Artifact {
    pub fn new(id: &str, kind: ArtifactKind, template: Template) -> Self {
        Self {
            id: ArtifactId::from(id),
            kind,
            template,
            template_file: None,
            links: Vec::new(),
            args: Vec::new(),
            register: None,
            bind: Vec::new(),
            verify: Vec::new(),
        }
    }

    pub fn link_dependencies(&self) -> &[ArtifactId] {
        &self.links
    }

    pub fn argument_dependencies(&self) -> impl Iterator<Item = &ArtifactId> {
        self.args.iter().filter_map(|p| p.value.reference())
    }

    /// Dependencies that must be settled before this artifact can deploy.
    pub fn hard_dependencies(&self) -> BTreeSet<&ArtifactId> {
        self.links
            .iter()
            .chain(self.argument_dependencies())
            .collect()
    }

    /// Other artifacts named by bindings and checks; they only need an address.
    pub fn peer_references(&self) -> BTreeSet<&ArtifactId> {
        let mut peers = BTreeSet::new();
        for binding in &self.bind {
            peers.extend(binding.target.iter());
            peers.extend(binding.args.iter().filter_map(|p| p.value.reference()));
            if let Some(rb) = &binding.readback {
                peers.extend(rb.args.iter().filter_map(|p| p.value.reference()));
                peers.extend(rb.expect.value.reference());
            }
        }
        for check in &self.verify {
            peers.extend(check.target.iter());
            peers.extend(check.args.iter().filter_map(|p| p.value.reference()));
            peers.extend(check.expect.value.reference());
        }
        peers.remove(&self.id);
        peers
    }

    /// Every artifact id this one mentions, self excluded.
    pub fn references(&self) -> BTreeSet<&ArtifactId> {
        let mut all = self.hard_dependencies();
        all.extend(self.peer_references());
        all
    }
}
