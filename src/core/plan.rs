//! Bootstrap plans: the fixed artifact set of a run, loaded from TOML.
//!
//! ```toml
//! [hub]
//! id = "Hub"
//! kind = "module"
//! template_file = "bin/Hub.bin"
//!
//! [[artifact]]
//! id = "ErrorsLib"
//! kind = "library"
//! template = "6080..."
//! register = "ErrorsLib"
//!
//! [[artifact]]
//! id = "Registry"
//! kind = "module"
//! template_file = "bin/Registry.bin"
//! links = ["ErrorsLib"]
//! args = [{ name = "hub", ref = "Hub" }]
//! register = "Registry"
//! bind = [{ method = "acceptDatabase", args = [{ ref = "RegistryDb" }],
//!           readback = { method = "getDatabase", expect = { ref = "RegistryDb" } } }]
//! ```
//!
//! Validation turns the implicit future graph into an explicit one with two
//! nodes per artifact, `Deployed(x)` and `Settled(x)`:
//!
//! - `Deployed(x)` needs `Deployed(hub)` and `Settled(d)` for each link or
//!   argument dependency `d`;
//! - `Settled(x)` needs `Deployed(x)` and `Deployed(p)` for each peer `p`
//!   named by a binding or check.
//!
//! A cycle in that graph would deadlock the run, so it is rejected up front.

use crate::core::artifact::{Artifact, ArtifactId, ArtifactKind, Template};
use crate::core::error::KeystoneError;
use crate::core::linker::legacy_placeholder;
use crate::core::registry::MAX_NAME_BYTES;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapPlan {
    pub hub: Artifact,
    #[serde(default, rename = "artifact")]
    pub artifacts: Vec<Artifact>,
}

/// Deployment waves derived from a validated plan: wave 0 is the hub, and
/// every artifact sits one wave after its latest hard dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentGraph {
    pub waves: Vec<Vec<ArtifactId>>,
}

impl BootstrapPlan {
    pub fn new(hub: Artifact, artifacts: Vec<Artifact>) -> Self {
        Self { hub, artifacts }
    }

    /// Read a plan file, load its template files and validate it.
    pub fn load(path: &Path) -> Result<Self, KeystoneError> {
        let content = fs::read_to_string(path).map_err(KeystoneError::IoError)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let plan = Self::from_toml_str(&content, base)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Parse a plan; `template_file` entries are read relative to `base`.
    pub fn from_toml_str(content: &str, base: &Path) -> Result<Self, KeystoneError> {
        let mut plan: BootstrapPlan =
            toml::from_str(content).map_err(|e| KeystoneError::Plan(e.to_string()))?;
        plan.hub = load_template(plan.hub, base)?;
        plan.artifacts = plan
            .artifacts
            .into_iter()
            .map(|a| load_template(a, base))
            .collect::<Result<_, _>>()?;
        Ok(plan)
    }

    /// The hub first, then the artifacts in plan order.
    pub fn all(&self) -> impl Iterator<Item = &Artifact> {
        std::iter::once(&self.hub).chain(self.artifacts.iter())
    }

    pub fn get(&self, id: &str) -> Option<&Artifact> {
        self.all().find(|a| a.id.as_str() == id)
    }

    /// Every hub registration the plan performs, as `(name, artifact)`.
    pub fn registrations(&self) -> Vec<(&str, &ArtifactId)> {
        self.all()
            .filter_map(|a| a.register.as_deref().map(|name| (name, &a.id)))
            .collect()
    }

    pub fn validate(&self) -> Result<DeploymentGraph, KeystoneError> {
        let mut problems = Vec::new();

        let mut kinds: HashMap<&ArtifactId, ArtifactKind> = HashMap::new();
        for artifact in self.all() {
            if artifact.id.as_str().trim().is_empty() {
                problems.push("artifact with an empty id".to_string());
            }
            if kinds.insert(&artifact.id, artifact.kind).is_some() {
                problems.push(format!("duplicate artifact id {}", artifact.id));
            }
            if artifact.template.is_empty() {
                problems.push(format!("{} has no template", artifact.id));
            }
        }

        if !self.hub.links.is_empty() || self.hub.argument_dependencies().next().is_some() {
            problems.push(format!("hub {} must not have dependencies", self.hub.id));
        }

        for artifact in self.all() {
            for id in artifact.references() {
                if !kinds.contains_key(id) {
                    problems.push(format!("{} references unknown artifact {}", artifact.id, id));
                }
            }
            for link in &artifact.links {
                match kinds.get(link) {
                    Some(ArtifactKind::Library) | None => {}
                    Some(other) => problems.push(format!(
                        "{} links {} which is a {}, not a library",
                        artifact.id,
                        link,
                        other.as_str()
                    )),
                }
            }
        }

        // Legacy placeholders truncate and pad the id, so distinct ids can collide.
        let mut labels: BTreeMap<String, &ArtifactId> = BTreeMap::new();
        for artifact in self.all() {
            if let Some(previous) = labels.insert(legacy_placeholder(&artifact.id), &artifact.id) {
                if previous != &artifact.id {
                    problems.push(format!(
                        "{} and {} share the same legacy link placeholder",
                        previous, artifact.id
                    ));
                }
            }
        }

        let mut names: BTreeMap<&str, &ArtifactId> = BTreeMap::new();
        for (name, id) in self.registrations() {
            if name.is_empty() || name.len() > MAX_NAME_BYTES {
                problems.push(format!(
                    "{} registers as '{}', names must be 1..={} bytes",
                    id, name, MAX_NAME_BYTES
                ));
            }
            if let Some(previous) = names.insert(name, id) {
                problems.push(format!(
                    "name '{}' registered by both {} and {}",
                    name, previous, id
                ));
            }
        }

        if !problems.is_empty() {
            return Err(KeystoneError::Plan(problems.join("; ")));
        }

        let stuck = self.detect_cycle();
        if !stuck.is_empty() {
            let ids: Vec<&str> = stuck.iter().map(|id| id.as_str()).collect();
            return Err(KeystoneError::Plan(format!(
                "dependency cycle among {}",
                ids.join(", ")
            )));
        }

        Ok(DeploymentGraph {
            waves: self.waves(),
        })
    }

    /// Artifacts whose stage nodes cannot be ordered, empty when acyclic.
    fn detect_cycle(&self) -> BTreeSet<&ArtifactId> {
        let artifacts: Vec<&Artifact> = self.all().collect();
        let index: HashMap<&ArtifactId, usize> =
            artifacts.iter().enumerate().map(|(i, a)| (&a.id, i)).collect();
        let deployed = |i: usize| 2 * i;
        let settled = |i: usize| 2 * i + 1;

        // requires[n] lists the nodes that must complete before n.
        let mut requires: Vec<Vec<usize>> = vec![Vec::new(); artifacts.len() * 2];
        for (i, artifact) in artifacts.iter().enumerate() {
            if i != 0 {
                requires[deployed(i)].push(deployed(0));
            }
            for dep in artifact.hard_dependencies() {
                if let Some(&d) = index.get(dep) {
                    requires[deployed(i)].push(settled(d));
                }
            }
            requires[settled(i)].push(deployed(i));
            for peer in artifact.peer_references() {
                if let Some(&p) = index.get(peer) {
                    requires[settled(i)].push(deployed(p));
                }
            }
        }

        let mut pending: Vec<usize> = requires.iter().map(Vec::len).collect();
        let mut unblocks: Vec<Vec<usize>> = vec![Vec::new(); requires.len()];
        for (node, reqs) in requires.iter().enumerate() {
            for &r in reqs {
                unblocks[r].push(node);
            }
        }

        let mut queue: VecDeque<usize> = (0..pending.len()).filter(|&n| pending[n] == 0).collect();
        let mut done = vec![false; pending.len()];
        while let Some(node) = queue.pop_front() {
            done[node] = true;
            for &next in &unblocks[node] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        done.iter()
            .enumerate()
            .filter(|(_, ok)| !**ok)
            .map(|(node, _)| &artifacts[node / 2].id)
            .collect()
    }

    fn waves(&self) -> Vec<Vec<ArtifactId>> {
        let mut depth: BTreeMap<&ArtifactId, usize> = BTreeMap::new();
        depth.insert(&self.hub.id, 0);

        // Acyclic by now, so this settles within one pass per artifact.
        let mut remaining: Vec<&Artifact> = self.artifacts.iter().collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|artifact| {
                let deps = artifact.hard_dependencies();
                if deps.iter().all(|d| depth.contains_key(*d)) {
                    let level = deps.iter().map(|d| depth[*d]).max().unwrap_or(0) + 1;
                    depth.insert(&artifact.id, level);
                    false
                } else {
                    true
                }
            });
            if remaining.len() == before {
                break;
            }
        }

        let mut waves: Vec<Vec<ArtifactId>> = Vec::new();
        for artifact in self.all() {
            if let Some(&level) = depth.get(&artifact.id) {
                if waves.len() <= level {
                    waves.resize(level + 1, Vec::new());
                }
                waves[level].push(artifact.id.clone());
            }
        }
        waves
    }
}

fn load_template(mut artifact: Artifact, base: &Path) -> Result<Artifact, KeystoneError> {
    if let Some(file) = artifact.template_file.take() {
        if !artifact.template.is_empty() {
            return Err(KeystoneError::Plan(format!(
                "{} sets both template and template_file",
                artifact.id
            )));
        }
        let path = base.join(&file);
        let text = fs::read_to_string(&path).map_err(|e| {
            KeystoneError::Plan(format!(
                "{}: cannot read template {}: {}",
                artifact.id,
                path.display(),
                e
            ))
        })?;
        artifact.template = Template::new(text);
    }
    Ok(artifact)
}
