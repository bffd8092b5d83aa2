//! Bootstrap entry point.
//!
//! Each artifact of a plan becomes one resolver task that walks the same
//! steps: wait for the hub and its hard dependencies, link, deploy, bind,
//! register, verify. Ordering between artifacts comes only from which
//! promises a task awaits.

use crate::core::address::{Address, ResolvedAddress};
use crate::core::artifact::{Artifact, ArtifactId, Param};
use crate::core::backend::Connection;
use crate::core::codec::{Arg, Call, Word};
use crate::core::config::{BootstrapConfig, NameRegConfig};
use crate::core::deployer::Deployer;
use crate::core::error::{KeystoneError, Phase, RunError};
use crate::core::journal::Journal;
use crate::core::linker::Linker;
use crate::core::namereg::NameRegistry;
use crate::core::plan::BootstrapPlan;
use crate::core::registry::{DuplicatePolicy, HubClient};
use crate::core::resolver::{ArtifactHandle, DependencyResolver, DeploySignal, Outcome};
use crate::core::time;
use crate::core::verify::ConsistencyVerifier;
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub hub: Address,
    /// Hub directory entries written by this run.
    pub entries: BTreeMap<String, Address>,
    pub deployed: BTreeMap<ArtifactId, Address>,
    /// Name-service key the hub address was published under.
    pub published_as: Option<String>,
}

pub struct Orchestrator {
    conn: Connection,
    config: BootstrapConfig,
    journal: Option<Arc<Journal>>,
    drain: Option<Duration>,
}

/// Run `plan` against `connection` without a journal.
pub async fn run(
    connection: Connection,
    plan: &BootstrapPlan,
    config: BootstrapConfig,
) -> Result<RunResult, RunError> {
    Orchestrator::new(connection, config).run(plan).await
}

impl Orchestrator {
    pub fn new(conn: Connection, config: BootstrapConfig) -> Self {
        Self {
            conn,
            config,
            journal: None,
            drain: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// After a failure, give in-flight artifacts up to `grace` to settle
    /// before `run` returns. Without it the error is returned at once and
    /// the remaining tasks only finish if the runtime outlives the call.
    pub fn with_drain(mut self, grace: Duration) -> Self {
        self.drain = Some(grace);
        self
    }

    pub async fn run(&self, plan: &BootstrapPlan) -> Result<RunResult, RunError> {
        let graph = plan.validate().map_err(RunError::plan)?;
        let run_id = match &self.journal {
            Some(journal) => journal.begin_run(&plan.hub.id).map_err(RunError::plan)?,
            None => time::new_run_id(),
        };
        info!(
            run_id = %run_id,
            artifacts = plan.artifacts.len() + 1,
            waves = graph.waves.len(),
            "bootstrap starting"
        );

        let outcome = self.execute(plan, &run_id).await;
        match &outcome {
            Ok(result) => info!(
                run_id = %run_id,
                hub = %result.hub,
                deployed = result.deployed.len(),
                registered = result.entries.len(),
                "bootstrap complete"
            ),
            Err(e) => error!(run_id = %run_id, error = %e, "bootstrap failed"),
        }

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.finish_run(&run_id, outcome.as_ref().err()) {
                warn!(run_id = %run_id, error = %e, "could not close run in journal");
            }
        }
        outcome
    }

    async fn execute(&self, plan: &BootstrapPlan, run_id: &str) -> Result<RunResult, RunError> {
        let ctx = Arc::new(RunContext {
            conn: self.conn.clone(),
            config: self.config.clone(),
            journal: self.journal.clone(),
            run_id: run_id.to_string(),
            hub_id: plan.hub.id.clone(),
        });

        let resolver = DependencyResolver::new();
        let hub_handle = resolver.handle(&plan.hub.id);

        let mut handles = Vec::with_capacity(plan.artifacts.len() + 1);
        for artifact in plan.all() {
            let inputs = Inputs {
                hub: (artifact.id != plan.hub.id).then(|| hub_handle.clone()),
                deps: artifact
                    .hard_dependencies()
                    .into_iter()
                    .map(|d| resolver.handle(d))
                    .collect(),
                peers: artifact
                    .peer_references()
                    .into_iter()
                    .map(|p| resolver.handle(p))
                    .collect(),
            };
            let id = artifact.id.clone();
            let ctx = ctx.clone();
            let artifact = artifact.clone();
            handles.push(resolver.declare(&id, move |signal| {
                bring_up(ctx, artifact, inputs, signal)
            }));
        }

        let publish = spawn_publish(ctx.clone(), hub_handle.clone());
        let joined = futures::try_join!(DependencyResolver::await_all(&handles), publish);
        let (settled, published_as) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                if let Some(grace) = self.drain {
                    drain(&handles, grace).await;
                }
                return Err(e);
            }
        };

        let deployed: BTreeMap<ArtifactId, Address> = settled
            .iter()
            .map(|r| (r.artifact().clone(), r.address()))
            .collect();
        let hub = deployed.get(&plan.hub.id).copied().ok_or_else(|| {
            RunError::new(
                &plan.hub.id,
                Phase::Deploy,
                KeystoneError::NotFound("hub address".to_string()),
            )
        })?;
        let entries = plan
            .registrations()
            .into_iter()
            .filter_map(|(name, id)| deployed.get(id).map(|a| (name.to_string(), *a)))
            .collect();

        Ok(RunResult {
            run_id: run_id.to_string(),
            hub,
            entries,
            deployed,
            published_as,
        })
    }
}

/// Wait up to `grace` for every task to settle, whatever the outcome.
async fn drain(handles: &[ArtifactHandle], grace: Duration) {
    let pending = futures::future::join_all(handles.iter().map(ArtifactHandle::settled));
    match tokio::time::timeout(grace, pending).await {
        Ok(outcomes) => {
            let failed = outcomes.iter().filter(|o| o.is_err()).count();
            debug!(artifacts = outcomes.len(), failed, "in-flight artifacts drained");
        }
        Err(_) => warn!(
            grace_ms = grace.as_millis() as u64,
            "artifacts still in flight when the run was abandoned"
        ),
    }
}

/// Find an existing network: resolve the hub through the name service, then
/// look every name up on it.
pub async fn attach(
    conn: &Connection,
    publish_name: &str,
    names: &[String],
) -> Result<BTreeMap<String, Address>, KeystoneError> {
    let registry = NameRegistry::new(conn.names.clone(), &NameRegConfig::default());
    let value = registry.resolve(publish_name).await?.ok_or_else(|| {
        KeystoneError::NotFound(format!("name service entry '{}'", publish_name))
    })?;
    let hub_address = Address::from_str(&value)?;
    debug!(name = publish_name, hub = %hub_address, "hub resolved");

    let hub = HubClient::new(
        conn.clone(),
        ArtifactId::from(publish_name),
        hub_address,
        DuplicatePolicy::default(),
    );
    let hub = &hub;
    let found = try_join_all(names.iter().map(|name| async move {
        hub.lookup(name).await.map(|address| (name.clone(), address))
    }))
    .await?;
    Ok(found.into_iter().collect())
}

struct RunContext {
    conn: Connection,
    config: BootstrapConfig,
    journal: Option<Arc<Journal>>,
    run_id: String,
    hub_id: ArtifactId,
}

impl RunContext {
    /// Apply `f` to the journal, if any. SQLite calls block, so they run on
    /// the blocking pool rather than on a runtime worker.
    async fn note<F>(&self, f: F) -> Result<(), KeystoneError>
    where
        F: FnOnce(&Journal, &str) -> Result<(), KeystoneError> + Send + 'static,
    {
        let Some(journal) = self.journal.clone() else {
            return Ok(());
        };
        let run_id = self.run_id.clone();
        match tokio::task::spawn_blocking(move || f(&journal, &run_id)).await {
            Ok(outcome) => outcome,
            Err(e) => Err(KeystoneError::Backend(format!("journal write failed: {}", e))),
        }
    }
}

/// Promises an artifact task waits on.
struct Inputs {
    /// `None` for the hub itself.
    hub: Option<ArtifactHandle>,
    /// Link and argument dependencies, awaited until settled.
    deps: Vec<ArtifactHandle>,
    /// Artifacts named by bindings and checks, awaited until deployed.
    peers: Vec<ArtifactHandle>,
}

fn at(id: &ArtifactId, phase: Phase) -> impl FnOnce(KeystoneError) -> RunError + '_ {
    move |source| RunError::new(id, phase, source)
}

async fn bring_up(
    ctx: Arc<RunContext>,
    artifact: Artifact,
    inputs: Inputs,
    signal: DeploySignal,
) -> Outcome {
    let id = &artifact.id;
    let mut known: BTreeMap<ArtifactId, Address> = BTreeMap::new();

    if let Some(hub) = &inputs.hub {
        let hub = hub.address().await?;
        known.insert(hub.artifact().clone(), hub.address());
    }
    for dep in try_join_all(inputs.deps.iter().map(ArtifactHandle::settled)).await? {
        known.insert(dep.artifact().clone(), dep.address());
    }
    debug!(artifact = %id, inputs = known.len(), "dependencies ready");

    // Only declared links are substituted; any other placeholder stays unresolved.
    let libraries: BTreeMap<ArtifactId, Address> = artifact
        .links
        .iter()
        .filter_map(|l| known.get(l).map(|a| (l.clone(), *a)))
        .collect();
    let code = Linker::new()
        .link(&artifact.template, &libraries)
        .map_err(at(id, Phase::Link))?;
    let args = resolve_args(&artifact.args, &known).map_err(at(id, Phase::Deploy))?;
    let landed = Deployer::new(ctx.conn.clone())
        .deploy(id, code, &args)
        .await
        .map_err(at(id, Phase::Deploy))?;
    let (kind, row) = (artifact.kind, landed.clone());
    if let Err(e) = ctx.note(move |j, run| j.record_landed(run, kind, &row)).await {
        warn!(artifact = %id, address = %landed.address(), error = %e, "landed but not journalled");
        return Err(RunError::new(
            id,
            Phase::Deploy,
            KeystoneError::Unrecorded {
                artifact: id.clone(),
                address: landed.address().to_string(),
                message: e.to_string(),
            },
        ));
    }
    signal.resolved(&landed);
    known.insert(id.clone(), landed.address());

    for peer in try_join_all(inputs.peers.iter().map(ArtifactHandle::address)).await? {
        known.insert(peer.artifact().clone(), peer.address());
    }

    let verifier = ConsistencyVerifier::new(ctx.conn.clone());

    for binding in &artifact.bind {
        let target = binding.target.as_ref().unwrap_or(id);
        let target_address = address_of(target, &known).map_err(at(id, Phase::Bind))?;
        let call = build_call(&binding.method, &binding.args, &known).map_err(at(id, Phase::Bind))?;
        invoke(&ctx.conn, target, target_address, &call)
            .await
            .map_err(at(id, Phase::Bind))?;
        info!(artifact = %id, target = %target, method = %binding.method, "bound");

        if let Some(readback) = &binding.readback {
            let call = build_call(&readback.method, &readback.args, &known)
                .map_err(at(id, Phase::Verify))?;
            let expected = readback
                .expect
                .value
                .resolve(&known)
                .map_err(at(id, Phase::Verify))?;
            verifier
                .verify(&format!("{}.{}", target, readback.method), &expected, || {
                    verifier.read(target, target_address, &call)
                })
                .await
                .map_err(at(id, Phase::Verify))?;
        }
    }
    if !artifact.bind.is_empty() {
        let who = id.clone();
        ctx.note(move |j, run| j.advance(run, &who, Phase::Bind.as_str()))
            .await
            .map_err(at(id, Phase::Bind))?;
    }

    if let Some(name) = &artifact.register {
        let hub_address = address_of(&ctx.hub_id, &known).map_err(at(id, Phase::Register))?;
        let hub = HubClient::new(
            ctx.conn.clone(),
            ctx.hub_id.clone(),
            hub_address,
            ctx.config.registry.on_duplicate,
        );
        hub.register(name, landed.address())
            .await
            .map_err(at(id, Phase::Register))?;

        if ctx.config.registry.verify_registrations {
            verifier
                .verify(
                    &format!("hub entry {}", name),
                    &Word::Address(landed.address()),
                    || async {
                        let found = hub.try_lookup(name).await?;
                        Ok::<_, KeystoneError>(found.map(Word::Address).unwrap_or(Word::Null))
                    },
                )
                .await
                .map_err(at(id, Phase::Verify))?;
        }
        let (who, entry, address) = (id.clone(), name.clone(), landed.address());
        ctx.note(move |j, run| {
            j.record_registration(run, &entry, address)?;
            j.advance(run, &who, Phase::Register.as_str())
        })
        .await
        .map_err(at(id, Phase::Register))?;
    }

    for check in &artifact.verify {
        let target = check.target.as_ref().unwrap_or(id);
        let target_address = address_of(target, &known).map_err(at(id, Phase::Verify))?;
        let call = build_call(&check.method, &check.args, &known).map_err(at(id, Phase::Verify))?;
        let expected = check
            .expect
            .value
            .resolve(&known)
            .map_err(at(id, Phase::Verify))?;
        verifier
            .verify(&format!("{}.{}", target, check.method), &expected, || {
                verifier.read(target, target_address, &call)
            })
            .await
            .map_err(at(id, Phase::Verify))?;
    }

    let who = id.clone();
    ctx.note(move |j, run| j.advance(run, &who, "settled"))
        .await
        .map_err(at(id, Phase::Verify))?;
    info!(artifact = %id, address = %landed.address(), "settled");
    Ok(landed)
}

fn spawn_publish(
    ctx: Arc<RunContext>,
    hub: ArtifactHandle,
) -> impl Future<Output = Result<Option<String>, RunError>> {
    let hub_id = ctx.hub_id.clone();
    let task = tokio::spawn(async move {
        if !ctx.config.hub.publish {
            return Ok(None);
        }
        let settled: ResolvedAddress = hub.settled().await?;
        let name = ctx.config.hub.publish_as.clone();
        NameRegistry::new(ctx.conn.names.clone(), &ctx.config.namereg)
            .publish(&name, &settled.address().to_hex())
            .await
            .map_err(at(&ctx.hub_id, Phase::Publish))?;
        Ok::<_, RunError>(Some(name))
    });
    async move {
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RunError::new(
                &hub_id,
                Phase::Publish,
                KeystoneError::Backend(e.to_string()),
            )),
        }
    }
}

fn address_of(id: &ArtifactId, known: &BTreeMap<ArtifactId, Address>) -> Result<Address, KeystoneError> {
    known
        .get(id)
        .copied()
        .ok_or_else(|| KeystoneError::NotFound(format!("address of artifact {}", id)))
}

fn resolve_args(params: &[Param], known: &BTreeMap<ArtifactId, Address>) -> Result<Vec<Arg>, KeystoneError> {
    params
        .iter()
        .map(|p| {
            Ok(Arg {
                name: p.name.clone(),
                value: p.value.resolve(known)?,
            })
        })
        .collect()
}

fn build_call(
    method: &str,
    params: &[Param],
    known: &BTreeMap<ArtifactId, Address>,
) -> Result<Call, KeystoneError> {
    Ok(Call {
        method: method.to_string(),
        args: resolve_args(params, known)?,
    })
}

async fn invoke(
    conn: &Connection,
    target: &ArtifactId,
    address: Address,
    call: &Call,
) -> Result<Word, KeystoneError> {
    let payload = conn.codec.encode_call(target, call)?;
    let data = conn
        .backend
        .invoke(address, payload, false)
        .await
        .map_err(|e| KeystoneError::Backend(format!("{}.{}: {}", target, call.method, e)))?;
    conn.codec.decode_return(target, &call.method, &data)
}
