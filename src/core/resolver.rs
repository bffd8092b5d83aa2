//! Future-per-artifact dependency resolution.
//!
//! Every artifact is a spawned task plus two one-shot promises: `address`
//! (fulfilled as soon as the artifact is deployed) and `settled` (fulfilled
//! when all of its post-deploy steps are done, or with its error). A task
//! orders itself by awaiting the promises of the artifacts it needs, so no
//! topological sort is performed here. The resolver does not detect cycles;
//! plans are validated for that before anything is declared.
//!
//! Fan-in through [`DependencyResolver::await_all`] fails fast on the first
//! error, but dropping the remaining waiters does not cancel their tasks:
//! backend submissions cannot be recalled, so in-flight siblings run to
//! completion and their results are simply not consumed.

use crate::core::address::ResolvedAddress;
use crate::core::artifact::ArtifactId;
use crate::core::error::{KeystoneError, Phase, RunError};
use futures::FutureExt;
use futures::future::try_join_all;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// What an artifact task finally produced. Dependents that fail because of it
/// pass the same error on.
pub type Outcome = Result<ResolvedAddress, RunError>;

struct Promise {
    tx: watch::Sender<Option<Outcome>>,
}

impl Promise {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// First write wins; later writes are ignored.
    fn fulfil(&self, outcome: Outcome) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }

    async fn wait(&self, id: &ArtifactId) -> Outcome {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(RunError::new(
                id,
                Phase::Deploy,
                KeystoneError::Backend("deployment task went away".to_string()),
            ))
        })
    }
}

struct Slot {
    deployed: Promise,
    settled: Promise,
    claimed: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            deployed: Promise::new(),
            settled: Promise::new(),
            claimed: AtomicBool::new(false),
        }
    }
}

/// Await-able view of one artifact's progress.
#[derive(Clone)]
pub struct ArtifactHandle {
    id: ArtifactId,
    slot: Arc<Slot>,
}

impl ArtifactHandle {
    pub fn id(&self) -> &ArtifactId {
        &self.id
    }

    pub fn is_declared(&self) -> bool {
        self.slot.claimed.load(Ordering::SeqCst)
    }

    /// Resolves once the artifact has an address.
    pub async fn address(&self) -> Outcome {
        self.slot.deployed.wait(&self.id).await
    }

    /// Resolves once the artifact has completed every step.
    pub async fn settled(&self) -> Outcome {
        self.slot.settled.wait(&self.id).await
    }
}

/// Handed to a deployment task so it can publish its address early.
pub struct DeploySignal {
    slot: Arc<Slot>,
}

impl DeploySignal {
    pub fn resolved(&self, address: &ResolvedAddress) {
        self.slot.deployed.fulfil(Ok(address.clone()));
    }
}

#[derive(Default)]
pub struct DependencyResolver {
    slots: Mutex<FxHashMap<ArtifactId, Arc<Slot>>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `id`, whether or not it has been declared yet.
    pub fn handle(&self, id: &ArtifactId) -> ArtifactHandle {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();
        ArtifactHandle {
            id: id.clone(),
            slot,
        }
    }

    /// Number of artifacts that have been declared.
    pub fn declared(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|s| s.claimed.load(Ordering::SeqCst))
            .count()
    }

    /// Start `job` for `id` unless it was already declared in this run.
    ///
    /// Must be called from within a tokio runtime. The task starts right away
    /// and keeps running even if nobody awaits its handle.
    pub fn declare<F, Fut>(&self, id: &ArtifactId, job: F) -> ArtifactHandle
    where
        F: FnOnce(DeploySignal) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let handle = self.handle(id);
        if handle.slot.claimed.swap(true, Ordering::SeqCst) {
            return handle;
        }

        let slot = handle.slot.clone();
        let task = job(DeploySignal { slot: slot.clone() });
        let task_id = id.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(RunError::new(
                    &task_id,
                    Phase::Deploy,
                    KeystoneError::Backend("deployment task panicked".to_string()),
                )),
            };
            // A task that failed before deploying rejects its address promise too.
            slot.deployed.fulfil(outcome.clone());
            slot.settled.fulfil(outcome);
        });
        handle
    }

    /// Wait for every handle to settle, failing on the first error observed.
    pub async fn await_all(handles: &[ArtifactHandle]) -> Result<Vec<ResolvedAddress>, RunError> {
        try_join_all(handles.iter().map(|h| h.settled())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::Address;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn resolved(id: &str, b: u8) -> ResolvedAddress {
        ResolvedAddress::new(ArtifactId::from(id), Address::from_bytes(&[b; 20]).unwrap())
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let resolver = DependencyResolver::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let id = ArtifactId::from("L");

        for _ in 0..3 {
            let runs = runs.clone();
            resolver.declare(&id, move |signal| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                let out = resolved("L", 1);
                signal.resolved(&out);
                Ok(out)
            });
        }

        let out = resolver.handle(&id).settled().await.unwrap();
        assert_eq!(out.address(), Address::from_bytes(&[1; 20]).unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.declared(), 1);
    }

    #[tokio::test]
    async fn test_dependent_waits_for_dependency() {
        let resolver = DependencyResolver::new();
        let lib = ArtifactId::from("L");
        let module = ArtifactId::from("M");

        // Declared before its dependency exists.
        let dep = resolver.handle(&lib);
        let m = resolver.declare(&module, move |_signal| async move {
            let l = dep.settled().await?;
            Ok(ResolvedAddress::new(ArtifactId::from("M"), l.address()))
        });
        assert!(!resolver.handle(&lib).is_declared());

        resolver.declare(&lib, |_signal| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(resolved("L", 5))
        });

        let out = m.settled().await.unwrap();
        assert_eq!(out.address(), Address::from_bytes(&[5; 20]).unwrap());
    }

    #[tokio::test]
    async fn test_address_resolves_before_settled() {
        let resolver = DependencyResolver::new();
        let id = ArtifactId::from("D");
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = resolver.declare(&id, move |signal| async move {
            let out = resolved("D", 3);
            signal.resolved(&out);
            let _ = release_rx.await;
            Ok(out)
        });

        let addr = handle.address().await.unwrap();
        assert_eq!(addr.address(), Address::from_bytes(&[3; 20]).unwrap());
        let _ = release_tx.send(());
        assert!(handle.settled().await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_rejects_both_promises() {
        let resolver = DependencyResolver::new();
        let id = ArtifactId::from("X");
        let handle = resolver.declare(&id, |_signal| async {
            Err(RunError::new(
                &ArtifactId::from("X"),
                Phase::Link,
                KeystoneError::UnresolvedPlaceholder {
                    placeholder: "__x__".to_string(),
                },
            ))
        });
        let err = handle.address().await.unwrap_err();
        assert_eq!(err.phase, Phase::Link);
        assert!(handle.settled().await.is_err());
    }

    #[tokio::test]
    async fn test_await_all_fails_fast_without_cancelling_siblings() {
        let resolver = DependencyResolver::new();
        let finished = Arc::new(AtomicBool::new(false));

        let slow_done = finished.clone();
        let slow = resolver.declare(&ArtifactId::from("slow"), move |_signal| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            slow_done.store(true, Ordering::SeqCst);
            Ok(resolved("slow", 1))
        });
        let failing = resolver.declare(&ArtifactId::from("bad"), |_signal| async {
            Err(RunError::plan(KeystoneError::Plan("boom".into())))
        });

        let err = DependencyResolver::await_all(&[slow.clone(), failing])
            .await
            .unwrap_err();
        assert_eq!(err.phase, Phase::Plan);
        assert!(!finished.load(Ordering::SeqCst));

        assert!(slow.settled().await.is_ok());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let resolver = DependencyResolver::new();
        let handle = resolver.declare(&ArtifactId::from("P"), |_signal| async {
            if true {
                panic!("boom");
            }
            Ok(resolved("P", 1))
        });
        let err = handle.settled().await.unwrap_err();
        assert_eq!(err.artifact, Some(ArtifactId::from("P")));
    }
}
