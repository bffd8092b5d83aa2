use keystone::core::address::Address;
use keystone::core::artifact::{ArtifactId, Template};
use keystone::core::backend::{Backend, DeployPayload};
use keystone::core::config::{BootstrapConfig, NameRegConfig, load_config};
use keystone::core::error::KeystoneError;
use keystone::core::linker::{Linker, legacy_placeholder, placeholder};
use keystone::core::namereg::NameRegistry;
use keystone::core::plan::BootstrapPlan;
use keystone::core::registry::{DuplicatePolicy, HubClient};
use keystone::core::sim::{Fault, SimChain};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

fn addr(b: u8) -> Address {
    Address::from_bytes(&[b; 20]).expect("valid address")
}

async fn deployed_hub(sim: &Arc<SimChain>, policy: DuplicatePolicy) -> HubClient {
    let address = sim
        .deploy(DeployPayload {
            code: vec![0x60, 0x01],
            constructor: vec![],
        })
        .await
        .expect("hub should deploy");
    HubClient::new(sim.connection(), ArtifactId::from("Hub"), address, policy)
}

#[tokio::test]
async fn hub_register_then_lookup() {
    let sim = Arc::new(SimChain::new());
    let hub = deployed_hub(&sim, DuplicatePolicy::Reject).await;

    assert!(hub.try_lookup("M").await.expect("lookup works").is_none());
    assert!(matches!(
        hub.lookup("M").await,
        Err(KeystoneError::NotFound(_))
    ));

    hub.register("M", addr(7)).await.expect("register works");
    assert_eq!(hub.lookup("M").await.expect("lookup works"), addr(7));
}

#[tokio::test]
async fn duplicate_registration_is_rejected_by_default() {
    let sim = Arc::new(SimChain::new());
    let hub = deployed_hub(&sim, DuplicatePolicy::Reject).await;

    hub.register("M", addr(1)).await.expect("first register works");
    // Same address again is a no-op.
    hub.register("M", addr(1)).await.expect("re-register is idempotent");

    let err = hub.register("M", addr(2)).await.unwrap_err();
    match err {
        KeystoneError::DuplicateRegistration {
            name,
            existing,
            requested,
        } => {
            assert_eq!(name, "M");
            assert_eq!(existing, addr(1).to_string());
            assert_eq!(requested, addr(2).to_string());
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(hub.lookup("M").await.expect("lookup works"), addr(1));
}

#[tokio::test]
async fn overwrite_policy_replaces_entries() {
    let sim = Arc::new(SimChain::new());
    let hub = deployed_hub(&sim, DuplicatePolicy::Overwrite).await;

    hub.register("M", addr(1)).await.expect("register works");
    hub.register("M", addr(2)).await.expect("overwrite works");
    assert_eq!(hub.lookup("M").await.expect("lookup works"), addr(2));
}

#[tokio::test]
async fn hub_names_are_limited_to_one_word() {
    let sim = Arc::new(SimChain::new());
    let hub = deployed_hub(&sim, DuplicatePolicy::Reject).await;
    assert!(hub.register("", addr(1)).await.is_err());
    assert!(hub.register(&"n".repeat(33), addr(1)).await.is_err());
    hub.register(&"n".repeat(32), addr(1))
        .await
        .expect("32 bytes fits");
}

#[tokio::test]
async fn name_registry_publish_and_resolve() {
    let sim = Arc::new(SimChain::new());
    let names = NameRegistry::new(sim.clone(), &NameRegConfig::default());

    assert_eq!(names.resolve("hub").await.expect("resolve works"), None);
    names.publish("hub", "ABCD").await.expect("publish works");
    assert_eq!(
        names.resolve("hub").await.expect("resolve works"),
        Some("ABCD".to_string())
    );

    let failing = Arc::new(SimChain::new().with_fault(Fault::RejectPublish));
    let err = NameRegistry::new(failing, &NameRegConfig::default())
        .publish("hub", "ABCD")
        .await
        .unwrap_err();
    assert!(matches!(err, KeystoneError::Publish { .. }));
}

#[test]
fn linking_is_order_independent_and_repeatable() {
    let a = ArtifactId::from("A");
    let b = ArtifactId::from("B");
    let template = Template::new(format!(
        "60{}{}{}00",
        placeholder(&a),
        legacy_placeholder(&b),
        placeholder(&a)
    ));

    let mut forward = BTreeMap::new();
    forward.insert(a.clone(), addr(0xaa));
    forward.insert(b.clone(), addr(0xbb));
    let mut backward = BTreeMap::new();
    backward.insert(b, addr(0xbb));
    backward.insert(a, addr(0xaa));

    let linker = Linker::new();
    let first = linker.link(&template, &forward).expect("link works");
    assert_eq!(first, linker.link(&template, &backward).expect("link works"));
    assert_eq!(first, linker.link(&template, &forward).expect("link works"));
    assert_eq!(first.len(), 1 + 3 * Address::LEN + 1);
}

#[test]
fn plan_loads_template_files_relative_to_the_plan() {
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("bin")).expect("mkdir");
    fs::write(dir.path().join("bin/Hub.bin"), "0x6001\n").expect("write");
    let plan_path = dir.path().join("network.toml");
    fs::write(
        &plan_path,
        r#"
        [hub]
        id = "Hub"
        kind = "module"
        template_file = "bin/Hub.bin"

        [[artifact]]
        id = "L"
        kind = "library"
        template = "6002"
        "#,
    )
    .expect("write");

    let plan = BootstrapPlan::load(&plan_path).expect("plan loads");
    assert_eq!(plan.hub.template.as_str(), "6001");
    assert!(plan.hub.template_file.is_none());
    assert!(plan.get("L").is_some());
    assert!(plan.get("Nope").is_none());
}

#[test]
fn plan_with_missing_template_file_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let plan_path = dir.path().join("network.toml");
    fs::write(
        &plan_path,
        "[hub]\nid = \"Hub\"\nkind = \"module\"\ntemplate_file = \"missing.bin\"\n",
    )
    .expect("write");
    let err = BootstrapPlan::load(&plan_path).unwrap_err();
    assert!(err.to_string().contains("missing.bin"));
}

#[test]
fn config_file_overrides_defaults() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("keystone.toml");
    fs::write(
        &path,
        "[namereg]\nttl = 10\n\n[journal]\npath = \"runs.db\"\n",
    )
    .expect("write");

    let config = load_config(Some(&path)).expect("config loads");
    assert_eq!(config.namereg.ttl, 10);
    assert_eq!(config.namereg.fee, 2000);
    assert_eq!(config.journal.path, std::path::PathBuf::from("runs.db"));
    assert_eq!(config.hub, BootstrapConfig::default().hub);
}
