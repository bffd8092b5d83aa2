use keystone::core::artifact::ArtifactId;
use keystone::core::linker::placeholder;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn keystone(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_keystone"))
        .current_dir(dir)
        .env("RUST_LOG", "off")
        .args(args)
        .output()
        .expect("failed to execute keystone")
}

fn keystone_ok(dir: &Path, args: &[&str]) -> String {
    let output = keystone(dir, args);
    assert!(
        output.status.success(),
        "keystone {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn write_plan(dir: &Path) {
    fs::write(
        dir.join("network.toml"),
        format!(
            r#"
            [hub]
            id = "Hub"
            kind = "module"
            template = "6001"
            register = "Hub"

            [[artifact]]
            id = "L"
            kind = "library"
            template = "6002"

            [[artifact]]
            id = "M"
            kind = "module"
            template = "6003{}"
            links = ["L"]
            args = [{{ name = "_hub", ref = "Hub" }}]
            register = "M"
            verify = [{{ method = "getHub", expect = {{ ref = "Hub" }} }}]
            "#,
            placeholder(&ArtifactId::from("L"))
        ),
    )
    .expect("write plan");
}

#[test]
fn validate_prints_waves() {
    let dir = tempdir().expect("tempdir");
    write_plan(dir.path());

    let text = keystone_ok(dir.path(), &["validate", "network.toml"]);
    assert!(text.contains("3 artifacts in 3 waves"), "{}", text);
    assert!(text.contains("Hub"));

    let json = keystone_ok(dir.path(), &["validate", "network.toml", "--format", "json"]);
    let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    assert_eq!(value["cmd"], "validate");
    assert_eq!(value["status"], "ok");
    assert_eq!(value["waves"][0][0], "Hub");
    assert_eq!(value["waves"][2][0], "M");
}

#[test]
fn validate_rejects_unknown_references() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("bad.toml"),
        r#"
        [hub]
        id = "Hub"
        kind = "module"
        template = "6001"

        [[artifact]]
        id = "M"
        kind = "module"
        template = "6003"
        links = ["Ghost"]
        "#,
    )
    .expect("write plan");

    let output = keystone(dir.path(), &["validate", "bad.toml"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown artifact Ghost"), "{}", stderr);
}

#[test]
fn simulate_records_a_journal() {
    let dir = tempdir().expect("tempdir");
    write_plan(dir.path());

    let json = keystone_ok(
        dir.path(),
        &["simulate", "network.toml", "--journal", "j/runs.db", "--format", "json"],
    );
    let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    assert_eq!(value["status"], "ok");
    assert_eq!(value["published_as"], "hub");
    assert!(value["entries"]["M"].is_string());
    let run_id = value["run_id"].as_str().expect("run id").to_string();

    let runs = keystone_ok(
        dir.path(),
        &["journal", "--path", "j/runs.db", "--format", "json", "runs"],
    );
    let runs: serde_json::Value = serde_json::from_str(&runs).expect("valid json");
    assert_eq!(runs["runs"][0]["run_id"], run_id.as_str());
    assert_eq!(runs["runs"][0]["status"], "succeeded");

    let landed = keystone_ok(dir.path(), &["journal", "--path", "j/runs.db", "landed"]);
    assert!(landed.contains(&run_id));
    assert!(landed.contains("last step: settled"));
}

#[test]
fn simulate_uses_the_config_journal_path() {
    let dir = tempdir().expect("tempdir");
    write_plan(dir.path());
    fs::write(
        dir.path().join("keystone.toml"),
        "[journal]\npath = \"state/journal.db\"\n",
    )
    .expect("write config");

    keystone_ok(dir.path(), &["simulate", "network.toml"]);
    assert!(dir.path().join("state/journal.db").exists());

    keystone_ok(dir.path(), &["simulate", "network.toml", "--no-journal"]);
    let runs = keystone_ok(dir.path(), &["journal", "runs"]);
    assert_eq!(runs.lines().count(), 1, "{}", runs);
}

#[test]
fn placeholder_and_link_agree() {
    let dir = tempdir().expect("tempdir");
    let out = keystone_ok(dir.path(), &["placeholder", "ErrorsLib"]);
    let (id, text) = out.trim().split_once('\t').expect("tab separated");
    assert_eq!(id, "ErrorsLib");
    assert_eq!(text.len(), 40);

    fs::write(dir.path().join("lib.hex"), format!("60{}00", text)).expect("write template");
    let address = "11".repeat(20);
    let linked = keystone_ok(
        dir.path(),
        &["link", "lib.hex", "-a", &format!("ErrorsLib={}", address)],
    );
    assert_eq!(linked.trim(), format!("60{}00", address));

    let output = keystone(dir.path(), &["link", "lib.hex"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unresolved link placeholder"));
}

#[test]
fn journal_without_database_is_an_error() {
    let dir = tempdir().expect("tempdir");
    let output = keystone(dir.path(), &["journal", "runs"]);
    assert!(!output.status.success());
}
