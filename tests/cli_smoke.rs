use predicates::prelude::*;
use std::fs;

#[test]
fn check_seed_reports_demo_records() {
    let seed = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/seed.yaml");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("sidetree-peer");
    cmd.args(["check-seed", "--seed", seed]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "namespace did:sidetree at /sidetree/0.0.1",
        ))
        .stdout(predicate::str::contains(
            "namespace did:trustbloc at /trustbloc/0.0.1",
        ))
        .stdout(predicate::str::contains("batch writer timeout 500ms"))
        .stdout(predicate::str::contains("max 10 ops/batch"));
}

#[test]
fn check_seed_fails_on_invalid_records() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("seed.yaml");
    fs::write(
        &path,
        r#"
channels:
  - id: mychannel
    records:
      - mspId: Org1MSP
        peerId: peer1.example.com
        appName: sidetree
        appVersion: "1"
        format: json
        config: '{"Namespaces":[{"Namespace":"did:a","BasePath":"a"}]}'
"#,
    )
    .unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("sidetree-peer");
    cmd.arg("check-seed").arg("--seed").arg(&path);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("base path must start with '/'"));
}

#[test]
fn check_seed_requires_a_seed_path() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("sidetree-peer");
    cmd.env_remove("STP_SEED");
    cmd.arg("check-seed");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("requires --seed"));
}

#[test]
fn rejects_out_of_range_flags() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("sidetree-peer");
    cmd.args(["--event-queue-capacity", "0", "check-seed"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--event-queue-capacity"));
}
