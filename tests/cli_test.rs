//! CLI tests for the `atlas` binary against a throwaway registry.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// Builds an `atlas` Command rooted at `work_dir`, acting as the default admin.
fn atlas(work_dir: &Path) -> Command {
    let mut cmd = assert_cmd::cargo_bin_cmd!("atlas");
    cmd.arg("-w").arg(work_dir).env("NO_COLOR", "1");
    cmd
}

/// Registry with one environment and one single-signature CSV blueprint.
fn seeded() -> TempDir {
    let dir = TempDir::new().unwrap();
    atlas(dir.path()).arg("init").assert().success();
    atlas(dir.path())
        .args(["env", "create", "dev", "Development"])
        .assert()
        .success();
    atlas(dir.path())
        .args([
            "blueprint",
            "create",
            "claims",
            "Claims extract",
            "--stage",
            "data_inputs",
            "--ext",
            ".csv",
            "--workflow",
            "doer_only",
            "--doers",
            "admin,developer",
        ])
        .assert()
        .success();
    dir
}

#[test]
fn test_init_creates_registry() {
    let dir = TempDir::new().unwrap();
    atlas(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Registry ready"));
    assert!(dir.path().join(".atlas/registry.db").is_file());
    assert!(dir.path().join(".atlas/environments").is_dir());
}

#[test]
fn test_env_create_and_list() {
    let dir = seeded();
    atlas(dir.path())
        .args(["env", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dev"))
        .stdout(predicate::str::contains("Development"))
        .stdout(predicate::str::contains("1 environment(s) total."));
    assert!(dir.path().join(".atlas/environments/dev/models").is_dir());

    // Only admins create environments
    atlas(dir.path())
        .args(["-u", "dana", "-r", "developer", "env", "create", "qa", "QA"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("permission denied"));
}

#[test]
fn test_upload_and_sign_off() {
    let dir = seeded();
    let csv = dir.path().join("claims.csv");
    std::fs::write(&csv, "id,amount\n1,10\n").unwrap();

    atlas(dir.path())
        .args(["-u", "dana", "-r", "developer", "file", "add", "dev", "claims"])
        .arg(&csv)
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered data_inputs:1"));

    atlas(dir.path())
        .args(["file", "list", "dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending Doer"));

    // Missing comment is rejected by clap
    atlas(dir.path())
        .args(["signoff", "data_inputs:1"])
        .assert()
        .failure();

    atlas(dir.path())
        .args(["-u", "dana", "-r", "developer", "signoff", "data_inputs:1"])
        .args(["-m", "checked totals"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "SIGN_OFF recorded on data_inputs:1 as Doer (now Approved)",
        ));

    atlas(dir.path())
        .args(["audit", "target", "data_inputs:1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("checked totals"));

    // Identical content is refused
    atlas(dir.path())
        .args(["file", "add", "dev", "claims"])
        .arg(&csv)
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate"));
}

#[test]
fn test_plan_schedule() {
    let dir = seeded();
    let add = |title: &str, extra: &[&str]| {
        atlas(dir.path())
            .args(["plan", "add", "dev", title, "-o", "pm"])
            .args(extra)
            .assert()
            .success();
    };
    add("Build model", &["-d", "10"]);
    add("Collect data", &["-d", "5"]);
    add(
        "Report",
        &["--due", "2025-12-20", "--after", "1", "--after", "2"],
    );

    atlas(dir.path())
        .args(["plan", "schedule", "dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2025-12-10 → 2025-12-19"))
        .stdout(predicate::str::contains("2025-12-10 → 2025-12-20 (11 days)"))
        .stdout(predicate::str::contains("#1 → #3"));

    atlas(dir.path())
        .args(["plan", "depend", "1", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_unknown_environment_fails() {
    let dir = seeded();
    atlas(dir.path())
        .args(["env", "show", "nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_health_reports_missing_file() {
    let dir = seeded();
    let csv = dir.path().join("claims.csv");
    std::fs::write(&csv, "id,amount\n1,10\n").unwrap();
    atlas(dir.path())
        .args(["file", "add", "dev", "claims"])
        .arg(&csv)
        .assert()
        .success();
    atlas(dir.path()).arg("health").assert().success();

    let folder = dir.path().join(".atlas/environments/dev/data_inputs");
    for entry in std::fs::read_dir(&folder).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }
    atlas(dir.path())
        .arg("health")
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 missing file(s)"));
}

#[test]
fn test_health_shows_integrity_violation() {
    let dir = seeded();
    let csv = dir.path().join("claims.csv");
    std::fs::write(&csv, "id,amount\n1,10\n").unwrap();
    atlas(dir.path())
        .args(["file", "add", "dev", "claims"])
        .arg(&csv)
        .assert()
        .success();

    let folder = dir.path().join(".atlas/environments/dev/data_inputs");
    for entry in std::fs::read_dir(&folder).unwrap() {
        std::fs::write(entry.unwrap().path(), "id,amount\n1,99\n").unwrap();
    }
    atlas(dir.path())
        .arg("health")
        .assert()
        .failure()
        .stdout(predicate::str::contains("integrity violation: data_inputs:1 in 'dev'"))
        .stderr(predicate::str::contains("1 hash mismatch(es)"));
}

#[test]
fn test_env_edit_restricts_roles() {
    let dir = seeded();
    atlas(dir.path())
        .args(["env", "edit", "dev", "--name", "Dev (risk)", "--roles", "admin,risk"])
        .args(["-m", "risk review"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Environment 'dev' updated: Dev (risk) (Active), roles admin,risk",
        ));

    atlas(dir.path())
        .args(["-u", "dana", "-r", "developer", "env", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No environments."));

    atlas(dir.path())
        .args(["-u", "dana", "-r", "developer", "env", "edit", "dev", "--roles", "all"])
        .args(["-m", "let me in"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("permission denied"));

    atlas(dir.path())
        .args(["audit", "target", "environments:dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("risk review"));
}
