//! Command-line behaviour of the `mirror-sync` binary.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn mirror_sync(data_dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("mirror-sync");
    cmd.arg("--data-dir").arg(data_dir).env("RUST_LOG", "warn");
    cmd
}

fn write_feed(dir: &Path, body: &str) {
    std::fs::write(dir.join("feed.json"), body).unwrap();
}

/// Data dir with a config mirroring `feed.json` as provider `github`.
fn setup(extra_config: &str) -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("config.toml"),
        format!(
            "[sources.github]\nkind = \"file\"\npath = \"feed.json\"\n{}",
            extra_config
        ),
    )
    .unwrap();
    temp
}

#[test]
fn help_lists_commands() {
    let temp = TempDir::new().unwrap();
    mirror_sync(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("login"))
        .stdout(predicate::str::contains("logout"));
}

#[test]
fn sync_without_sources_is_a_noop() {
    let temp = TempDir::new().unwrap();
    mirror_sync(temp.path())
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sources configured"));
}

#[test]
fn sync_mirrors_then_converges() {
    let temp = setup("");
    write_feed(
        temp.path(),
        r#"[{"url": "https://x/1", "title": "one"}, {"url": "https://x/2", "title": "two"}]"#,
    );

    mirror_sync(temp.path())
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains("github: +2 ~0 -0"));

    mirror_sync(temp.path())
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains("github: +0 ~0 -0"));

    write_feed(temp.path(), r#"[{"url": "https://x/2", "title": "deux"}]"#);
    mirror_sync(temp.path())
        .args(["sync", "--provider", "github"])
        .assert()
        .success()
        .stdout(predicate::str::contains("github: +0 ~1 -1"));
}

#[test]
fn failed_source_exits_nonzero() {
    let temp = setup("");

    mirror_sync(temp.path())
        .arg("sync")
        .assert()
        .failure()
        .stdout(predicate::str::contains("github: FAILED"))
        .stderr(predicate::str::contains("did not sync cleanly"));
}

#[test]
fn status_reports_mirrored_entries() {
    let temp = setup("[providers.github]\nconflict_strategy = \"newest-wins\"\n");
    write_feed(temp.path(), r#"[{"url": "https://x/1", "title": "one"}]"#);
    mirror_sync(temp.path()).arg("sync").assert().success();

    mirror_sync(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("github"))
        .stdout(predicate::str::contains("Entries:    1"))
        .stdout(predicate::str::contains("newest-wins"))
        .stdout(predicate::str::contains("Auth:       not required"));
}

#[test]
fn invalid_config_is_reported() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("config.toml"), "[engine]\nconflict_strategy = 7\n").unwrap();

    mirror_sync(temp.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid config"));
}

#[test]
fn login_requires_oauth_settings() {
    let temp = setup("");

    mirror_sync(temp.path())
        .args(["login", "github"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no OAuth settings"));
}

#[test]
fn login_cancelled_on_empty_redirect() {
    let temp = setup(
        r#"
[providers.github.oauth]
auth_url = "https://provider.test/authorize"
token_url = "https://provider.test/token"
client_id = "client"
redirect_uri = "https://app.test/cb"
scopes = ["repo"]
"#,
    );

    mirror_sync(temp.path())
        .args(["login", "github"])
        .write_stdin("\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("https://provider.test/authorize"))
        .stderr(predicate::str::contains("cancelled"));
    assert!(!temp.path().join("credentials.json").exists());
}

#[test]
fn logout_without_credentials_succeeds() {
    let temp = TempDir::new().unwrap();
    mirror_sync(temp.path())
        .args(["logout", "github"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Not signed in to github"));
}

#[test]
fn explicit_config_must_exist() {
    let temp = TempDir::new().unwrap();
    mirror_sync(temp.path())
        .args(["--config"])
        .arg(temp.path().join("absent.toml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
