use assert_cmd::Command;
use predicates::prelude::*;

fn gauntlet() -> Command {
    Command::cargo_bin("gauntlet").unwrap()
}

#[test]
fn test_init_writes_starter_config_once() {
    let dir = tempfile::tempdir().unwrap();

    gauntlet()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created gauntlet.toml"));

    let written = std::fs::read_to_string(dir.path().join("gauntlet.toml")).unwrap();
    assert!(written.contains("[tunnel.selenium]"));

    gauntlet()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_validate_describes_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.toml");
    std::fs::write(
        &path,
        r#"
        [gauntlet]
        max_concurrency = 3
        grep = "checkout"

        [tunnel]
        port = 5555
        "#,
    )
    .unwrap();

    gauntlet()
        .arg("--config")
        .arg(&path)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Max concurrency: 3"))
        .stdout(predicate::str::contains("selenium at http://localhost:5555/wd/hub"));
}

#[test]
fn test_validate_rejects_bad_grep() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gauntlet.toml");
    std::fs::write(&path, "[gauntlet]\ngrep = \"[\"\n").unwrap();

    gauntlet()
        .arg("--config")
        .arg(&path)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid grep pattern"));
}

#[test]
fn test_missing_config_fails() {
    let dir = tempfile::tempdir().unwrap();

    gauntlet()
        .current_dir(dir.path())
        .arg("download")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_selenium_environments_follow_drivers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gauntlet.toml");
    std::fs::write(&path, "[tunnel.selenium]\ndrivers = [\"firefox\"]\n").unwrap();

    gauntlet()
        .arg("--config")
        .arg(&path)
        .arg("environments")
        .assert()
        .success()
        .stdout(predicate::eq("firefox\n"));
}
