use assert_cmd::Command;
use std::io::Write;

fn relay() -> Command {
    Command::cargo_bin("relay-server").unwrap()
}

#[test]
fn help_lists_flags() {
    let output = relay().arg("--help").output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for flag in ["--bind", "--config", "--idle-timeout", "--log-level", "--verbose"] {
        assert!(text.contains(flag), "missing {flag} in help");
    }
}

#[test]
fn malformed_config_exits_with_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[server\nbind = ").unwrap();

    relay()
        .arg("--config")
        .arg(file.path())
        .assert()
        .failure()
        .code(1);
}

#[test]
fn invalid_bind_exits_with_error() {
    let dir = tempfile::tempdir().unwrap();
    relay()
        .args(["--config"])
        .arg(dir.path().join("missing.toml"))
        .args(["--bind", "not-an-address"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn zero_idle_timeout_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    relay()
        .arg("-c")
        .arg(dir.path().join("missing.toml"))
        .args(["--idle-timeout", "0"])
        .assert()
        .failure()
        .code(1);
}
