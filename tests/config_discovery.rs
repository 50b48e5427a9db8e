use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
};

use tempfile::tempdir;

fn write_valid_config(path: &Path, store_dir: &Path, name: &str) {
    let config = format!(
        r#"
[store]
dir = "{}"
name = "{name}"
"#,
        store_dir.display()
    );
    fs::write(path, config).expect("config should be written");
}

fn run_certstore<I, S>(args: I, cwd: &Path, home: &Path) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_certstore"))
        .args(args)
        .env("HOME", home)
        .current_dir(cwd)
        .output()
        .expect("certstore command should execute")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn config_discovery_prefers_project_then_home_then_override() {
    let sandbox = tempdir().expect("tempdir should be created");
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    let store_dir = sandbox.path().join("stores");
    fs::create_dir_all(&project_dir).expect("project dir should be created");
    fs::create_dir_all(home_dir.join(".certstore")).expect("home config dir should be created");

    let project_config = project_dir.join("certstore.toml");
    let home_config = home_dir.join(".certstore").join("config.toml");
    let override_config = sandbox.path().join("override.toml");

    write_valid_config(&project_config, &store_dir.join("project"), "projectca");
    fs::write(
        &home_config,
        r#"
[store]
unknown_key = "invalid"
"#,
    )
    .expect("home config should be written");

    let prefers_project = run_certstore(["root", "generate"], &project_dir, &home_dir);
    assert_success(&prefers_project);
    assert!(store_dir.join("project/projectca.crt").is_file());

    fs::remove_file(&project_config).expect("project config should be removed");
    write_valid_config(&home_config, &store_dir.join("home"), "homeca");

    let falls_back_to_home = run_certstore(["root", "generate"], &project_dir, &home_dir);
    assert_success(&falls_back_to_home);
    assert!(store_dir.join("home/homeca.crt").is_file());

    fs::write(
        &project_config,
        r#"
[store]
dir = 42
"#,
    )
    .expect("project config should be rewritten as invalid");
    write_valid_config(&override_config, &store_dir.join("override"), "overrideca");

    let without_override = run_certstore(["root", "status"], &project_dir, &home_dir);
    assert!(
        !without_override.status.success(),
        "expected failure without override\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&without_override.stdout),
        String::from_utf8_lossy(&without_override.stderr)
    );
    assert!(
        String::from_utf8_lossy(&without_override.stderr).contains("project ./certstore.toml"),
        "stderr should indicate the project source\nstderr:\n{}",
        String::from_utf8_lossy(&without_override.stderr)
    );

    let with_override = run_certstore(
        [
            OsStr::new("root"),
            OsStr::new("generate"),
            OsStr::new("--config"),
            override_config.as_os_str(),
        ],
        &project_dir,
        &home_dir,
    );
    assert_success(&with_override);
    assert!(store_dir.join("override/overrideca.crt").is_file());
}

#[test]
fn defaults_to_cert_dir_under_home() {
    let sandbox = tempdir().expect("tempdir should be created");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&home_dir).expect("home dir should be created");

    let generated = run_certstore(["root", "generate"], sandbox.path(), &home_dir);
    assert_success(&generated);
    assert!(home_dir.join(".cert/root.crt").is_file());
    assert!(home_dir.join(".cert/root.key").is_file());

    let issued = run_certstore(["issue", "example.com"], sandbox.path(), &home_dir);
    assert_success(&issued);
    assert!(home_dir.join(".cert/example.com.crt").is_file());
    assert!(
        String::from_utf8_lossy(&issued.stdout).contains("certificate for `example.com`"),
        "stdout:\n{}",
        String::from_utf8_lossy(&issued.stdout)
    );

    let cleared = run_certstore(["clear"], sandbox.path(), &home_dir);
    assert_success(&cleared);
    assert!(!home_dir.join(".cert").exists());
}

#[test]
fn issue_without_root_reports_missing_ca() {
    let sandbox = tempdir().expect("tempdir should be created");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&home_dir).expect("home dir should be created");

    let output = run_certstore(["issue", "example.com"], sandbox.path(), &home_dir);
    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("root CA not found"),
        "stderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
}
