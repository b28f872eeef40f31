use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
};

use tempfile::tempdir;

fn write_valid_config(path: &Path, host_name: &str) {
    let config = format!(
        r#"
[host]
name = "{host_name}"
allowed_origins = ["chrome-extension://abcdefghijklmnop/"]
"#
    );
    fs::write(path, config).expect("config should be written");
}

fn run_harreplay<I, S>(args: I, cwd: &Path, home: &Path) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_harreplay"))
        .args(args)
        .env("HOME", home)
        .current_dir(cwd)
        .output()
        .expect("harreplay command should execute")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn manifest_host_name(output: &Output) -> String {
    let manifest: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("manifest should be JSON");
    manifest["name"]
        .as_str()
        .expect("manifest should carry a host name")
        .to_owned()
}

#[test]
fn config_discovery_prefers_project_then_home_then_override() {
    let sandbox = tempdir().expect("tempdir should be created");
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&project_dir).expect("project dir should be created");
    fs::create_dir_all(home_dir.join(".harreplay")).expect("home config dir should be created");

    let project_config = project_dir.join("harreplay.toml");
    let home_config = home_dir.join(".harreplay").join("config.toml");
    let override_config = sandbox.path().join("override.toml");
    let manifest_args = ["manifest", "--path", "/opt/harreplay/harreplay"];

    write_valid_config(&project_config, "com.example.project");
    fs::write(
        &home_config,
        r#"
[host]
name = "com.example.home"
unknown_key = "invalid"
"#,
    )
    .expect("home config should be written");

    let prefers_project = run_harreplay(manifest_args, &project_dir, &home_dir);
    assert_success(&prefers_project);
    assert_eq!(manifest_host_name(&prefers_project), "com.example.project");

    fs::remove_file(&project_config).expect("project config should be removed");
    write_valid_config(&home_config, "com.example.home");

    let falls_back_to_home = run_harreplay(manifest_args, &project_dir, &home_dir);
    assert_success(&falls_back_to_home);
    assert_eq!(manifest_host_name(&falls_back_to_home), "com.example.home");

    fs::write(
        &project_config,
        r#"
[host]
name = "Not A Valid Host Name"
"#,
    )
    .expect("project config should be rewritten as invalid");
    fs::write(
        &home_config,
        r#"
[host]
command_timeout_ms = "soon"
"#,
    )
    .expect("home config should be rewritten as invalid");
    write_valid_config(&override_config, "com.example.override");

    let without_override = run_harreplay(manifest_args, &project_dir, &home_dir);
    assert!(
        !without_override.status.success(),
        "expected failure without override\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&without_override.stdout),
        String::from_utf8_lossy(&without_override.stderr)
    );
    assert!(
        String::from_utf8_lossy(&without_override.stderr).contains("project ./harreplay.toml"),
        "stderr should indicate the project source\nstderr:\n{}",
        String::from_utf8_lossy(&without_override.stderr)
    );

    let with_override = run_harreplay(
        [
            OsStr::new("manifest"),
            OsStr::new("--config"),
            override_config.as_os_str(),
            OsStr::new("--path"),
            OsStr::new("/opt/harreplay/harreplay"),
        ],
        &project_dir,
        &home_dir,
    );
    assert_success(&with_override);
    assert_eq!(manifest_host_name(&with_override), "com.example.override");
}

#[test]
fn built_in_defaults_apply_without_any_config_file() {
    let sandbox = tempdir().expect("tempdir should be created");
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&project_dir).expect("project dir should be created");
    fs::create_dir_all(&home_dir).expect("home dir should be created");

    let output = run_harreplay(
        ["manifest", "--path", "/opt/harreplay/harreplay"],
        &project_dir,
        &home_dir,
    );
    assert_success(&output);
    assert_eq!(manifest_host_name(&output), "com.harreplay.host");
}

#[test]
fn inspect_prints_endpoint_table_for_bundled_demo() {
    let sandbox = tempdir().expect("tempdir should be created");
    let demo = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("demos")
        .join("sample.har");

    let output = run_harreplay(
        [OsStr::new("inspect"), demo.as_os_str()],
        sandbox.path(),
        sandbox.path(),
    );
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("GET /api/todos (2 recorded)"), "stdout:\n{stdout}");
    assert!(stdout.contains("POST /api/todos (1 recorded)"), "stdout:\n{stdout}");
    assert!(stdout.contains("1 skipped"), "stdout:\n{stdout}");
}
