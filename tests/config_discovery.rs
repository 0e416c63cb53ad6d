use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use tempfile::{TempDir, tempdir};

const CAPTURE_LOG: &str = r#"{"method":"Network.responseReceived","params":{"requestId":"1","timestamp":1.0,"response":{"status":200,"mimeType":"text/html"}}}
{"method":"Network.loadingFinished","params":{"requestId":"1","timestamp":1.1,"encodedDataLength":4}}
{"method":"Network.getResponseBody","params":{"requestId":"1","body":"<p/>","base64Encoded":false}}
"#;

/// A working directory and a `$HOME` for one run of the binary.
struct Sandbox {
    root: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let root = tempdir().expect("tempdir should be created");
        fs::create_dir_all(root.path().join("project")).expect("project dir should be created");
        fs::create_dir_all(root.path().join("home")).expect("home dir should be created");
        fs::write(root.path().join("capture.jsonl"), CAPTURE_LOG)
            .expect("capture log should be written");
        Self { root }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    fn project_config(&self) -> PathBuf {
        self.path("project/netcapture.toml")
    }

    fn home_config(&self) -> PathBuf {
        self.path("home/.netcapture/config.toml")
    }

    fn write_config(&self, path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("config dir should be created");
        }
        fs::write(path, contents).expect("config should be written");
    }

    fn config_for_database(&self, path: &Path, database: &str) {
        let contents = format!("[storage]\npath = \"{}\"\n", self.path(database).display());
        self.write_config(path, &contents);
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_netcapture"))
            .args(args)
            .env("HOME", self.path("home"))
            .current_dir(self.path("project"))
            .output()
            .expect("netcapture command should execute")
    }

    fn ingest(&self, extra_args: &[&str]) -> Output {
        let log = self.path("capture.jsonl");
        let mut args = extra_args.to_vec();
        args.extend(["ingest", "--session", "tab-1", log.to_str().expect("utf-8 path")]);
        self.run(&args)
    }
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "expected success\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn failure_stderr(output: &Output) -> String {
    assert!(
        !output.status.success(),
        "expected failure\nstdout:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn each_config_source_opens_its_own_database() {
    let sandbox = Sandbox::new();
    sandbox.config_for_database(&sandbox.project_config(), "project.db");
    sandbox.config_for_database(&sandbox.home_config(), "home.db");

    let ingested = stdout(&sandbox.ingest(&[]));
    assert!(
        ingested.contains("captured session `tab-1`: events=2, records_written=3"),
        "stdout:\n{ingested}"
    );
    assert_eq!(stdout(&sandbox.run(&["sessions"])), "tab-1\t1\n");
    assert!(!sandbox.path("home.db").exists());

    fs::remove_file(sandbox.project_config()).expect("project config should be removed");
    assert_eq!(stdout(&sandbox.run(&["sessions"])), "");
    assert!(sandbox.path("home.db").is_file());

    let override_config = sandbox.path("override.toml");
    sandbox.config_for_database(&override_config, "override.db");
    let override_arg = override_config.to_str().expect("utf-8 path");
    stdout(&sandbox.ingest(&["--config", override_arg]));
    assert_eq!(
        stdout(&sandbox.run(&["--config", override_arg, "sessions"])),
        "tab-1\t1\n"
    );
    assert_eq!(stdout(&sandbox.run(&["sessions"])), "");
}

#[test]
fn without_any_config_the_database_lives_under_home() {
    let sandbox = Sandbox::new();

    stdout(&sandbox.ingest(&[]));

    assert!(sandbox.path("home/.netcapture/capture.db").is_file());
    assert_eq!(stdout(&sandbox.run(&["sessions"])), "tab-1\t1\n");
}

#[test]
fn config_errors_name_the_file_they_came_from() {
    let sandbox = Sandbox::new();
    sandbox.write_config(&sandbox.home_config(), "[storage]\nunknown_key = 1\n");
    let stderr = failure_stderr(&sandbox.run(&["sessions"]));
    assert!(stderr.contains("load config from home"), "stderr:\n{stderr}");
    assert!(stderr.contains("unknown field"), "stderr:\n{stderr}");

    sandbox.write_config(&sandbox.project_config(), "[export]\ncompression_level = 12\n");
    let stderr = failure_stderr(&sandbox.run(&["sessions"]));
    assert!(
        stderr.contains("load config from project ./netcapture.toml"),
        "stderr:\n{stderr}"
    );
    assert!(
        stderr.contains("`export.compression_level` must be between 0 and 9"),
        "stderr:\n{stderr}"
    );

    let missing = sandbox.path("missing.toml");
    let stderr = failure_stderr(&sandbox.run(&[
        "--config",
        missing.to_str().expect("utf-8 path"),
        "sessions",
    ]));
    assert!(stderr.contains("load config from --config"), "stderr:\n{stderr}");
    assert!(stderr.contains("missing.toml"), "stderr:\n{stderr}");
    assert!(!sandbox.path("home/.netcapture/capture.db").exists());
}

#[test]
fn debug_logs_name_the_opened_database() {
    let sandbox = Sandbox::new();
    sandbox.config_for_database(&sandbox.project_config(), "project.db");

    let output = sandbox.run(&["--log-level", "debug", "sessions"]);
    stdout(&output);

    let stderr = String::from_utf8_lossy(&output.stderr);
    let opened = stderr
        .lines()
        .find(|line| line.contains("opened capture database"))
        .unwrap_or_else(|| panic!("no database line in stderr:\n{stderr}"));
    assert!(
        opened.contains(&sandbox.path("project.db").display().to_string()),
        "line: {opened}"
    );
}

#[test]
fn invalid_log_level_fails_before_opening_the_database() {
    let sandbox = Sandbox::new();

    let stderr = failure_stderr(&sandbox.run(&["--log-level", "verbose", "sessions"]));

    assert!(
        stderr.contains("invalid log level `verbose`"),
        "stderr:\n{stderr}"
    );
    assert!(!sandbox.path("home/.netcapture").exists());
}
