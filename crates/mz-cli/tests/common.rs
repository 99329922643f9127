#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::assert::Assert;
use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

pub const CONFIG: &str = "[materializer]
materializations = \"deferred\"
sqlite_materializer_state = true
sqlite_materializer_state_version = 0
";

const MZ_ENV: &[&str] = &[
    "MZ_ROOT",
    "MZ_LOG",
    "MZ_MATERIALIZATIONS",
    "MZ_SQLITE_MATERIALIZER_STATE",
    "MZ_SQLITE_MATERIALIZER_STATE_VERSION",
    "MZ_HASH_ALL_COMMANDS",
    "MZ_DEPS_POLICY",
];

/// A build root holding `src`, `hidden`, a `.mzconfig` and a request file
/// that copies `src` to `out/copy` with both files as deps.
pub fn prepare_fixture(prefix: &str) -> (TempDir, PathBuf) {
    let temp = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("tempdir");
    let root = temp.path().join("repo");
    fs::create_dir_all(&root).expect("create root");
    fs::write(root.join(".mzconfig"), CONFIG).expect("write config");
    fs::write(root.join("src"), "SRC").expect("write src");
    fs::write(root.join("hidden"), "HIDDEN").expect("write hidden");
    fs::write(
        root.join("requests.json"),
        r#"[{"path": "out/copy", "source": "src", "deps": ["src", "hidden"]}]"#,
    )
    .expect("write requests");
    (temp, root)
}

/// `mz` rooted at `root` with materializer traces on stderr.
pub fn mz(root: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("mz");
    for key in MZ_ENV {
        cmd.env_remove(key);
    }
    cmd.current_dir(root)
        .env("MZ_LOG", "mz_core=trace")
        .arg("--root")
        .arg(root);
    cmd
}

pub fn build(root: &Path) -> Assert {
    mz(root).args(["materialize", "requests.json"]).assert().success()
}

pub fn stderr(assert: &Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).into_owned()
}

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}

pub fn replace_in_file(path: &Path, old: &str, new: &str) {
    let contents = fs::read_to_string(path).expect("read file");
    assert!(contents.contains(old), "{old:?} not found in {}", path.display());
    fs::write(path, contents.replace(old, new)).expect("write file");
}

pub fn disable_sqlite_materializer_state(root: &Path) {
    replace_in_file(
        &root.join(".mzconfig"),
        "sqlite_materializer_state = true",
        "sqlite_materializer_state = false",
    );
}

pub fn set_materializer(root: &Path, old: &str, new: &str) {
    replace_in_file(
        &root.join(".mzconfig"),
        &format!("materializations = \"{old}\""),
        &format!("materializations = \"{new}\""),
    );
}

pub fn cache_listing(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(root.join("mz-out").join("cache"))
        .expect("read cache dir")
        .map(|entry| {
            entry
                .expect("cache entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}
