//! Every workspace crate inherits the workspace version, and the internal
//! path dependencies pin that same version.

use std::path::{Path, PathBuf};

const CRATES: [&str; 3] = ["recvault-state", "recvault-core", "recvault-cli"];

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .expect("workspace root")
        .to_path_buf()
}

fn read_toml(path: &Path) -> toml::Value {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
    raw.parse()
        .unwrap_or_else(|e| panic!("parse {}: {e}", path.display()))
}

fn workspace_manifest() -> toml::Value {
    read_toml(&workspace_root().join("Cargo.toml"))
}

#[test]
fn crates_inherit_workspace_version() {
    for krate in CRATES {
        let manifest = read_toml(&workspace_root().join("crates").join(krate).join("Cargo.toml"));
        let inherits = manifest["package"]["version"]
            .get("workspace")
            .and_then(|v| v.as_bool())
            == Some(true);
        assert!(inherits, "{krate} should use version.workspace = true");
    }
}

#[test]
fn internal_dependencies_pin_workspace_version() {
    let ws = workspace_manifest();
    let version = ws["workspace"]["package"]["version"]
        .as_str()
        .expect("workspace version");
    for krate in ["recvault-state", "recvault-core"] {
        let pinned = ws["workspace"]["dependencies"][krate]["version"]
            .as_str()
            .unwrap_or_else(|| panic!("{krate} has no pinned version"));
        assert_eq!(pinned, version, "{krate} pins {pinned}, workspace is {version}");
    }
}

#[test]
fn workspace_version_matches_cargo_pkg() {
    let ws = workspace_manifest();
    assert_eq!(
        ws["workspace"]["package"]["version"].as_str(),
        Some(env!("CARGO_PKG_VERSION"))
    );
    assert_eq!(recvault_core::VERSION, env!("CARGO_PKG_VERSION"));
}
