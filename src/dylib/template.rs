//! Template package for unit compilation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Manifest dependency line for the host crate.
///
/// `PHARMTRAN_LOCAL` switches the template to a path dependency on this
/// checkout, which is what local development and CI need; otherwise the
/// published version matching the running host is used.
fn host_dependency() -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    if env::var("PHARMTRAN_LOCAL").is_ok() {
        let manifest_path =
            fs::canonicalize(manifest_dir).unwrap_or_else(|_| PathBuf::from(manifest_dir));
        let manifest_str = manifest_path.to_string_lossy();

        if manifest_str.contains('\'') {
            let escaped = manifest_str.replace('\\', "\\\\").replace('"', "\\\"");
            format!(r#"pharmtran = {{ path = "{}", features = ["dylib"] }}"#, escaped)
        } else {
            format!(
                r#"pharmtran = {{ path = '{}', features = ["dylib"] }}"#,
                manifest_str
            )
        }
    } else {
        format!(
            r#"pharmtran = {{ version = "{}", features = ["dylib"] }}"#,
            env!("CARGO_PKG_VERSION")
        )
    }
}

/// Scaffold the cdylib package `name` under `dir` and return its root.
///
/// `name` must be a plain crate identifier; it also names the produced
/// artifact. An existing package is reused, so repeated builds only pay
/// for the incremental cargo run. The caller injects the unit source as
/// `src/lib.rs` afterwards.
pub fn create(dir: &Path, name: &str) -> Result<PathBuf> {
    let package_dir = dir.join(name);
    let src_dir = package_dir.join("src");
    fs::create_dir_all(&src_dir)
        .with_context(|| format!("Could not create {}", src_dir.display()))?;

    let manifest = format!(
        r#"[package]
name = "{name}"
version = "0.1.0"
edition = "2021"

[lib]
crate-type = ["cdylib"]

[dependencies]
{dep}
"#,
        name = name,
        dep = host_dependency()
    );
    let manifest_path = package_dir.join("Cargo.toml");
    fs::write(&manifest_path, manifest)
        .with_context(|| format!("Could not write {}", manifest_path.display()))?;

    let lib_rs = src_dir.join("lib.rs");
    if !lib_rs.exists() {
        fs::write(&lib_rs, "")
            .with_context(|| format!("Could not write {}", lib_rs.display()))?;
    }
    Ok(package_dir)
}
