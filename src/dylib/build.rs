//! Compile a generated unit into a loadable artifact.

use std::env;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};

use crate::codegen::GeneratedUnit;
use crate::error::BuildError;

use super::template;

/// Line-oriented build event sink: `(channel, line)`.
pub type EventCallback = Arc<dyn Fn(String, String) + Send + Sync>;

/// Knobs for one compilation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Where the template package lives; a shared temp dir when unset.
    pub work_dir: Option<PathBuf>,
    /// Template package name; also names the artifact.
    pub package: String,
    /// Build the release profile (default) or the debug profile.
    pub release: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            work_dir: None,
            package: "pharmtran_unit".to_string(),
            release: true,
        }
    }
}

/// Finds the cargo executable.
///
/// Bundled applications (macOS .app bundles, Windows installers, Linux
/// AppImages) don't inherit the user's shell PATH, so `cargo` may not
/// resolve directly. Checked in order: the `CARGO` environment variable,
/// PATH, `CARGO_HOME/bin`, the standard rustup location under the home
/// directory, then platform-specific install locations.
fn find_cargo() -> Result<String, BuildError> {
    if let Ok(cargo) = env::var("CARGO") {
        if PathBuf::from(&cargo).exists() {
            return Ok(cargo);
        }
    }

    if let Ok(output) = Command::new("cargo").arg("--version").output() {
        if output.status.success() {
            return Ok("cargo".to_string());
        }
    }

    if let Ok(cargo_home) = env::var("CARGO_HOME") {
        let cargo_path = PathBuf::from(&cargo_home)
            .join("bin")
            .join(cargo_exe_name());
        if cargo_path.exists() {
            return Ok(cargo_path.to_string_lossy().to_string());
        }
    }

    // Unix keeps the home in $HOME, Windows in %USERPROFILE%.
    let home = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .unwrap_or_default();
    if !home.is_empty() {
        let standard_path = PathBuf::from(&home)
            .join(".cargo")
            .join("bin")
            .join(cargo_exe_name());
        if standard_path.exists() {
            return Ok(standard_path.to_string_lossy().to_string());
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            "C:\\Program Files\\Rust stable MSVC\\bin\\cargo.exe",
            "C:\\Program Files\\Rust stable GNU\\bin\\cargo.exe",
        ];
        for candidate in &candidates {
            if PathBuf::from(candidate).exists() {
                return Ok(candidate.to_string());
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = ["/opt/homebrew/bin/cargo", "/usr/local/bin/cargo"];
        for candidate in &candidates {
            if PathBuf::from(candidate).exists() {
                return Ok(candidate.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = ["/usr/local/bin/cargo", "/usr/bin/cargo", "/snap/bin/cargo"];
        for candidate in &candidates {
            if PathBuf::from(candidate).exists() {
                return Ok(candidate.to_string());
            }
        }
    }

    Err(BuildError::CargoNotFound)
}

/// Returns the cargo executable name for the current platform.
#[inline]
fn cargo_exe_name() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "cargo.exe"
    }
    #[cfg(not(target_os = "windows"))]
    {
        "cargo"
    }
}

/// The artifact file name cargo produces for a cdylib package.
fn artifact_name(package: &str) -> String {
    let stem = package.replace('-', "_");
    if cfg!(target_os = "windows") {
        format!("{}.dll", stem)
    } else if cfg!(target_os = "macos") {
        format!("lib{}.dylib", stem)
    } else {
        format!("lib{}.so", stem)
    }
}

/// Compiles a generated unit into a dynamically loadable library.
///
/// Scaffolds the template package, injects the unit as `src/lib.rs`,
/// runs cargo over it with both output streams forwarded line by line to
/// `event_callback`, and copies the artifact to `output_path`.
///
/// # Returns
///
/// The path of the copied artifact, or the first error on the way there.
pub fn compile(
    unit: &GeneratedUnit,
    output_path: &Path,
    options: &BuildOptions,
    event_callback: EventCallback,
) -> Result<PathBuf> {
    let work_dir = options
        .work_dir
        .clone()
        .unwrap_or_else(|| env::temp_dir().join("pharmtran_build"));

    let package_dir = match template::create(&work_dir, &options.package) {
        Ok(path) => path,
        Err(e) => {
            event_callback(
                "build-log".into(),
                format!("Failed to create template: {}", e),
            );
            return Err(e);
        }
    };

    let lib_rs = package_dir.join("src").join("lib.rs");
    if let Err(e) = fs::write(&lib_rs, &unit.source) {
        event_callback("build-log".into(), format!("Failed to inject unit: {}", e));
        return Err(e).with_context(|| format!("Could not write {}", lib_rs.display()));
    }

    let artifact = match build_package(&package_dir, options, event_callback.clone()) {
        Ok(path) => path,
        Err(e) => {
            event_callback(
                "build-log".into(),
                format!("Failed to build template: {}", e),
            );
            return Err(e);
        }
    };

    event_callback(
        "build-complete".into(),
        "Compilation finished successfully".into(),
    );

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Could not create {}", parent.display()))?;
        }
    }
    fs::copy(&artifact, output_path).with_context(|| {
        format!(
            "Could not copy {} to {}",
            artifact.display(),
            output_path.display()
        )
    })?;
    Ok(output_path.to_path_buf())
}

/// Builds the template package and returns the produced artifact path.
fn build_package(
    package_dir: &Path,
    options: &BuildOptions,
    event_callback: EventCallback,
) -> Result<PathBuf> {
    let cargo_path = find_cargo()?;
    let mut command = Command::new(&cargo_path);
    command
        .arg("build")
        .arg("--quiet")
        .current_dir(package_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if options.release {
        command.arg("--release");
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Could not run {}", cargo_path))?;

    let stdout = match child.stdout.take() {
        Some(s) => s,
        None => bail!("Child process exposed no stdout"),
    };
    let stderr = match child.stderr.take() {
        Some(s) => s,
        None => bail!("Child process exposed no stderr"),
    };

    let stdout_handle = stream_output(stdout, event_callback.clone());
    let stderr_handle = stream_output(stderr, event_callback.clone());

    let status = child.wait().context("cargo did not run to completion")?;
    join_stream(stdout_handle)?;
    join_stream(stderr_handle)?;

    if !status.success() {
        return Err(BuildError::cargo_failed("build", status.to_string()).into());
    }

    let profile = if options.release { "release" } else { "debug" };
    let target_dir = package_dir.join("target").join(profile);
    let artifact = target_dir.join(artifact_name(&options.package));
    if !artifact.exists() {
        return Err(BuildError::missing_artifact(
            artifact_name(&options.package),
            target_dir.display().to_string(),
        )
        .into());
    }
    Ok(artifact)
}

/// Streams a child output handle to the event callback, one line per event.
fn stream_output<R: Read + Send + 'static>(
    reader: R,
    event_callback: EventCallback,
) -> thread::JoinHandle<Result<(), io::Error>> {
    thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            event_callback("build-log-internal".into(), line?);
        }
        Ok(())
    })
}

fn join_stream(handle: thread::JoinHandle<Result<(), io::Error>>) -> Result<()> {
    match handle.join() {
        Ok(result) => Ok(result?),
        Err(_) => bail!("Output stream thread panicked"),
    }
}
