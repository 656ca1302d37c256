//! npm package management for the playground's private package root.
//!
//! Packages are installed with the system `npm` into `<root>/node_modules`,
//! which is where `require` resolves from. Every install or uninstall
//! invalidates the module cache entries of the affected package.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use jsplay_error::BridgeError;
use jsplay_sandbox::ModuleCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

/// Longest package name npm accepts.
const MAX_NAME_LEN: usize = 214;

/// Longest tool stderr kept in an error.
const MAX_STDERR_LEN: usize = 2_000;

/// Phase of an install or uninstall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    /// `npm install` started.
    Installing,
    /// `npm install` succeeded.
    Installed,
    /// `npm uninstall` started.
    Uninstalling,
    /// `npm uninstall` succeeded.
    Uninstalled,
    /// Either operation failed.
    Error,
}

/// A progress report, delivered as a `package-install-status` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatus {
    /// Phase.
    pub status: InstallStatus,
    /// Package name.
    pub name: String,
    /// Human-readable detail.
    pub message: String,
}

/// Receives install progress.
pub trait PackageStatusSink: Send + Sync {
    /// Deliver one report.
    fn report(&self, status: PackageStatus);
}

/// A sink that drops every report.
pub struct NullStatusSink;

impl PackageStatusSink for NullStatusSink {
    fn report(&self, _status: PackageStatus) {}
}

/// A package present in the root after an install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    /// Package name.
    pub name: String,
    /// Version read from the installed manifest.
    pub version: String,
}

/// Installs and removes packages under one root directory.
pub struct PackageManager {
    root: PathBuf,
    npm_command: String,
    cache: Arc<ModuleCache>,
}

impl PackageManager {
    /// A manager for `root`, sharing `cache` with the module resolver.
    pub fn new(root: impl Into<PathBuf>, cache: Arc<ModuleCache>) -> Self {
        Self {
            root: root.into(),
            npm_command: "npm".to_string(),
            cache,
        }
    }

    /// Use a different npm executable.
    pub fn with_npm_command(mut self, command: impl Into<String>) -> Self {
        self.npm_command = command.into();
        self
    }

    /// The package root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The module cache this manager invalidates.
    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    /// Installed packages by name.
    ///
    /// Names come from the root `package.json` dependencies. The version is
    /// the one actually installed when its manifest is readable, otherwise
    /// the declared range.
    pub fn installed(&self) -> Result<BTreeMap<String, String>, BridgeError> {
        let manifest = match std::fs::read_to_string(self.root.join("package.json")) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let manifest: Value = serde_json::from_str(&manifest)
            .map_err(|e| anyhow::anyhow!("root package.json is not valid JSON: {e}"))?;

        let mut packages = BTreeMap::new();
        if let Some(deps) = manifest.get("dependencies").and_then(Value::as_object) {
            for (name, range) in deps {
                let version = self
                    .installed_version(name)
                    .or_else(|| range.as_str().map(str::to_string))
                    .unwrap_or_default();
                packages.insert(name.clone(), version);
            }
        }
        Ok(packages)
    }

    /// Install `name`, optionally at `version`.
    pub async fn install(
        &self,
        name: &str,
        version: Option<&str>,
        sink: &dyn PackageStatusSink,
    ) -> Result<InstalledPackage, BridgeError> {
        let outcome = self.try_install(name, version, sink).await;
        match &outcome {
            Ok(installed) => {
                tracing::info!(name = %installed.name, version = %installed.version, "package installed");
                report(sink, InstallStatus::Installed, name, format!("Installed {name}@{}", installed.version));
            }
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "package install failed");
                report(sink, InstallStatus::Error, name, e.to_string());
            }
        }
        outcome
    }

    async fn try_install(
        &self,
        name: &str,
        version: Option<&str>,
        sink: &dyn PackageStatusSink,
    ) -> Result<InstalledPackage, BridgeError> {
        validate_package_name(name)?;
        let spec = match version.filter(|v| !v.is_empty()) {
            Some(version) => {
                validate_version(version)?;
                format!("{name}@{version}")
            }
            None => name.to_string(),
        };

        report(sink, InstallStatus::Installing, name, format!("Installing {spec}..."));
        self.ensure_root_manifest()?;
        self.run_npm(&["install", &spec]).await?;
        self.cache.invalidate(name);

        let version = self.installed_version(name).ok_or_else(|| {
            anyhow::anyhow!("npm reported success but {name} is not in node_modules")
        })?;
        Ok(InstalledPackage {
            name: name.to_string(),
            version,
        })
    }

    /// Remove `name`.
    pub async fn uninstall(
        &self,
        name: &str,
        sink: &dyn PackageStatusSink,
    ) -> Result<(), BridgeError> {
        let outcome = async {
            validate_package_name(name)?;
            report(sink, InstallStatus::Uninstalling, name, format!("Uninstalling {name}..."));
            self.run_npm(&["uninstall", name]).await?;
            self.cache.invalidate(name);
            Ok::<_, BridgeError>(())
        }
        .await;

        match &outcome {
            Ok(()) => {
                tracing::info!(name = %name, "package uninstalled");
                report(sink, InstallStatus::Uninstalled, name, format!("Uninstalled {name}"));
            }
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "package uninstall failed");
                report(sink, InstallStatus::Error, name, e.to_string());
            }
        }
        outcome
    }

    /// Run `<npm> <args> --prefix <root>` without a shell.
    async fn run_npm(&self, args: &[&str]) -> Result<(), BridgeError> {
        tracing::debug!(command = %self.npm_command, ?args, root = %self.root.display(), "running package tool");
        let output = Command::new(&self.npm_command)
            .args(args)
            .arg("--prefix")
            .arg(&self.root)
            .args(["--no-audit", "--no-fund"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let stderr = match stderr.char_indices().nth(MAX_STDERR_LEN) {
            Some((cut, _)) => format!("{}...", &stderr[..cut]),
            None => stderr.to_string(),
        };
        Err(BridgeError::PackageTool {
            status: output.status.to_string(),
            stderr,
        })
    }

    /// Create `<root>/package.json` if it does not exist, so npm installs
    /// into this root instead of walking up to an enclosing project.
    fn ensure_root_manifest(&self) -> Result<(), BridgeError> {
        std::fs::create_dir_all(&self.root)?;
        let manifest = self.root.join("package.json");
        if !manifest.exists() {
            let body = serde_json::json!({
                "name": "jsplay-packages",
                "private": true,
                "dependencies": {}
            });
            std::fs::write(&manifest, format!("{body:#}\n"))?;
        }
        Ok(())
    }

    fn installed_version(&self, name: &str) -> Option<String> {
        let manifest = self
            .root
            .join("node_modules")
            .join(name)
            .join("package.json");
        let content = std::fs::read_to_string(manifest).ok()?;
        let value: Value = serde_json::from_str(&content).ok()?;
        value.get("version")?.as_str().map(str::to_string)
    }
}

fn report(sink: &dyn PackageStatusSink, status: InstallStatus, name: &str, message: String) {
    sink.report(PackageStatus {
        status,
        name: name.to_string(),
        message,
    });
}

/// Check `name` against npm's package naming rules.
pub fn validate_package_name(name: &str) -> Result<(), BridgeError> {
    let invalid = |reason: &str| BridgeError::InvalidPackageName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 214 characters"));
    }
    if name != name.to_lowercase() {
        return Err(invalid("name must be lowercase"));
    }

    let bare = match name.strip_prefix('@') {
        Some(scoped) => {
            let (scope, bare) = scoped
                .split_once('/')
                .ok_or_else(|| invalid("scoped name must look like @scope/name"))?;
            check_segment(scope).map_err(|r| invalid(&format!("scope {r}")))?;
            bare
        }
        None => name,
    };
    check_segment(bare).map_err(|r| invalid(&r))
}

fn check_segment(segment: &str) -> Result<(), String> {
    if segment.is_empty() {
        return Err("must not be empty".into());
    }
    // a leading '-' would reach npm as an option
    if segment.starts_with(['.', '_', '-']) {
        return Err("must not start with '.', '_' or '-'".into());
    }
    if let Some(c) = segment
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '-' | '.' | '_' | '~'))
    {
        return Err(format!("contains invalid character '{c}'"));
    }
    Ok(())
}

/// Reject versions that could smuggle extra arguments to npm.
pub fn validate_version(version: &str) -> Result<(), BridgeError> {
    let bad = version.starts_with('-')
        || version.chars().any(|c| {
            c.is_whitespace()
                || c.is_control()
                || matches!(c, ';' | '&' | '|' | '`' | '$' | '(' | ')' | '<' | '>' | '"' | '\'' | '\\')
        });
    if version.is_empty() || bad {
        return Err(BridgeError::InvalidVersion(version.to_string()));
    }
    Ok(())
}
