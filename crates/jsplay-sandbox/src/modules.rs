//! `require` resolution against an app-private `node_modules` directory.
//!
//! [`FsModuleResolver`] maps specifiers to files under
//! `<root>/node_modules` using a reduced Node algorithm (exact file, `.js`,
//! `.json`, `package.json` `main`, `index.*`). Nothing outside that
//! directory resolves, including through symlinks. Built-in Node modules
//! are not provided.
//!
//! Module sources are cached in a [`ModuleCache`] keyed by package name and
//! version; the package manager invalidates a package's entries when it
//! installs or removes it. Evaluated exports are never cached here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use jsplay_error::BridgeError;

use crate::bridge::{ModuleKind, ResolvedModule};
use crate::ModuleResolver;

/// Prefix of the virtual filenames exposed to scripts.
const VIRTUAL_ROOT: &str = "/node_modules";

type PackageKey = (String, String);

/// Resolved module sources, grouped by `(package name, version)`.
#[derive(Default)]
pub struct ModuleCache {
    packages: Mutex<HashMap<PackageKey, HashMap<String, ResolvedModule>>>,
}

impl ModuleCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PackageKey, HashMap<String, ResolvedModule>>> {
        self.packages.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The cached module `id` of `name@version`.
    pub fn get(&self, name: &str, version: &str, id: &str) -> Option<ResolvedModule> {
        self.lock()
            .get(&(name.to_string(), version.to_string()))
            .and_then(|modules| modules.get(id))
            .cloned()
    }

    /// Cache `module` under `name@version`.
    pub fn insert(&self, name: &str, version: &str, module: ResolvedModule) {
        self.lock()
            .entry((name.to_string(), version.to_string()))
            .or_default()
            .insert(module.id.clone(), module);
    }

    /// Drop every cached version of `name`.
    pub fn invalidate(&self, name: &str) {
        let mut packages = self.lock();
        let before = packages.len();
        packages.retain(|(cached, _), _| cached != name);
        if packages.len() != before {
            tracing::debug!(package = %name, "module cache invalidated");
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of cached modules across all packages.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves `require` against `<root>/node_modules`.
pub struct FsModuleResolver {
    root: PathBuf,
    cache: Arc<ModuleCache>,
}

impl FsModuleResolver {
    /// A resolver for the package root `root` sharing `cache`.
    pub fn new(root: impl Into<PathBuf>, cache: Arc<ModuleCache>) -> Self {
        Self {
            root: root.into(),
            cache,
        }
    }

    /// The package root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_modules(&self) -> PathBuf {
        self.root.join("node_modules")
    }

    fn path_of(&self, segments: &[String]) -> PathBuf {
        segments
            .iter()
            .fold(self.node_modules(), |path, segment| path.join(segment))
    }

    /// Segments under `node_modules` that `specifier` names, before probing.
    fn target_segments(
        &self,
        specifier: &str,
        referrer: Option<&str>,
    ) -> Result<Vec<String>, BridgeError> {
        let not_found = || BridgeError::ModuleNotFound(specifier.to_string());
        let outside = || BridgeError::OutsidePackageRoot {
            specifier: specifier.to_string(),
        };

        if specifier.is_empty() || specifier.starts_with("node:") {
            return Err(not_found());
        }
        if specifier.starts_with('/')
            || specifier.contains('\\')
            || specifier.contains(':')
            || specifier.contains('\0')
        {
            return Err(outside());
        }

        let relative = specifier == "."
            || specifier == ".."
            || specifier.starts_with("./")
            || specifier.starts_with("../");

        if relative {
            // Relative requires only make sense from inside a package.
            let referrer = referrer.ok_or_else(not_found)?;
            let mut segments: Vec<String> = referrer.split('/').map(str::to_string).collect();
            segments.pop();
            push_relative(&mut segments, 0, specifier).map_err(|_| outside())?;
            if segments.is_empty() {
                return Err(outside());
            }
            return Ok(segments);
        }

        let segments: Vec<String> = specifier.split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s == ".." || s == "." || s.is_empty()) {
            return Err(outside());
        }
        if segments[0].starts_with('@') && segments.len() < 2 {
            return Err(not_found());
        }
        Ok(segments)
    }

    fn probe(&self, segments: &[String]) -> Option<Vec<String>> {
        self.probe_file(segments)
            .or_else(|| self.probe_directory(segments))
    }

    fn probe_file(&self, segments: &[String]) -> Option<Vec<String>> {
        let (last, parent) = segments.split_last()?;
        for name in [last.clone(), format!("{last}.js"), format!("{last}.json")] {
            let mut candidate = parent.to_vec();
            candidate.push(name);
            if self.path_of(&candidate).is_file() {
                return Some(candidate);
            }
        }
        None
    }

    fn probe_directory(&self, segments: &[String]) -> Option<Vec<String>> {
        let dir = self.path_of(segments);
        if !dir.is_dir() {
            return None;
        }
        if let Some(main) = read_manifest_field(&dir.join("package.json"), "main") {
            let mut target = segments.to_vec();
            if push_relative(&mut target, segments.len(), &main).is_ok() {
                let found = self
                    .probe_file(&target)
                    .or_else(|| self.probe_index(&target));
                if found.is_some() {
                    return found;
                }
            }
        }
        self.probe_index(segments)
    }

    fn probe_index(&self, segments: &[String]) -> Option<Vec<String>> {
        ["index.js", "index.json"].into_iter().find_map(|index| {
            let mut candidate = segments.to_vec();
            candidate.push(index.to_string());
            self.path_of(&candidate).is_file().then_some(candidate)
        })
    }

    /// Reject files that only resolve outside `node_modules` (symlinks).
    fn confine(&self, specifier: &str, path: &Path) -> Result<(), BridgeError> {
        let base = self.node_modules().canonicalize()?;
        let real = path.canonicalize()?;
        if real.starts_with(&base) {
            Ok(())
        } else {
            Err(BridgeError::OutsidePackageRoot {
                specifier: specifier.to_string(),
            })
        }
    }

    fn installed_version(&self, package: &str) -> String {
        let manifest = self.node_modules().join(package).join("package.json");
        read_manifest_field(&manifest, "version").unwrap_or_else(|| "0.0.0".to_string())
    }
}

impl ModuleResolver for FsModuleResolver {
    fn resolve(
        &self,
        specifier: &str,
        referrer: Option<&str>,
    ) -> Result<ResolvedModule, BridgeError> {
        let segments = self.target_segments(specifier, referrer)?;
        let found = self
            .probe(&segments)
            .ok_or_else(|| BridgeError::ModuleNotFound(specifier.to_string()))?;

        let path = self.path_of(&found);
        self.confine(specifier, &path)?;

        let id = found.join("/");
        let package = package_of(&found);
        let version = self.installed_version(&package);
        if let Some(module) = self.cache.get(&package, &version, &id) {
            return Ok(module);
        }

        let source = fs::read_to_string(&path)?;
        let kind = if id.ends_with(".json") {
            ModuleKind::Json
        } else {
            ModuleKind::Js
        };
        let module = ResolvedModule {
            filename: format!("{VIRTUAL_ROOT}/{id}"),
            id,
            kind,
            source: strip_shebang(source),
        };
        tracing::debug!(package = %package, version = %version, id = %module.id, "module loaded");
        self.cache.insert(&package, &version, module.clone());
        Ok(module)
    }

    fn known_packages(&self) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(entries) = fs::read_dir(self.node_modules()) else {
            return names;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            if name.starts_with('@') {
                if let Ok(scoped) = fs::read_dir(entry.path()) {
                    names.extend(scoped.flatten().map(|e| {
                        format!("{name}/{}", e.file_name().to_string_lossy())
                    }));
                }
            } else {
                names.push(name);
            }
        }
        names.sort();
        names
    }
}

/// Apply `relative` to `segments`, never popping below `floor`.
fn push_relative(segments: &mut Vec<String>, floor: usize, relative: &str) -> Result<(), ()> {
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if segments.len() <= floor {
                    return Err(());
                }
                segments.pop();
            }
            part => segments.push(part.to_string()),
        }
    }
    Ok(())
}

/// The package a module id belongs to: its first segment, or two for scopes.
fn package_of(segments: &[String]) -> String {
    match segments {
        [scope, name, ..] if scope.starts_with('@') => format!("{scope}/{name}"),
        [name, ..] => name.clone(),
        [] => String::new(),
    }
}

fn read_manifest_field(path: &Path, field: &str) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&text).ok()?;
    manifest.get(field)?.as_str().map(str::to_string)
}

/// Blank out a `#!` line; line numbers stay the same.
fn strip_shebang(source: String) -> String {
    if source.starts_with("#!") {
        format!("//{}", &source[2..])
    } else {
        source
    }
}
