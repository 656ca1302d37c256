//! `require` end to end: scripts loading packages from an on-disk
//! `node_modules` through [`FsModuleResolver`].

use std::path::Path;
use std::sync::Arc;

use jsplay_sandbox::{
    ExecutionResult, FaultKind, FsModuleResolver, ModuleCache, NullConsoleSink, SandboxConfig,
    SandboxEnvironment, SandboxExecutor, SerializedValue,
};
use serde_json::json;

struct Packages {
    dir: tempfile::TempDir,
    cache: Arc<ModuleCache>,
}

impl Packages {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        Self {
            dir,
            cache: Arc::new(ModuleCache::new()),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, rel: &str, contents: &str) -> &Self {
        let path = self.root().join("node_modules").join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
        self
    }

    async fn run(&self, code: &str) -> ExecutionResult {
        let resolver = FsModuleResolver::new(self.root(), self.cache.clone());
        let env = SandboxEnvironment::new(Arc::new(NullConsoleSink)).with_modules(Arc::new(resolver));
        SandboxExecutor::new(SandboxConfig::default())
            .execute(code, env)
            .await
    }

    async fn plain(&self, code: &str) -> serde_json::Value {
        let result = self.run(code).await;
        match result.value() {
            Some(value) => value.to_plain_json(),
            None => panic!("expected success for {code:?}, got {result:?}"),
        }
    }
}

#[tokio::test]
async fn package_main_with_relative_and_json_requires() {
    let packages = Packages::new();
    packages
        .write(
            "greeter/package.json",
            r#"{"name":"greeter","version":"1.2.0","main":"lib/index.js"}"#,
        )
        .write(
            "greeter/lib/index.js",
            "const { hello } = require('./words.json'); const shout = require('./shout'); module.exports = (n) => shout(hello + ', ' + n);",
        )
        .write("greeter/lib/shout.js", "module.exports = (s) => s.toUpperCase() + '!';")
        .write("greeter/lib/words.json", r#"{"hello": "hello"}"#);

    assert_eq!(packages.plain("require('greeter')('world')").await, json!("HELLO, WORLD!"));
}

#[tokio::test]
async fn deep_imports_and_scoped_packages() {
    let packages = Packages::new();
    packages
        .write("tools/string/pad.js", "exports.pad = (s, n) => s.padStart(n, '.');")
        .write("@acme/math/index.js", "exports.double = (x) => x * 2;");

    assert_eq!(
        packages
            .plain("[require('tools/string/pad').pad('x', 3), require('@acme/math').double(21)]")
            .await,
        json!(["..x", 42])
    );
}

#[tokio::test]
async fn module_scope_exposes_virtual_paths() {
    let packages = Packages::new();
    packages.write(
        "where/lib/here.js",
        "module.exports = { file: __filename, dir: __dirname, id: module.id };",
    );

    let value = packages.plain("require('where/lib/here')").await;
    assert_eq!(
        value,
        json!({
            "file": "/node_modules/where/lib/here.js",
            "dir": "/node_modules/where/lib",
            "id": "where/lib/here.js"
        })
    );
    let root = packages.root().to_str().unwrap().to_string();
    assert!(!value.to_string().contains(&root));
}

#[tokio::test]
async fn a_module_runs_once_per_execution() {
    let packages = Packages::new();
    packages.write(
        "counter/index.js",
        "globalThis.loads = (globalThis.loads || 0) + 1; module.exports = { n: globalThis.loads };",
    );

    let code = "const a = require('counter'); const b = require('counter'); [a === b, globalThis.loads]";
    assert_eq!(packages.plain(code).await, json!([true, 1]));
    // a fresh execution starts with an empty export table
    assert_eq!(packages.plain(code).await, json!([true, 1]));
}

#[tokio::test]
async fn circular_requires_see_partial_exports() {
    let packages = Packages::new();
    packages
        .write(
            "cyc/index.js",
            "exports.name = 'a'; exports.seen = require('./b').seenA;",
        )
        .write("cyc/b.js", "exports.seenA = require('./index').name;");

    assert_eq!(packages.plain("require('cyc').seen").await, json!("a"));
}

#[tokio::test]
async fn missing_modules_are_catchable_with_a_code() {
    let packages = Packages::new();
    let value = packages
        .plain("try { require('nope'); 'loaded' } catch (e) { [e.code, e.message] }")
        .await;
    assert_eq!(value, json!(["MODULE_NOT_FOUND", "Cannot find module 'nope'"]));

    let result = packages.run("require('fs')").await;
    assert_eq!(result.fault_kind(), Some(FaultKind::ModuleNotFound));
}

#[tokio::test]
async fn escaping_the_package_root_is_refused() {
    let packages = Packages::new();
    packages.write("inside/index.js", "module.exports = require('../../secret');");
    std::fs::write(packages.root().join("secret.js"), "module.exports = 'leaked';").unwrap();

    for code in [
        "require('inside')",
        "require('inside/../../secret')",
        "require('/etc/passwd')",
    ] {
        let result = packages.run(code).await;
        assert!(!result.is_success(), "{code}: {result:?}");
        let message = result.message().unwrap();
        assert!(!message.contains("leaked"), "{code}: {message}");
        assert!(
            !message.contains(packages.root().to_str().unwrap()),
            "{code}: {message}"
        );
    }
}

#[tokio::test]
async fn relative_requires_from_the_script_are_not_found() {
    let packages = Packages::new();
    let result = packages.run("require('./local')").await;
    assert_eq!(result.fault_kind(), Some(FaultKind::ModuleNotFound));
}

#[tokio::test]
async fn a_throwing_module_can_be_retried() {
    let packages = Packages::new();
    packages.write(
        "flaky/index.js",
        "globalThis.tries = (globalThis.tries || 0) + 1; if (globalThis.tries === 1) throw new Error('first load fails'); module.exports = globalThis.tries;",
    );

    let code = "let first; try { require('flaky') } catch (e) { first = e.message } [first, require('flaky')]";
    assert_eq!(packages.plain(code).await, json!(["first load fails", 2]));
}

#[tokio::test]
async fn shared_cache_serves_until_invalidated() {
    let packages = Packages::new();
    packages
        .write("pkg/package.json", r#"{"name":"pkg","version":"1.0.0"}"#)
        .write("pkg/index.js", "module.exports = 'v1';");

    let first = packages.run("require('pkg')").await;
    assert_eq!(first.value(), Some(&SerializedValue::String("v1".into())));
    assert!(!packages.cache.is_empty());

    packages.write("pkg/index.js", "module.exports = 'v1 edited';");
    let cached = packages.run("require('pkg')").await;
    assert_eq!(cached.value(), Some(&SerializedValue::String("v1".into())));

    packages.cache.invalidate("pkg");
    let fresh = packages.run("require('pkg')").await;
    assert_eq!(
        fresh.value(),
        Some(&SerializedValue::String("v1 edited".into()))
    );
}

#[tokio::test]
async fn require_is_absent_when_the_capability_is_off() {
    let packages = Packages::new();
    let resolver = FsModuleResolver::new(packages.root(), packages.cache.clone());
    let env = SandboxEnvironment::new(Arc::new(NullConsoleSink)).with_modules(Arc::new(resolver));
    let mut config = SandboxConfig::default();
    config.capabilities.require = false;

    let result = SandboxExecutor::new(config).execute("typeof require", env).await;
    assert_eq!(
        result.value(),
        Some(&SerializedValue::String("undefined".into()))
    );
}
