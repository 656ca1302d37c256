#![warn(missing_docs)]

//! # jsplay-sandbox
//!
//! V8 sandbox behind the jsplay JavaScript playground.
//!
//! Runs untrusted scripts in a fresh deno_core isolate per execution. The
//! script sees a small, explicit global environment: a console shim and,
//! when enabled, `require`, `fetch` and timers. Every effect leaves the
//! isolate through an op that forwards to one of the capability traits
//! below, so the host decides what a script may reach.
//!
//! ## Security model
//!
//! - **Fresh runtime per call**: no globals, module exports or timers survive
//! - **No ops reachable from scripts**: `Deno` is deleted after bootstrap
//! - **No ambient filesystem or network**: only the resolver and HTTP bridge
//! - **Preemptive deadline**: a watchdog terminates the isolate
//! - **Heap cap**: a near-heap-limit callback terminates instead of aborting
//! - **Redacted faults**: stack frames, host paths and credentials are stripped

#[cfg(feature = "ast-validator")]
pub mod ast_validator;
pub mod bootstrap;
pub mod bridge;
pub mod error;
pub mod executor;
pub mod host;
pub mod ipc;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod modules;
pub mod ops;
pub mod redact;
pub mod result;
pub mod serialize;
pub mod validator;
pub mod value;

pub use bridge::{
    ChannelConsoleSink, ConsoleEvent, ConsoleLevel, HttpRequest, HttpResponse, ModuleKind,
    NullConsoleSink, ResolvedModule, SandboxEnvironment,
};
pub use error::SandboxError;
pub use executor::{Capabilities, ExecutionMode, SandboxConfig, SandboxExecutor};
pub use modules::{FsModuleResolver, ModuleCache};
pub use result::{ExecutionResult, FaultKind};
pub use value::{stringify_for_console, ErrorValue, SerializedValue};

use jsplay_error::BridgeError;

/// Receives console output from a running script.
///
/// Called synchronously from the isolate thread, once per console call and
/// in call order. Implementations must not block.
pub trait ConsoleSink: Send + Sync {
    /// Deliver one console call.
    fn emit(&self, event: ConsoleEvent);
}

/// Resolves `require` specifiers to module source.
///
/// Called from the isolate thread; `require` is synchronous in the script,
/// so resolution is too.
pub trait ModuleResolver: Send + Sync {
    /// Resolve `specifier` as required from the module `referrer`
    /// (a [`ResolvedModule::id`]), or from the script itself when `None`.
    fn resolve(
        &self,
        specifier: &str,
        referrer: Option<&str>,
    ) -> Result<ResolvedModule, BridgeError>;

    /// Names of the packages this resolver can load, for suggestions.
    fn known_packages(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Performs `fetch` requests on behalf of a script.
#[async_trait::async_trait]
pub trait HttpBridge: Send + Sync {
    /// Perform the request and buffer the response body.
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError>;
}
