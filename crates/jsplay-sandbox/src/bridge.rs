//! Plain data carried between the sandbox and its capability backends.
//!
//! Everything here is `Serialize + Deserialize` so the same values cross
//! the parent/worker IPC boundary unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{ConsoleSink, HttpBridge, ModuleResolver};

/// Severity of a console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    /// `console.log`
    Log,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
    /// `console.debug`, delivered on the log channel.
    Debug,
}

impl ConsoleLevel {
    /// Parse the level name used by the console shim.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "log" => Some(Self::Log),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    /// The event channel a UI listens on for this level.
    pub fn channel(self) -> &'static str {
        match self {
            Self::Log | Self::Debug => "console-log",
            Self::Info => "console-info",
            Self::Warn => "console-warn",
            Self::Error => "console-error",
        }
    }
}

/// One console call, with every argument already rendered for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEvent {
    /// Which console method was called.
    pub level: ConsoleLevel,
    /// Arguments rendered by `stringify_for_console`.
    pub args: Vec<String>,
}

/// How a resolved module is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// CommonJS source.
    Js,
    /// A JSON document, exported as parsed data.
    Json,
}

/// A module located by a [`ModuleResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModule {
    /// Stable id relative to the package root, e.g. `lodash/lodash.js`.
    /// Relative requires inside the module resolve against it.
    pub id: String,
    /// Virtual filename exposed as `__filename`. Never a host path.
    pub filename: String,
    /// Source format.
    pub kind: ModuleKind,
    /// Module source text.
    pub source: String,
}

/// A request issued by the `fetch` shim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Absolute URL.
    pub url: String,
    /// Upper-cased method, `GET` by default.
    #[serde(default = "default_method")]
    pub method: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body, if any.
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// The host-side answer to an [`HttpRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    /// Response body as text.
    pub data: String,
    /// HTTP status code.
    pub status: u16,
    /// Canonical reason phrase.
    pub status_text: String,
    /// Response headers, lower-cased names.
    pub headers: BTreeMap<String, String>,
    /// Final URL after redirects.
    pub url: String,
}

/// The backends one execution may reach.
///
/// Built per request. The console sink is mandatory; module and HTTP
/// backends are only wired in when the matching capability is enabled.
#[derive(Clone)]
pub struct SandboxEnvironment {
    /// Receives console calls as they happen.
    pub console: Arc<dyn ConsoleSink>,
    /// Resolves `require` specifiers.
    pub modules: Option<Arc<dyn ModuleResolver>>,
    /// Performs `fetch` requests on the host.
    pub http: Option<Arc<dyn HttpBridge>>,
}

impl SandboxEnvironment {
    /// An environment with only a console sink.
    pub fn new(console: Arc<dyn ConsoleSink>) -> Self {
        Self {
            console,
            modules: None,
            http: None,
        }
    }

    /// Attach a module resolver.
    pub fn with_modules(mut self, modules: Arc<dyn ModuleResolver>) -> Self {
        self.modules = Some(modules);
        self
    }

    /// Attach an HTTP bridge.
    pub fn with_http(mut self, http: Arc<dyn HttpBridge>) -> Self {
        self.http = Some(http);
        self
    }
}

impl std::fmt::Debug for SandboxEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEnvironment")
            .field("modules", &self.modules.is_some())
            .field("http", &self.http.is_some())
            .finish()
    }
}

/// A [`ConsoleSink`] that forwards events into an unbounded channel.
pub struct ChannelConsoleSink {
    tx: tokio::sync::mpsc::UnboundedSender<ConsoleEvent>,
}

impl ChannelConsoleSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ConsoleEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ConsoleSink for ChannelConsoleSink {
    fn emit(&self, event: ConsoleEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("console receiver dropped, discarding event");
        }
    }
}

/// A [`ConsoleSink`] that discards everything.
pub struct NullConsoleSink;

impl ConsoleSink for NullConsoleSink {
    fn emit(&self, _event: ConsoleEvent) {}
}
