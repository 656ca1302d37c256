#![warn(missing_docs)]

//! # jsplay-server
//!
//! The host process a playground UI talks to.
//!
//! Requests arrive as newline-delimited JSON on an input stream; responses
//! and events leave as newline-delimited JSON on an output stream (see
//! [`protocol`]). Each request runs on its own task, so a long script does
//! not hold up preference or package requests, and console output from
//! overlapping executions stays tagged with its request id.
//!
//! Methods:
//! - `execute-code`: run untrusted JavaScript in the sandbox
//! - `get-preferences` / `save-preferences` / `reset-preferences`
//! - `get-packages` / `install-package` / `uninstall-package`

pub mod http_bridge;
pub mod packages;
pub mod preferences;
pub mod protocol;

use std::sync::{Arc, LazyLock};

use jsplay_error::BridgeError;
use jsplay_sandbox::{
    ConsoleEvent, ConsoleSink, ExecutionResult, FaultKind, FsModuleResolver, HttpBridge,
    ModuleResolver, SandboxEnvironment, SandboxExecutor,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::packages::{PackageManager, PackageStatus, PackageStatusSink};
use crate::preferences::{Preferences, PreferencesStore};
use crate::protocol::{
    parse_request, read_line, ErrorBody, Event, InputLine, Outgoing, Request, Response,
    DEFAULT_MAX_LINE_BYTES,
};

/// Pulls the specifier out of a `Cannot find module` message.
static MISSING_MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Cannot find module '([^']+)'").unwrap());

/// Handle for queueing output lines. Cloned into every task.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    /// An outbox and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, message: impl Into<Outgoing>) {
        if self.tx.send(message.into()).is_err() {
            tracing::debug!("output closed, dropping message");
        }
    }

    fn event(&self, channel: &str, request_id: Option<u64>, payload: Value) {
        self.send(Event {
            event: channel.to_string(),
            request_id,
            payload,
        });
    }
}

/// Forwards console calls of one execution as `console-*` events.
struct RequestConsoleSink {
    request_id: u64,
    outbox: Outbox,
}

impl ConsoleSink for RequestConsoleSink {
    fn emit(&self, event: ConsoleEvent) {
        let channel = event.level.channel();
        self.outbox.event(
            channel,
            Some(self.request_id),
            json!({ "channel": channel, "args": event.args }),
        );
    }
}

/// Forwards package progress as `package-install-status` events.
struct RequestStatusSink {
    request_id: u64,
    outbox: Outbox,
}

impl PackageStatusSink for RequestStatusSink {
    fn report(&self, status: PackageStatus) {
        let payload = serde_json::to_value(&status).unwrap_or(Value::Null);
        self.outbox
            .event("package-install-status", Some(self.request_id), payload);
    }
}

#[derive(Deserialize)]
struct ExecuteParams {
    source: String,
}

#[derive(Deserialize)]
struct SavePreferencesParams {
    preferences: Value,
}

#[derive(Deserialize)]
struct InstallParams {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct UninstallParams {
    name: String,
}

/// The playground host server.
pub struct PlaygroundServer {
    executor: Arc<SandboxExecutor>,
    preferences: PreferencesStore,
    packages: PackageManager,
    modules: Arc<FsModuleResolver>,
    http: Option<Arc<dyn HttpBridge>>,
    max_line_bytes: usize,
}

impl PlaygroundServer {
    /// Create a server. `require` resolves from the package manager's root
    /// and shares its module cache.
    pub fn new(
        executor: SandboxExecutor,
        preferences: PreferencesStore,
        packages: PackageManager,
    ) -> Self {
        let modules = Arc::new(FsModuleResolver::new(
            packages.root(),
            packages.cache().clone(),
        ));
        Self {
            executor: Arc::new(executor),
            preferences,
            packages,
            modules,
            http: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Cap the size of one request line.
    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    /// Offer `fetch` through `http` (still subject to the fetch capability).
    pub fn with_http(mut self, http: Arc<dyn HttpBridge>) -> Self {
        self.http = Some(http);
        self
    }

    /// The executor, for callers that need its config.
    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    /// Serve requests from `input` until it closes, writing to `output`.
    ///
    /// Waits for in-flight requests to finish before returning.
    pub async fn serve<R, W>(self: Arc<Self>, input: R, mut output: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, mut rx) = Outbox::channel();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut line = serde_json::to_vec(&message)?;
                line.push(b'\n');
                output.write_all(&line).await?;
                output.flush().await?;
            }
            anyhow::Ok(())
        });

        tracing::info!("server: accepting requests");
        let mut input = BufReader::new(input);
        let mut buf = Vec::new();
        let mut in_flight = JoinSet::new();

        while let Some(line) = read_line(&mut input, &mut buf, self.max_line_bytes).await? {
            let line = match line {
                InputLine::Text(line) => line,
                unreadable => {
                    tracing::warn!(line = ?unreadable, "server: unreadable request line");
                    if let Some(response) = unreadable.rejection(self.max_line_bytes) {
                        outbox.send(response);
                    }
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_request(&line) {
                Ok(request) => {
                    let server = self.clone();
                    let outbox = outbox.clone();
                    in_flight.spawn(async move {
                        let response = server.dispatch(request, &outbox).await;
                        outbox.send(response);
                    });
                }
                Err(response) => {
                    tracing::warn!(line_len = line.len(), "server: malformed request");
                    outbox.send(response);
                }
            }
            // Reap finished tasks so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}
        }

        tracing::info!(in_flight = in_flight.len(), "server: input closed, draining");
        while in_flight.join_next().await.is_some() {}
        drop(outbox);

        writer.await??;
        Ok(())
    }

    /// Handle one request and produce its response. Events go to `outbox`
    /// as they happen, so they always precede the response.
    pub async fn dispatch(&self, request: Request, outbox: &Outbox) -> Response {
        let Request { id, method, params } = request;
        tracing::debug!(id, method = %method, "server: dispatch");

        let result = match method.as_str() {
            "execute-code" => match parse_params::<ExecuteParams>(params) {
                Ok(p) => Ok(self.execute_code(id, &p.source, outbox).await),
                Err(e) => Err(e),
            },
            "get-preferences" => Ok(json!(self.preferences.get())),
            "save-preferences" => match parse_params::<SavePreferencesParams>(params) {
                Ok(p) => Ok(json!(self.save_preferences(id, &p.preferences, outbox))),
                Err(e) => Err(e),
            },
            "reset-preferences" => Ok(json!(self.reset_preferences(id, outbox))),
            "get-packages" => Ok(self.get_packages()),
            "install-package" => match parse_params::<InstallParams>(params) {
                Ok(p) => Ok(self.install_package(id, &p.name, p.version.as_deref(), outbox).await),
                Err(e) => Err(e),
            },
            "uninstall-package" => match parse_params::<UninstallParams>(params) {
                Ok(p) => Ok(self.uninstall_package(id, &p.name, outbox).await),
                Err(e) => Err(e),
            },
            other => Err(ErrorBody::method_not_found(other)),
        };

        match result {
            Ok(value) => Response::ok(id, value),
            Err(error) => {
                tracing::warn!(id, method = %method, code = %error.code, "server: request rejected");
                Response::err(Some(id), error)
            }
        }
    }

    async fn execute_code(&self, id: u64, source: &str, outbox: &Outbox) -> Value {
        let console = Arc::new(RequestConsoleSink {
            request_id: id,
            outbox: outbox.clone(),
        });
        let mut env = SandboxEnvironment::new(console).with_modules(self.modules.clone());
        if let Some(http) = &self.http {
            env = env.with_http(http.clone());
        }

        let result = self.executor.execute(source, env).await;
        let result = self.with_module_suggestion(result);
        serde_json::to_value(&result).unwrap_or_else(|e| {
            json!({ "status": "failure", "kind": "internal", "message": e.to_string() })
        })
    }

    /// Append a "did you mean" hint to a missing-module failure when an
    /// installed package has a similar name.
    fn with_module_suggestion(&self, result: ExecutionResult) -> ExecutionResult {
        let message = match result {
            ExecutionResult::Failure {
                kind: FaultKind::ModuleNotFound,
                message,
            } => message,
            other => return other,
        };

        let specifier = MISSING_MODULE_RE
            .captures(&message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        let Some(specifier) = specifier else {
            return ExecutionResult::Failure {
                kind: FaultKind::ModuleNotFound,
                message,
            };
        };

        let known = self.modules.known_packages();
        let known: Vec<&str> = known.iter().map(String::as_str).collect();
        let structured = BridgeError::ModuleNotFound(specifier).to_structured_error(Some(&known));
        let message = match structured["suggested_fix"].as_str() {
            Some(fix) => format!("{message}. {fix}"),
            None => message,
        };
        ExecutionResult::Failure {
            kind: FaultKind::ModuleNotFound,
            message,
        }
    }

    fn save_preferences(&self, id: u64, raw: &Value, outbox: &Outbox) -> bool {
        let preferences = Preferences::from_json(raw);
        let saved = self.preferences.save(&preferences);
        if saved {
            outbox.event("preferences-changed", Some(id), json!(preferences));
        }
        saved
    }

    fn reset_preferences(&self, id: u64, outbox: &Outbox) -> bool {
        let reset = self.preferences.reset();
        if reset {
            outbox.event("preferences-changed", Some(id), json!(Preferences::default()));
        }
        reset
    }

    fn get_packages(&self) -> Value {
        match self.packages.installed() {
            Ok(packages) => json!(packages),
            Err(e) => {
                tracing::warn!(error = %e, "packages: listing failed");
                json!({})
            }
        }
    }

    async fn install_package(
        &self,
        id: u64,
        name: &str,
        version: Option<&str>,
        outbox: &Outbox,
    ) -> Value {
        let sink = RequestStatusSink {
            request_id: id,
            outbox: outbox.clone(),
        };
        match self.packages.install(name, version, &sink).await {
            Ok(installed) => json!(installed),
            Err(_) => Value::Null,
        }
    }

    async fn uninstall_package(&self, id: u64, name: &str, outbox: &Outbox) -> Value {
        let sink = RequestStatusSink {
            request_id: id,
            outbox: outbox.clone(),
        };
        match self.packages.uninstall(name, &sink).await {
            Ok(()) => json!({ "name": name }),
            Err(_) => Value::Null,
        }
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, ErrorBody> {
    serde_json::from_value(params).map_err(|e| ErrorBody::invalid_params(e.to_string()))
}
