//! jsplay sandbox worker: isolated child process for V8 execution.
//!
//! This binary is spawned by [`jsplay_sandbox::host::SandboxHost`] in the
//! parent process. It receives one script and its configuration over stdin,
//! runs it in a V8 isolate, and sends console events and the result back
//! over stdout. `require` and `fetch` are proxied through the parent.
//!
//! **Security**: This process runs with a clean environment: no
//! credentials, no package directory, no network client of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use jsplay_error::BridgeError;
use jsplay_sandbox::executor::run_script;
use jsplay_sandbox::ipc::{
    read_message, read_message_with_limit, write_message, ChildMessage, ParentMessage,
};
use jsplay_sandbox::validator::validate_code;
use jsplay_sandbox::{
    ConsoleEvent, ConsoleSink, ExecutionResult, HttpBridge, HttpRequest, HttpResponse,
    ModuleResolver, ResolvedModule, SandboxEnvironment,
};
use tokio::io::{self, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

/// Where the answer to an outstanding request goes.
enum Waiter {
    /// `require` blocks the isolate thread, so it waits on a std channel.
    Module(std::sync::mpsc::Sender<Result<ResolvedModule, String>>),
    Fetch(oneshot::Sender<Result<HttpResponse, String>>),
}

type Waiters = Arc<Mutex<HashMap<u64, Waiter>>>;

/// Shared plumbing for the proxies: outgoing messages and pending answers.
#[derive(Clone)]
struct Link {
    tx: mpsc::UnboundedSender<ChildMessage>,
    waiters: Waiters,
    next_id: Arc<AtomicU64>,
}

impl Link {
    /// Register `waiter` and send `request(id)`. The waiter is in place before
    /// the parent can possibly answer.
    fn send_request(
        &self,
        waiter: Waiter,
        request: impl FnOnce(u64) -> ChildMessage,
    ) -> Result<u64, BridgeError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock_waiters().insert(request_id, waiter);
        if self.tx.send(request(request_id)).is_err() {
            self.lock_waiters().remove(&request_id);
            return Err(anyhow::anyhow!("IPC send channel closed").into());
        }
        Ok(request_id)
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Console sink that forwards every event to the parent.
struct IpcConsoleSink {
    tx: mpsc::UnboundedSender<ChildMessage>,
}

impl ConsoleSink for IpcConsoleSink {
    fn emit(&self, event: ConsoleEvent) {
        let _ = self.tx.send(ChildMessage::Console { event });
    }
}

/// Module resolver that asks the parent.
struct IpcModuleResolver {
    link: Link,
    /// Upper bound on one round trip; the parent kills us at the deadline anyway.
    timeout: Duration,
}

impl ModuleResolver for IpcModuleResolver {
    fn resolve(
        &self,
        specifier: &str,
        referrer: Option<&str>,
    ) -> Result<ResolvedModule, BridgeError> {
        let (resp_tx, resp_rx) = std::sync::mpsc::channel();
        let request_id = self.link.send_request(Waiter::Module(resp_tx), |request_id| {
            ChildMessage::ModuleRequest {
                request_id,
                specifier: specifier.to_string(),
                referrer: referrer.map(str::to_string),
            }
        })?;

        let answer = resp_rx.recv_timeout(self.timeout).map_err(|_| {
            self.link.lock_waiters().remove(&request_id);
            BridgeError::from(anyhow::anyhow!("no module answer from parent"))
        })?;

        // The parent's resolver already rendered the error; keep the class.
        answer.map_err(|message| match message.strip_prefix("Cannot find module '") {
            Some(rest) => BridgeError::ModuleNotFound(rest.trim_end_matches('\'').to_string()),
            None => BridgeError::from(anyhow::anyhow!("{message}")),
        })
    }
}

/// HTTP bridge that asks the parent.
struct IpcHttpBridge {
    link: Link,
}

#[async_trait::async_trait]
impl HttpBridge for IpcHttpBridge {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        let url = request.url.clone();
        let (resp_tx, resp_rx) = oneshot::channel();
        self.link.send_request(Waiter::Fetch(resp_tx), |request_id| {
            ChildMessage::FetchRequest {
                request_id,
                request,
            }
        })?;

        let answer = resp_rx
            .await
            .map_err(|_| BridgeError::from(anyhow::anyhow!("IPC response channel closed")))?;
        answer.map_err(|message| BridgeError::Http { url, message })
    }
}

/// Read whole frames from the parent on their own task. `read_exact` is not
/// cancel-safe, so the select loop below only ever waits on this channel.
fn spawn_parent_reader(
    mut stdin: BufReader<io::Stdin>,
    max_size: usize,
) -> mpsc::UnboundedReceiver<io::Result<Option<ParentMessage>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let frame = read_message_with_limit::<ParentMessage, _>(&mut stdin, max_size).await;
            let last = !matches!(frame, Ok(Some(_)));
            if tx.send(frame).is_err() || last {
                break;
            }
        }
    });
    rx
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Clean environment: remove all env vars for security isolation
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    // Minimal logging to stderr (the parent discards it unless JSPLAY_DEBUG is set)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let msg: ParentMessage = read_message(&mut stdin)
        .await
        .context("failed to read initial message from parent")?
        .context("parent closed stdin before sending Execute")?;

    let (source, config) = match msg {
        ParentMessage::Execute { source, config } => (source, config),
        other => {
            anyhow::bail!("expected Execute message, got: {:?}", other);
        }
    };

    let sandbox_config = config.to_sandbox_config();
    let max_ipc_size = config.max_ipc_message_size;

    let (tx, mut rx) = mpsc::unbounded_channel::<ChildMessage>();
    let link = Link {
        tx: tx.clone(),
        waiters: Arc::new(Mutex::new(HashMap::new())),
        next_id: Arc::new(AtomicU64::new(1)),
    };

    let mut env = SandboxEnvironment::new(Arc::new(IpcConsoleSink { tx: tx.clone() }));
    if config.capabilities.require {
        env = env.with_modules(Arc::new(IpcModuleResolver {
            link: link.clone(),
            timeout: sandbox_config.timeout,
        }));
    }
    if config.capabilities.fetch {
        env = env.with_http(Arc::new(IpcHttpBridge { link: link.clone() }));
    }

    // V8 isolates are !Send: run on a dedicated thread
    let exec_tx = tx.clone();
    let exec_handle = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = exec_tx.send(ChildMessage::ExecutionComplete {
                    result: ExecutionResult::from(Err(
                        jsplay_sandbox::SandboxError::Execution(e.into()),
                    )),
                });
                return;
            }
        };

        let result = match validate_code(&source, Some(sandbox_config.max_code_size)) {
            Ok(()) => rt.block_on(run_script(&sandbox_config, &source, env)),
            Err(e) => Err(e),
        };

        let _ = exec_tx.send(ChildMessage::ExecutionComplete {
            result: ExecutionResult::from(result),
        });
    });
    drop(tx);

    let mut from_parent = spawn_parent_reader(stdin, max_ipc_size);

    // IPC event loop: multiplex between
    // 1. Outgoing messages from the V8 thread (console, requests, completion)
    // 2. Incoming answers from the parent
    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(child_msg) => {
                        let is_complete = matches!(child_msg, ChildMessage::ExecutionComplete { .. });
                        write_message(&mut stdout, &child_msg).await
                            .context("failed to write message to parent")?;
                        stdout.flush().await?;
                        if is_complete {
                            break;
                        }
                    }
                    None => {
                        // Every sender is gone without a completion: the V8 thread died
                        let msg = ChildMessage::ExecutionComplete {
                            result: ExecutionResult::from(Err(
                                jsplay_sandbox::SandboxError::Execution(anyhow::anyhow!(
                                    "worker thread exited unexpectedly"
                                )),
                            )),
                        };
                        write_message(&mut stdout, &msg).await.ok();
                        break;
                    }
                }
            }

            incoming = from_parent.recv() => {
                match incoming {
                    Some(Ok(Some(ParentMessage::ModuleResult { request_id, result }))) => {
                        if let Some(Waiter::Module(waiter)) = link.lock_waiters().remove(&request_id) {
                            let _ = waiter.send(result);
                        }
                    }
                    Some(Ok(Some(ParentMessage::FetchResult { request_id, result }))) => {
                        if let Some(Waiter::Fetch(waiter)) = link.lock_waiters().remove(&request_id) {
                            let _ = waiter.send(result);
                        }
                    }
                    Some(Ok(Some(ParentMessage::Execute { .. }))) => {
                        tracing::warn!("unexpected second Execute from parent");
                    }
                    Some(Ok(None)) | None => {
                        // Parent closed stdin: abort
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "failed to read from parent");
                        break;
                    }
                }
            }
        }
    }

    if !exec_handle.is_finished() {
        // The parent is gone or done with us; do not wait on a running script.
        std::process::exit(0);
    }
    let _ = exec_handle.join();

    Ok(())
}
