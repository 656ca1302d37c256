//! SandboxHost: parent-side management of isolated worker child processes.
//!
//! Spawns `jsplay-worker` as a child process with a clean environment,
//! communicates over length-delimited JSON IPC (stdin/stdout), forwards
//! console events to the request's sink, and answers `require`/`fetch`
//! requests with the parent's backends.

use std::path::{Path, PathBuf};
use std::time::Duration;

use jsplay_error::BridgeError;
use tokio::io::BufReader;
use tokio::process::{ChildStdin, ChildStdout, Command};

use crate::bridge::SandboxEnvironment;
use crate::error::SandboxError;
use crate::executor::SandboxConfig;
use crate::ipc::{read_message_with_limit, write_message, ChildMessage, ParentMessage, WorkerConfig};
use crate::result::{ExecutionResult, FaultKind};
use crate::value::SerializedValue;

/// Name of the worker binary.
pub const WORKER_BINARY: &str = "jsplay-worker";

/// Environment variable naming an explicit worker binary (absolute path).
pub const WORKER_BIN_ENV: &str = "JSPLAY_WORKER_BIN";

/// Grace period past the script deadline for the child to report its own timeout.
const CHILD_GRACE: Duration = Duration::from_secs(2);

/// Manages spawning and communicating with sandbox worker child processes.
pub struct SandboxHost;

impl SandboxHost {
    /// Execute a script in an isolated child process.
    ///
    /// 1. Spawns `jsplay-worker` with a clean environment
    /// 2. Sends the script and config via IPC
    /// 3. Answers module and fetch requests from the parent's backends
    /// 4. Returns the execution result (or kills the child on timeout)
    pub async fn execute_in_child(
        source: &str,
        config: &SandboxConfig,
        env: SandboxEnvironment,
    ) -> Result<SerializedValue, SandboxError> {
        let worker_bin = find_worker_binary()?;
        let capabilities = config.capabilities.effective(&env);
        let worker_config = WorkerConfig::new(config, capabilities);
        let timeout = config.timeout;

        let mut child = Command::new(&worker_bin)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var("JSPLAY_DEBUG").is_ok() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!(
                    "failed to spawn worker at {}: {}",
                    worker_bin.display(),
                    e
                ))
            })?;

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on child")))?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on child")))?;
        let mut child_stdout = BufReader::new(child_stdout);

        let execute_msg = ParentMessage::Execute {
            source: source.to_string(),
            config: worker_config,
        };
        write_message(&mut child_stdin, &execute_msg)
            .await
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!("failed to send Execute: {}", e))
            })?;

        let result = tokio::time::timeout(
            timeout + CHILD_GRACE,
            ipc_event_loop(&mut child_stdin, &mut child_stdout, &env, config),
        )
        .await;

        match result {
            Ok(inner) => inner,
            Err(_elapsed) => {
                let _ = child.kill().await;
                Err(SandboxError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Read messages from the child until it reports completion, serving its
/// requests along the way.
async fn ipc_event_loop(
    child_stdin: &mut ChildStdin,
    child_stdout: &mut BufReader<ChildStdout>,
    env: &SandboxEnvironment,
    config: &SandboxConfig,
) -> Result<SerializedValue, SandboxError> {
    loop {
        let msg: Option<ChildMessage> =
            read_message_with_limit(child_stdout, config.max_ipc_message_size)
                .await
                .map_err(|e| SandboxError::Execution(anyhow::anyhow!("IPC read error: {}", e)))?;

        let reply = match msg {
            Some(ChildMessage::ExecutionComplete { result }) => {
                return rebuild_outcome(result, config);
            }
            Some(ChildMessage::Console { event }) => {
                env.console.emit(event);
                continue;
            }
            Some(ChildMessage::ModuleRequest {
                request_id,
                specifier,
                referrer,
            }) => {
                let result = match &env.modules {
                    Some(modules) => modules.resolve(&specifier, referrer.as_deref()),
                    None => Err(BridgeError::ModuleNotFound(specifier)),
                };
                ParentMessage::ModuleResult {
                    request_id,
                    result: result.map_err(|e| e.to_string()),
                }
            }
            Some(ChildMessage::FetchRequest {
                request_id,
                request,
            }) => {
                let result = match &env.http {
                    Some(http) => http.fetch(request).await.map_err(|e| e.to_string()),
                    None => Err("fetch is not available".to_string()),
                };
                ParentMessage::FetchResult { request_id, result }
            }
            Some(ChildMessage::Log { message }) => {
                tracing::info!(target: "jsplay::sandbox::worker", "{}", message);
                continue;
            }
            None => {
                return Err(SandboxError::Execution(anyhow::anyhow!(
                    "worker exited without sending result"
                )));
            }
        };

        write_message(child_stdin, &reply).await.map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!("failed to answer worker: {}", e))
        })?;
    }
}

/// Turn the child's reported outcome back into the executor's result type.
fn rebuild_outcome(
    result: ExecutionResult,
    config: &SandboxConfig,
) -> Result<SerializedValue, SandboxError> {
    match result {
        ExecutionResult::Success { value } => Ok(value),
        ExecutionResult::Failure { kind, message } => Err(match kind {
            FaultKind::Syntax => SandboxError::Syntax { message },
            FaultKind::Runtime => SandboxError::Runtime { message },
            FaultKind::ModuleNotFound => SandboxError::ModuleNotFound { message },
            FaultKind::Timeout => SandboxError::Timeout {
                timeout_ms: config.timeout.as_millis() as u64,
            },
            FaultKind::HeapLimit => SandboxError::HeapLimitExceeded,
            FaultKind::TooLarge => SandboxError::CodeTooLarge {
                max: config.max_code_size,
                actual: 0,
            },
            FaultKind::ConcurrencyLimit => SandboxError::ConcurrencyLimit { max: 1 },
            FaultKind::Internal => {
                let inner = message
                    .strip_prefix("sandbox execution failed: ")
                    .unwrap_or(&message);
                SandboxError::Execution(anyhow::anyhow!("{inner}"))
            }
        }),
    }
}

/// Find the `jsplay-worker` binary.
///
/// Search order:
/// 1. `JSPLAY_WORKER_BIN` environment variable (must be absolute path)
/// 2. Same directory as the current executable
/// 3. Its parent directory (test binaries live in `target/<profile>/deps/`)
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
                let worker = candidate.join(WORKER_BINARY);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::Execution(anyhow::anyhow!(
        "{WORKER_BINARY} binary not found. Set {WORKER_BIN_ENV} or install it alongside jsplay"
    )))
}

/// Reject world-writable worker binaries (Unix only).
fn validate_binary_permissions(_path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                _path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}
