//! IPC protocol between the host and the `jsplay-worker` child.
//!
//! Frames are a 4-byte big-endian length followed by a JSON payload. The
//! host sends [`ParentMessage`]s on the child's stdin and reads
//! [`ChildMessage`]s from its stdout.
//!
//! A child run is one `Execute`, any number of console events and
//! `require`/`fetch` round trips, then exactly one `ExecutionComplete`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bridge::{ConsoleEvent, HttpRequest, HttpResponse, ResolvedModule};
use crate::executor::{Capabilities, ExecutionMode, SandboxConfig};
use crate::result::ExecutionResult;

/// Default maximum IPC message size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Messages sent from the host to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// First message: run this script.
    Execute {
        /// The untrusted script.
        source: String,
        /// Limits and capabilities for the run.
        config: WorkerConfig,
    },
    /// Answer to [`ChildMessage::ModuleRequest`].
    ModuleResult {
        /// Matches the request's id.
        request_id: u64,
        /// The module, or the resolver's error message.
        result: Result<ResolvedModule, String>,
    },
    /// Answer to [`ChildMessage::FetchRequest`].
    FetchResult {
        /// Matches the request's id.
        request_id: u64,
        /// The response, or the bridge's error message.
        result: Result<HttpResponse, String>,
    },
}

/// Messages sent from the worker to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// A console call from the script.
    Console {
        /// The rendered call.
        event: ConsoleEvent,
    },
    /// `require` needs the host's resolver.
    ModuleRequest {
        /// Correlates the answer.
        request_id: u64,
        /// As passed to `require`.
        specifier: String,
        /// Id of the requiring module, if not the script.
        referrer: Option<String>,
    },
    /// `fetch` needs the host's HTTP bridge.
    FetchRequest {
        /// Correlates the answer.
        request_id: u64,
        /// The request to perform.
        request: HttpRequest,
    },
    /// The run finished.
    ExecutionComplete {
        /// The outcome, exactly as the executor would report it.
        result: ExecutionResult,
    },
    /// A diagnostic line from the worker itself.
    Log {
        /// The log message text.
        message: String,
    },
}

/// Configuration passed to the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum execution time.
    pub timeout_ms: u64,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum script size in bytes.
    pub max_code_size: usize,
    /// Console calls delivered before output is dropped.
    pub max_console_events: usize,
    /// Globals to install. Already reduced to the backends the host has.
    pub capabilities: Capabilities,
    /// Maximum IPC message size in bytes. Defaults to [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

impl WorkerConfig {
    /// The worker view of `config`, with `capabilities` already made effective.
    pub fn new(config: &SandboxConfig, capabilities: Capabilities) -> Self {
        Self {
            timeout_ms: config.timeout.as_millis() as u64,
            max_heap_size: config.max_heap_size,
            max_code_size: config.max_code_size,
            max_console_events: config.max_console_events,
            capabilities,
            max_ipc_message_size: config.max_ipc_message_size,
        }
    }

    /// Convert back to a SandboxConfig for use in the worker.
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            max_code_size: self.max_code_size,
            max_heap_size: self.max_heap_size,
            max_concurrent: 1, // worker handles one execution
            max_console_events: self.max_console_events,
            execution_mode: ExecutionMode::InProcess, // worker always runs in-process
            capabilities: self.capabilities,
            max_ipc_message_size: self.max_ipc_message_size,
        }
    }
}

fn invalid_data(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

/// Write a length-delimited JSON message to an async writer.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg).map_err(invalid_data)?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        invalid_data(format!(
            "IPC payload too large: {} bytes (max {} bytes)",
            payload.len(),
            u32::MAX
        ))
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited JSON message, limited to
/// [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message of at most `max_size` bytes.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(invalid_data(format!(
            "IPC message too large: {len} bytes (limit: {max_size} bytes)"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    serde_json::from_slice(&payload).map(Some).map_err(invalid_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ConsoleLevel, ModuleKind};
    use crate::result::FaultKind;
    use crate::value::SerializedValue;
    use std::io::Cursor;

    async fn roundtrip<T: Serialize + for<'de> Deserialize<'de>>(msg: &T) -> T {
        let mut buf = Vec::new();
        write_message(&mut buf, msg).await.unwrap();
        let mut cursor = Cursor::new(buf);
        read_message(&mut cursor).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn execute_message_carries_config() {
        let config = WorkerConfig::new(&SandboxConfig::default(), Capabilities::default());
        let msg = ParentMessage::Execute {
            source: "1 + 1".into(),
            config,
        };
        match roundtrip(&msg).await {
            ParentMessage::Execute { source, config } => {
                assert_eq!(source, "1 + 1");
                assert_eq!(config.timeout_ms, 5000);
                assert!(config.capabilities.console);
            }
            other => panic!("expected Execute, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn module_result_error_roundtrip() {
        let msg = ParentMessage::ModuleResult {
            request_id: 7,
            result: Err("Cannot find module 'nope'".into()),
        };
        match roundtrip(&msg).await {
            ParentMessage::ModuleResult { request_id, result } => {
                assert_eq!(request_id, 7);
                assert_eq!(result.unwrap_err(), "Cannot find module 'nope'");
            }
            other => panic!("expected ModuleResult, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn module_request_and_result() {
        let request = ChildMessage::ModuleRequest {
            request_id: 1,
            specifier: "./util".into(),
            referrer: Some("left-pad/index.js".into()),
        };
        assert!(matches!(
            roundtrip(&request).await,
            ChildMessage::ModuleRequest { request_id: 1, referrer: Some(_), .. }
        ));

        let answer = ParentMessage::ModuleResult {
            request_id: 1,
            result: Ok(ResolvedModule {
                id: "left-pad/util.js".into(),
                filename: "/node_modules/left-pad/util.js".into(),
                kind: ModuleKind::Js,
                source: "module.exports = 1".into(),
            }),
        };
        match roundtrip(&answer).await {
            ParentMessage::ModuleResult { result, .. } => {
                assert_eq!(result.unwrap().id, "left-pad/util.js");
            }
            other => panic!("expected ModuleResult, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_messages_in_stream() {
        let messages = vec![
            ChildMessage::Console {
                event: ConsoleEvent {
                    level: ConsoleLevel::Info,
                    args: vec!["first".into()],
                },
            },
            ChildMessage::FetchRequest {
                request_id: 2,
                request: HttpRequest {
                    url: "https://example.test/".into(),
                    method: "GET".into(),
                    headers: Default::default(),
                    body: None,
                },
            },
            ChildMessage::ExecutionComplete {
                result: ExecutionResult::Success {
                    value: SerializedValue::String("done".into()),
                },
            },
        ];

        let mut buf = Vec::new();
        for msg in &messages {
            write_message(&mut buf, msg).await.unwrap();
        }

        let mut cursor = Cursor::new(buf);
        let d1: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();
        let d2: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();
        let d3: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();

        assert!(matches!(d1, ChildMessage::Console { .. }));
        assert!(matches!(d2, ChildMessage::FetchRequest { request_id: 2, .. }));
        assert!(matches!(d3, ChildMessage::ExecutionComplete { .. }));

        // EOF after all messages
        let d4: Option<ChildMessage> = read_message(&mut cursor).await.unwrap();
        assert!(d4.is_none());
    }

    #[tokio::test]
    async fn execution_failure_keeps_its_kind() {
        let msg = ChildMessage::ExecutionComplete {
            result: ExecutionResult::Failure {
                kind: FaultKind::HeapLimit,
                message: "V8 heap limit exceeded".into(),
            },
        };
        match roundtrip(&msg).await {
            ChildMessage::ExecutionComplete { result } => {
                assert_eq!(result.fault_kind(), Some(FaultKind::HeapLimit));
            }
            other => panic!("expected ExecutionComplete, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn eof_returns_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result: Option<ParentMessage> = read_message(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_message_with_limit_rejects_oversized() {
        let msg = ChildMessage::Log {
            message: "x".repeat(1024),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let result: Result<Option<ChildMessage>, _> =
            read_message_with_limit(&mut cursor, 64).await;
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("too large"), "error: {err_msg}");
    }

    #[test]
    fn worker_config_roundtrip_from_sandbox_config() {
        let sandbox = SandboxConfig::default();
        let worker = WorkerConfig::new(&sandbox, sandbox.capabilities);
        let back = worker.to_sandbox_config();

        assert_eq!(sandbox.timeout, back.timeout);
        assert_eq!(sandbox.max_heap_size, back.max_heap_size);
        assert_eq!(sandbox.max_console_events, back.max_console_events);
        assert_eq!(back.max_concurrent, 1);
        assert_eq!(back.execution_mode, ExecutionMode::InProcess);
    }

    #[test]
    fn worker_config_ipc_limit_serde_default() {
        let json = r#"{
            "timeout_ms": 5000,
            "max_heap_size": 67108864,
            "max_code_size": 65536,
            "max_console_events": 100,
            "capabilities": {"console": true, "require": false, "fetch": false, "timers": true}
        }"#;
        let config: WorkerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_ipc_message_size, DEFAULT_MAX_IPC_MESSAGE_SIZE);
    }
}
