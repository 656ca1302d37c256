//! Sandbox executor: creates fresh V8 isolates and runs playground scripts.
//!
//! Each execution gets a brand new runtime. No state leaks between calls.
//!
//! V8 isolates are `!Send`, so all JsRuntime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::bootstrap::{bootstrap_source, BOOTSTRAP_SCRIPT_NAME};
use crate::bridge::SandboxEnvironment;
use crate::error::SandboxError;
use crate::ops::{jsplay_ext, ConsoleBudget, TimerTable};
use crate::redact::fault_summary;
use crate::result::ExecutionResult;
use crate::serialize::{describe_exception, serialize};
use crate::validator::validate_code;
use crate::value::SerializedValue;

/// Script name user code runs under; it shows up in engine stack frames.
pub const SCRIPT_NAME: &str = "[jsplay:script]";

/// How the sandbox executes code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run V8 in-process on a dedicated thread (default, suitable for tests).
    #[default]
    InProcess,
    /// Spawn an isolated child process per execution.
    ChildProcess,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_process" => Ok(Self::InProcess),
            "child_process" => Ok(Self::ChildProcess),
            other => Err(format!(
                "unsupported execution mode '{other}', supported: in_process, child_process"
            )),
        }
    }
}

/// Globals a script may be given beyond the language built-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `console.*`
    pub console: bool,
    /// `require`, backed by a [`crate::ModuleResolver`].
    pub require: bool,
    /// `fetch`, backed by a [`crate::HttpBridge`].
    pub fetch: bool,
    /// `setTimeout` and friends.
    pub timers: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            console: true,
            require: true,
            fetch: false,
            timers: true,
        }
    }
}

impl Capabilities {
    /// The capabilities actually installed for `env`: `require` and `fetch`
    /// also need a backend.
    pub fn effective(&self, env: &SandboxEnvironment) -> Self {
        Self {
            console: self.console,
            require: self.require && env.modules.is_some(),
            fetch: self.fetch && env.http.is_some(),
            timers: self.timers,
        }
    }
}

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum execution time before the sandbox is terminated.
    pub timeout: Duration,
    /// Maximum script size in bytes.
    pub max_code_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent sandbox executions.
    pub max_concurrent: usize,
    /// Console calls delivered per execution before output is dropped.
    pub max_console_events: usize,
    /// Execution mode: in-process or child-process isolation.
    pub execution_mode: ExecutionMode,
    /// Which globals scripts get.
    pub capabilities: Capabilities,
    /// Maximum IPC message size in bytes.
    pub max_ipc_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_code_size: crate::validator::DEFAULT_MAX_CODE_SIZE,
            max_heap_size: 128 * 1024 * 1024, // 128 MB
            max_concurrent: 8,
            max_console_events: 10_000,
            execution_mode: ExecutionMode::default(),
            capabilities: Capabilities::default(),
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

/// The sandbox executor. Creates fresh V8 isolates for each execution.
///
/// This is `Send + Sync` safe: all V8 operations are dispatched to a
/// dedicated thread internally. A concurrency semaphore limits the number
/// of simultaneous V8 isolates.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::SandboxMetrics>>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record every execution into `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The configuration this executor runs with.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `source` and fold any failure into the result.
    ///
    /// Console output is delivered to `env.console` while the script runs,
    /// so every event for this execution has been emitted by the time this
    /// resolves.
    pub async fn execute(&self, source: &str, env: SandboxEnvironment) -> ExecutionResult {
        let started = Instant::now();
        let result = self.try_execute(source, env).await;
        let elapsed = started.elapsed();

        let outcome = match &result {
            Ok(value) => {
                tracing::info!(
                    value_type = value.tag(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "execute: complete"
                );
                "success"
            }
            Err(e) => {
                tracing::warn!(
                    kind = e.kind().as_str(),
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "execute: failed"
                );
                e.kind().as_str()
            }
        };

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(outcome, elapsed);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = outcome;

        result.into()
    }

    /// Run `source`, returning the completion value or the fault.
    ///
    /// In `ChildProcess` mode, spawns an isolated worker process. In
    /// `InProcess` mode (default), runs V8 on a dedicated thread in the
    /// current process.
    pub async fn try_execute(
        &self,
        source: &str,
        env: SandboxEnvironment,
    ) -> Result<SerializedValue, SandboxError> {
        tracing::info!(
            code_len = source.len(),
            source_sha256 = %source_fingerprint(source),
            mode = ?self.config.execution_mode,
            "execute: starting"
        );

        validate_code(source, Some(self.config.max_code_size))?;

        let _permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        match self.config.execution_mode {
            ExecutionMode::ChildProcess => {
                crate::host::SandboxHost::execute_in_child(source, &self.config, env).await
            }
            ExecutionMode::InProcess => self.execute_in_process(source, env).await,
        }
    }

    /// In-process execution: spawn a dedicated thread with its own V8 isolate.
    async fn execute_in_process(
        &self,
        source: &str,
        env: SandboxEnvironment,
    ) -> Result<SerializedValue, SandboxError> {
        let source = source.to_string();
        let config = self.config.clone();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                        tracing::warn!("sandbox result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_script(&config, &source, env));
            if tx.send(result).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        });

        rx.await
            .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")))?
    }
}

/// Short sha256 of the script, logged instead of the source itself.
fn source_fingerprint(source: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(source.as_bytes()));
    digest[..16].to_string()
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Whether the heap limit has been triggered. Uses AtomicBool so the callback
    /// can use a shared `&` reference instead of `&mut`.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed `HeapLimitState` owned by
    // `run_user_script`, which unregisters this callback before the box is
    // dropped. `triggered` is atomic, so a shared reference is enough even
    // if V8 calls back re-entrantly.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Run a script on the current thread (must be called from a dedicated
/// thread, not the main tokio runtime).
///
/// Public for reuse in the worker binary.
pub async fn run_script(
    config: &SandboxConfig,
    source: &str,
    env: SandboxEnvironment,
) -> Result<SerializedValue, SandboxError> {
    let caps = config.capabilities.effective(&env);
    let mut runtime = create_runtime(config, env);

    runtime
        .execute_script(BOOTSTRAP_SCRIPT_NAME, bootstrap_source(&caps)?)
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;

    run_user_script(&mut runtime, source, config).await
}

/// Create a fresh JsRuntime with the jsplay extension loaded and V8 heap
/// limits set, and hand the environment's backends to the ops.
fn create_runtime(config: &SandboxConfig, env: SandboxEnvironment) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![jsplay_ext::init_ops()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(env.console);
        state.put(ConsoleBudget::new(config.max_console_events));
        state.put(TimerTable::default());
        if let Some(modules) = env.modules {
            state.put(modules);
        }
        if let Some(http) = env.http {
            state.put(http);
        }
    }

    runtime
}

/// Run the user's script, drive the event loop to idle, and read the
/// completion value.
///
/// Sets up a CPU watchdog thread and near-heap-limit callback first. The
/// watchdog terminates V8 execution when the timeout elapses (handles
/// CPU-bound loops); the heap callback terminates execution before V8
/// would abort the process.
async fn run_user_script(
    runtime: &mut JsRuntime,
    source: &str,
    config: &SandboxConfig,
) -> Result<SerializedValue, SandboxError> {
    check_syntax(runtime, source)?;

    // --- Set up heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // --- Set up CPU watchdog ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = config.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    // --- Execute the script, then drain timers and pending ops ---
    let mut event_loop_expired = false;
    let outcome = match runtime.execute_script(SCRIPT_NAME, source.to_string()) {
        Ok(completion) => match tokio::time::timeout(
            config.timeout,
            runtime.run_event_loop(PollEventLoopOptions::default()),
        )
        .await
        {
            Ok(Ok(())) => Ok(completion),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => {
                event_loop_expired = true;
                Err("event loop did not go idle before the deadline".to_string())
            }
        },
        Err(e) => Err(e.to_string()),
    };

    // Getters run during serialization, so it happens under the watchdog.
    let settled = outcome.map(|completion| settle(runtime, completion));

    // --- Cleanup: cancel watchdog and wait for it to exit ---
    // The watchdog must be done before the runtime is dropped, or its
    // IsolateHandle would outlive the isolate.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);

    // --- Check error causes in priority order ---
    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(SandboxError::HeapLimitExceeded);
    }

    if timed_out.load(Ordering::SeqCst) || event_loop_expired {
        return Err(SandboxError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        });
    }

    match settled {
        Ok(result) => result,
        Err(raw) => Err(SandboxError::from_script_fault(&raw)),
    }
}

/// Compile the source without running it. Only a failure here is a
/// [`SandboxError::Syntax`]; a `SyntaxError` thrown while running (from
/// `JSON.parse`, `eval`, `new RegExp`) is a runtime fault.
fn check_syntax(runtime: &mut JsRuntime, source: &str) -> Result<(), SandboxError> {
    let scope = &mut runtime.handle_scope();
    let code = v8::String::new(scope, source).ok_or_else(|| {
        SandboxError::Execution(anyhow::anyhow!("source could not be copied into V8"))
    })?;
    let tc = &mut v8::TryCatch::new(scope);
    if v8::Script::compile(tc, code, None).is_some() {
        return Ok(());
    }
    let raw = match tc.exception() {
        Some(exception) => exception
            .to_string(tc)
            .map(|text| text.to_rust_string_lossy(tc))
            .unwrap_or_else(|| "SyntaxError".to_string()),
        None => "SyntaxError".to_string(),
    };
    Err(SandboxError::Syntax {
        message: fault_summary(&raw),
    })
}

/// Unwrap a completion value: a settled promise yields its result, a
/// rejected one fails, a pending one yields `undefined`.
fn settle(
    runtime: &mut JsRuntime,
    completion: v8::Global<v8::Value>,
) -> Result<SerializedValue, SandboxError> {
    let scope = &mut runtime.handle_scope();
    let value = v8::Local::new(scope, completion);

    let value = match v8::Local::<v8::Promise>::try_from(value) {
        Ok(promise) => match promise.state() {
            v8::PromiseState::Fulfilled => promise.result(scope),
            v8::PromiseState::Rejected => {
                let reason = promise.result(scope);
                let described = describe_exception(scope, reason);
                return Err(SandboxError::from_script_fault(&described));
            }
            v8::PromiseState::Pending => v8::undefined(scope).into(),
        },
        Err(_) => value,
    };

    Ok(serialize(scope, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ChannelConsoleSink, ConsoleEvent, ConsoleLevel, NullConsoleSink};
    use crate::result::FaultKind;
    use serde_json::json;

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(SandboxConfig::default())
    }

    fn quiet() -> SandboxEnvironment {
        SandboxEnvironment::new(Arc::new(NullConsoleSink))
    }

    async fn run(code: &str) -> ExecutionResult {
        executor().execute(code, quiet()).await
    }

    async fn run_plain(code: &str) -> serde_json::Value {
        let result = run(code).await;
        match result.value() {
            Some(value) => value.to_plain_json(),
            None => panic!("expected success for {code:?}, got {result:?}"),
        }
    }

    async fn run_with_console(code: &str) -> (ExecutionResult, Vec<ConsoleEvent>) {
        let (sink, mut rx) = ChannelConsoleSink::channel();
        let result = executor()
            .execute(code, SandboxEnvironment::new(Arc::new(sink)))
            .await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn arithmetic_completion_value() {
        let result = run("1 + 1").await;
        assert_eq!(result.value(), Some(&SerializedValue::Number(2.0)));
    }

    #[tokio::test]
    async fn empty_source_is_undefined() {
        let result = run("").await;
        assert_eq!(result.value(), Some(&SerializedValue::Undefined));
    }

    #[tokio::test]
    async fn object_completion_value() {
        let value = run_plain("({ a: [1, 'two', null], b: { c: true } })").await;
        assert_eq!(value, json!({"a": [1, "two", null], "b": {"c": true}}));
    }

    #[tokio::test]
    async fn console_log_is_captured_in_order() {
        let (result, events) = run_with_console("console.log('hi'); console.warn('careful', 2); 7").await;
        assert_eq!(result.value(), Some(&SerializedValue::Number(7.0)));
        assert_eq!(
            events,
            vec![
                ConsoleEvent {
                    level: ConsoleLevel::Log,
                    args: vec!["hi".into()],
                },
                ConsoleEvent {
                    level: ConsoleLevel::Warn,
                    args: vec!["careful".into(), "2".into()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn console_renders_objects_as_pretty_json() {
        let (_, events) = run_with_console("console.log({ a: 1 })").await;
        assert_eq!(events[0].args, vec!["{\n  \"a\": 1\n}".to_string()]);
    }

    #[tokio::test]
    async fn console_objects_skip_members_json_would_drop() {
        let (_, events) =
            run_with_console("console.log({ a: undefined, f() {}, b: 1, e: new Error('x') })").await;
        assert_eq!(
            events[0].args,
            vec!["{\n  \"b\": 1,\n  \"e\": {}\n}".to_string()]
        );
    }

    #[tokio::test]
    async fn thrown_error_is_a_runtime_failure() {
        let result = run("throw new Error('boom')").await;
        assert_eq!(result.fault_kind(), Some(FaultKind::Runtime));
        assert_eq!(result.message(), Some("Error: boom"));
    }

    #[tokio::test]
    async fn reference_error_message() {
        let result = run("undefinedVariable").await;
        assert_eq!(result.fault_kind(), Some(FaultKind::Runtime));
        let message = result.message().unwrap();
        assert!(message.starts_with("ReferenceError"), "{message}");
        assert!(!message.contains("    at "), "stack leaked: {message}");
    }

    #[tokio::test]
    async fn syntax_errors_are_classified() {
        let result = run("const = ;").await;
        assert_eq!(result.fault_kind(), Some(FaultKind::Syntax));
        assert!(result.message().unwrap().starts_with("SyntaxError"));
    }

    #[tokio::test]
    async fn syntax_errors_thrown_while_running_are_runtime_faults() {
        for code in ["JSON.parse('{')", "new RegExp('(')", "eval('(')", "new Function('(')"] {
            let result = run(code).await;
            assert_eq!(result.fault_kind(), Some(FaultKind::Runtime), "{code}: {result:?}");
            let message = result.message().unwrap();
            assert!(message.starts_with("SyntaxError"), "{code}: {message}");
        }
    }

    #[tokio::test]
    async fn es_module_syntax_is_rejected_before_running() {
        let result = run("import _ from 'lodash'").await;
        assert_eq!(result.fault_kind(), Some(FaultKind::Syntax));
        assert!(result.message().unwrap().contains("require()"));
    }

    #[tokio::test]
    async fn promise_completion_is_awaited() {
        let result = run("Promise.resolve(41).then(n => n + 1)").await;
        assert_eq!(result.value(), Some(&SerializedValue::Number(42.0)));
    }

    #[tokio::test]
    async fn rejected_promise_fails() {
        let result = run("Promise.reject(new TypeError('nope'))").await;
        assert_eq!(result.fault_kind(), Some(FaultKind::Runtime));
        assert_eq!(result.message(), Some("TypeError: nope"));
    }

    #[tokio::test]
    async fn forever_pending_promise_is_undefined() {
        let result = run("new Promise(() => {})").await;
        assert_eq!(result.value(), Some(&SerializedValue::Undefined));
    }

    #[tokio::test]
    async fn timers_fire_before_the_result() {
        let (result, events) = run_with_console(
            "setTimeout(() => console.log('later'), 20); console.log('now'); 'done'",
        )
        .await;
        assert_eq!(result.value(), Some(&SerializedValue::String("done".into())));
        let lines: Vec<_> = events.iter().map(|e| e.args[0].as_str()).collect();
        assert_eq!(lines, vec!["now", "later"]);
    }

    #[tokio::test]
    async fn cleared_timers_do_not_fire_or_hold_the_loop() {
        let exec = SandboxExecutor::new(SandboxConfig {
            timeout: Duration::from_millis(1000),
            ..Default::default()
        });
        let (sink, mut rx) = ChannelConsoleSink::channel();
        let started = Instant::now();
        let result = exec
            .execute(
                "const t = setTimeout(() => console.log('fired'), 60000); clearTimeout(t); 1",
                SandboxEnvironment::new(Arc::new(sink)),
            )
            .await;
        assert!(result.is_success(), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn interval_runs_until_cleared() {
        let code = r#"
            let n = 0;
            const id = setInterval(() => { n += 1; console.log(n); if (n === 3) clearInterval(id); }, 5);
            n
        "#;
        let (result, events) = run_with_console(code).await;
        assert_eq!(result.value(), Some(&SerializedValue::Number(0.0)));
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn queue_microtask_runs() {
        let (_, events) = run_with_console("queueMicrotask(() => console.log('micro')); 0").await;
        assert_eq!(events[0].args, vec!["micro".to_string()]);
    }

    #[tokio::test]
    async fn cpu_bound_infinite_loop_is_terminated() {
        let exec = SandboxExecutor::new(SandboxConfig {
            timeout: Duration::from_millis(500),
            ..Default::default()
        });

        let start = Instant::now();
        let result = exec.execute("while (true) {}", quiet()).await;
        let elapsed = start.elapsed();

        assert_eq!(result.fault_kind(), Some(FaultKind::Timeout), "{result:?}");
        assert_eq!(result.message(), Some("execution timed out after 500ms"));
        assert!(
            elapsed < Duration::from_secs(5),
            "should complete reasonably fast, took: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn long_timer_hits_the_deadline() {
        let exec = SandboxExecutor::new(SandboxConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        });
        let result = exec.execute("setTimeout(() => {}, 10000); 1", quiet()).await;
        assert_eq!(result.fault_kind(), Some(FaultKind::Timeout));
    }

    #[tokio::test]
    async fn no_console_events_after_timeout() {
        let exec = SandboxExecutor::new(SandboxConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        });
        let (sink, mut rx) = ChannelConsoleSink::channel();
        let result = exec
            .execute(
                "console.log('before'); setTimeout(() => console.log('after'), 5000); 1",
                SandboxEnvironment::new(Arc::new(sink)),
            )
            .await;
        assert_eq!(result.fault_kind(), Some(FaultKind::Timeout));
        assert_eq!(rx.try_recv().unwrap().args, vec!["before".to_string()]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn heap_limit_prevents_oom() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_heap_size: 10 * 1024 * 1024,  // 10 MB
            timeout: Duration::from_secs(30), // Long timeout so heap fills first
            ..Default::default()
        });

        let code = r#"
            const arr = [];
            while (true) {
                arr.push(new Array(100000).fill("x"));
            }
        "#;

        let result = exec.execute(code, quiet()).await;
        assert!(
            matches!(
                result.fault_kind(),
                Some(FaultKind::HeapLimit | FaultKind::Runtime)
            ),
            "expected heap limit or JS error, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn concurrency_limit_enforced() {
        // Use max_concurrent=0 so no executions are allowed (deterministic test)
        let exec = SandboxExecutor::new(SandboxConfig {
            max_concurrent: 0,
            ..Default::default()
        });

        let err = exec.try_execute("1", quiet()).await.unwrap_err();
        assert!(
            matches!(err, SandboxError::ConcurrencyLimit { max: 0 }),
            "expected concurrency limit, got: {err:?}"
        );
    }

    #[tokio::test]
    async fn oversized_code_is_rejected() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_code_size: 16,
            ..Default::default()
        });
        let result = exec.execute("const x = 'this is too long';", quiet()).await;
        assert_eq!(result.fault_kind(), Some(FaultKind::TooLarge));
    }

    #[tokio::test]
    async fn deno_global_is_not_accessible() {
        let value = run_plain("typeof Deno").await;
        assert_eq!(value, "undefined");
    }

    #[tokio::test]
    async fn no_state_survives_between_runs() {
        let exec = executor();
        let first = exec.execute("globalThis.leak = 42; leak", quiet()).await;
        assert!(first.is_success());
        let second = exec.execute("typeof leak", quiet()).await;
        assert_eq!(second.value(), Some(&SerializedValue::String("undefined".into())));
    }

    #[tokio::test]
    async fn require_absent_without_resolver() {
        let value = run_plain("typeof require").await;
        assert_eq!(value, "undefined");
    }

    #[tokio::test]
    async fn fetch_absent_by_default() {
        let value = run_plain("typeof fetch").await;
        assert_eq!(value, "undefined");
    }

    #[tokio::test]
    async fn disabled_capabilities_are_not_installed() {
        let exec = SandboxExecutor::new(SandboxConfig {
            capabilities: Capabilities {
                console: false,
                require: false,
                fetch: false,
                timers: false,
            },
            ..Default::default()
        });
        let result = exec
            .execute("[typeof console, typeof setTimeout].join(',')", quiet())
            .await;
        assert_eq!(
            result.value(),
            Some(&SerializedValue::String("undefined,undefined".into()))
        );
    }

    #[tokio::test]
    async fn console_budget_caps_output() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_console_events: 3,
            ..Default::default()
        });
        let (sink, mut rx) = ChannelConsoleSink::channel();
        let result = exec
            .execute(
                "for (let i = 0; i < 10; i++) console.log(i); 'ok'",
                SandboxEnvironment::new(Arc::new(sink)),
            )
            .await;
        assert!(result.is_success());
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].level, ConsoleLevel::Warn);
        assert!(events[3].args[0].contains("limit"));
    }

    #[test]
    fn execution_mode_parses_config_names() {
        assert_eq!("in_process".parse(), Ok(ExecutionMode::InProcess));
        assert_eq!("child_process".parse(), Ok(ExecutionMode::ChildProcess));
        assert!("wasm".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn effective_capabilities_need_backends() {
        let caps = Capabilities {
            console: true,
            require: true,
            fetch: true,
            timers: true,
        };
        let effective = caps.effective(&quiet());
        assert!(!effective.require);
        assert!(!effective.fetch);
        assert!(effective.console && effective.timers);
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let a = source_fingerprint("1 + 1");
        assert_eq!(a.len(), 16);
        assert_eq!(a, source_fingerprint("1 + 1"));
        assert_ne!(a, source_fingerprint("1 + 2"));
    }
}
