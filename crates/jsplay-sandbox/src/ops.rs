//! deno_core op definitions for the jsplay sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; all actual functions and types are documented below.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use deno_core::{op2, v8, OpState};
use deno_error::JsErrorBox;
use jsplay_error::BridgeError;
use tokio::sync::oneshot;

use crate::bridge::{ConsoleEvent, ConsoleLevel, HttpRequest};
use crate::serialize::serialize;
use crate::value::stringify_for_console;
use crate::{ConsoleSink, HttpBridge, ModuleResolver};

/// Per-execution cap on console calls.
pub struct ConsoleBudget {
    max: usize,
    used: usize,
}

/// What to do with one console call.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleAdmission {
    /// Deliver it.
    Emit,
    /// The cap was just hit: drop it and emit the one-time warning.
    LimitReached,
    /// Drop it silently.
    Drop,
}

impl ConsoleBudget {
    /// A budget of `max` events.
    pub fn new(max: usize) -> Self {
        Self { max, used: 0 }
    }

    /// Account for one console call.
    pub fn admit(&mut self) -> ConsoleAdmission {
        let admission = if self.used < self.max {
            ConsoleAdmission::Emit
        } else if self.used == self.max {
            ConsoleAdmission::LimitReached
        } else {
            ConsoleAdmission::Drop
        };
        self.used = self.used.saturating_add(1);
        admission
    }
}

/// Cancellation handles for timers that are currently sleeping.
#[derive(Default)]
pub struct TimerTable {
    pending: HashMap<u32, oneshot::Sender<()>>,
}

impl TimerTable {
    /// Register a sleeping timer and return its cancellation signal.
    pub fn arm(&mut self, timer_id: u32) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(timer_id, tx);
        rx
    }

    /// Wake a sleeping timer early. Unknown ids are ignored.
    pub fn cancel(&mut self, timer_id: u32) {
        if let Some(tx) = self.pending.remove(&timer_id) {
            let _ = tx.send(());
        }
    }

    /// Forget a timer whose sleep has finished.
    pub fn disarm(&mut self, timer_id: u32) {
        self.pending.remove(&timer_id);
    }

    /// Number of timers currently sleeping.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no timer is sleeping.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Deliver a console call to the [`ConsoleSink`].
///
/// `args` is the JS array of arguments. Each one is serialized and rendered
/// here, on the isolate thread, so getters run before the call returns.
#[op2(fast)]
pub fn op_jsplay_console<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: Rc<RefCell<OpState>>,
    #[string] level: String,
    args: v8::Local<'s, v8::Value>,
) {
    let level = ConsoleLevel::parse(&level).unwrap_or(ConsoleLevel::Log);

    // The OpState borrow must end before serializing: getters may call back into ops.
    let (sink, admission, max) = {
        let mut st = state.borrow_mut();
        let budget = st.borrow_mut::<ConsoleBudget>();
        let admission = budget.admit();
        let max = budget.max;
        (st.borrow::<Arc<dyn ConsoleSink>>().clone(), admission, max)
    };

    match admission {
        ConsoleAdmission::Emit => {}
        ConsoleAdmission::LimitReached => {
            sink.emit(ConsoleEvent {
                level: ConsoleLevel::Warn,
                args: vec![format!(
                    "console output limit reached ({max} calls); further output dropped"
                )],
            });
            return;
        }
        ConsoleAdmission::Drop => return,
    }

    let mut rendered = Vec::new();
    match v8::Local::<v8::Array>::try_from(args) {
        Ok(array) => {
            for i in 0..array.length() {
                let item = match array.get_index(scope, i) {
                    Some(item) => item,
                    None => v8::undefined(scope).into(),
                };
                rendered.push(stringify_for_console(&serialize(scope, item)));
            }
        }
        Err(_) => rendered.push(stringify_for_console(&serialize(scope, args))),
    }

    tracing::debug!(target: "jsplay::sandbox::js", level = ?level, "{}", rendered.join(" "));
    sink.emit(ConsoleEvent {
        level,
        args: rendered,
    });
}

/// Resolve a `require` specifier through the [`ModuleResolver`].
///
/// `referrer` is the id of the requiring module, or empty for the script.
/// Returns the [`crate::bridge::ResolvedModule`] as JSON.
#[op2]
#[string]
pub fn op_jsplay_resolve_module(
    state: &mut OpState,
    #[string] specifier: String,
    #[string] referrer: String,
) -> Result<String, JsErrorBox> {
    let resolver = state
        .try_borrow::<Arc<dyn ModuleResolver>>()
        .cloned()
        .ok_or_else(|| JsErrorBox::generic(BridgeError::ModuleNotFound(specifier.clone()).to_string()))?;

    let referrer = (!referrer.is_empty()).then_some(referrer.as_str());
    tracing::debug!(specifier = %specifier, referrer = ?referrer, "require");

    let module = resolver
        .resolve(&specifier, referrer)
        .map_err(|e| JsErrorBox::generic(crate::redact::redact_error_message(&e.to_string())))?;

    serde_json::to_string(&module)
        .map_err(|e| JsErrorBox::generic(format!("module serialization failed: {e}")))
}

/// Perform a `fetch` through the [`HttpBridge`].
///
/// Takes and returns JSON: an [`HttpRequest`] in, an
/// [`crate::bridge::HttpResponse`] out.
#[op2(async)]
#[string]
pub async fn op_jsplay_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] request_json: String,
) -> Result<String, JsErrorBox> {
    let bridge = {
        let st = state.borrow();
        st.try_borrow::<Arc<dyn HttpBridge>>()
            .cloned()
            .ok_or_else(|| JsErrorBox::type_error("fetch is not available"))?
    };

    let request: HttpRequest = serde_json::from_str(&request_json)
        .map_err(|e| JsErrorBox::type_error(format!("invalid fetch request: {e}")))?;
    tracing::debug!(method = %request.method, url = %request.url, "fetch dispatched");

    let response = bridge.fetch(request).await.map_err(|e| {
        JsErrorBox::type_error(format!(
            "fetch failed: {}",
            crate::redact::redact_error_message(&e.to_string())
        ))
    })?;

    serde_json::to_string(&response)
        .map_err(|e| JsErrorBox::generic(format!("response serialization failed: {e}")))
}

/// Sleep for `millis`, or until the timer is cleared.
#[op2(async)]
pub async fn op_jsplay_sleep(
    state: Rc<RefCell<OpState>>,
    #[smi] timer_id: u32,
    #[smi] millis: u32,
) {
    let cancelled = state.borrow_mut().borrow_mut::<TimerTable>().arm(timer_id);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(u64::from(millis))) => {}
        _ = cancelled => {}
    }
    state.borrow_mut().borrow_mut::<TimerTable>().disarm(timer_id);
}

/// Wake a sleeping timer so it no longer holds the event loop open.
#[op2(fast)]
pub fn op_jsplay_clear_timer(state: &mut OpState, #[smi] timer_id: u32) {
    state.borrow_mut::<TimerTable>().cancel(timer_id);
}

deno_core::extension!(
    jsplay_ext,
    ops = [
        op_jsplay_console,
        op_jsplay_resolve_module,
        op_jsplay_fetch,
        op_jsplay_sleep,
        op_jsplay_clear_timer,
    ],
);
