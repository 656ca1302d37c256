//! JavaScript glue installed into every isolate before the user script.
//!
//! The bootstrap receives `Deno.core.ops` and the effective capabilities,
//! installs one global per enabled capability, then deletes `Deno` so the
//! user script can only reach the host through the shims.

use crate::error::SandboxError;
use crate::executor::Capabilities;

/// Script name the bootstrap runs under.
pub const BOOTSTRAP_SCRIPT_NAME: &str = "[jsplay:bootstrap]";

const BOOTSTRAP_JS: &str = r#"(ops, caps) => {
  // Captured before user code runs; CommonJS modules are compiled through it.
  const indirectEval = globalThis.eval;

  if (caps.console) {
    const emit = (level) => (...args) => {
      ops.op_jsplay_console(level, args);
    };
    globalThis.console = {
      log: emit("log"),
      info: emit("info"),
      warn: emit("warn"),
      error: emit("error"),
      debug: emit("debug"),
    };
  } else {
    delete globalThis.console;
  }

  if (caps.require) {
    const loaded = new Map();
    const dirnameOf = (filename) => {
      const cut = filename.lastIndexOf("/");
      return cut > 0 ? filename.slice(0, cut) : "/";
    };
    const makeRequire = (referrer) => (specifier) => {
      if (typeof specifier !== "string" || specifier.length === 0) {
        throw new TypeError("The \"id\" argument must be a non-empty string");
      }
      let resolved;
      try {
        resolved = JSON.parse(ops.op_jsplay_resolve_module(specifier, referrer));
      } catch (err) {
        if (err && String(err.message).startsWith("Cannot find module")) {
          err.code = "MODULE_NOT_FOUND";
        }
        throw err;
      }
      const cached = loaded.get(resolved.id);
      if (cached !== undefined) {
        return cached.exports;
      }
      const module = { id: resolved.id, filename: resolved.filename, loaded: false, exports: {} };
      loaded.set(resolved.id, module);
      try {
        if (resolved.kind === "json") {
          module.exports = JSON.parse(resolved.source);
        } else {
          const wrapper = indirectEval(
            "(function (exports, require, module, __filename, __dirname) {" +
              resolved.source +
              "\n})\n//# sourceURL=" + resolved.filename,
          );
          wrapper.call(
            module.exports,
            module.exports,
            makeRequire(resolved.id),
            module,
            resolved.filename,
            dirnameOf(resolved.filename),
          );
        }
      } catch (err) {
        loaded.delete(resolved.id);
        throw err;
      }
      module.loaded = true;
      return module.exports;
    };
    globalThis.require = makeRequire("");
  }

  if (caps.fetch) {
    const headerRecord = (headers) => {
      const out = {};
      if (headers == null) {
        return out;
      }
      const entries = Array.isArray(headers) ? headers : Object.entries(headers);
      for (const [name, value] of entries) {
        out[String(name)] = String(value);
      }
      return out;
    };
    const toResponse = (raw) => {
      const body = raw.data;
      let data = body;
      try {
        data = JSON.parse(body);
      } catch (_) {
        // not JSON; keep the text
      }
      return {
        ok: raw.status >= 200 && raw.status < 300,
        status: raw.status,
        statusText: raw.statusText,
        headers: raw.headers,
        url: raw.url,
        data,
        text: async () => body,
        json: async () => JSON.parse(body),
      };
    };
    globalThis.fetch = async (input, init = {}) => {
      const request = {
        url: String(input),
        method: String(init.method || "GET").toUpperCase(),
        headers: headerRecord(init.headers),
        body: init.body == null ? null : String(init.body),
      };
      const raw = await ops.op_jsplay_fetch(JSON.stringify(request));
      return toResponse(JSON.parse(raw));
    };
  } else {
    delete globalThis.fetch;
  }

  const timerNames = ["setTimeout", "setInterval", "clearTimeout", "clearInterval", "queueMicrotask"];
  if (caps.timers) {
    const active = new Set();
    let nextId = 1;
    const clampDelay = (delay) => {
      const ms = Math.floor(Number(delay));
      return Number.isFinite(ms) && ms > 0 ? Math.min(ms, 0x7fffffff) : 0;
    };
    const schedule = (id, callback, delay, args, repeat) => {
      ops.op_jsplay_sleep(id, delay).then(() => {
        if (!active.has(id)) {
          return;
        }
        if (!repeat) {
          active.delete(id);
        }
        if (typeof callback === "function") {
          callback(...args);
        }
        if (repeat && active.has(id)) {
          schedule(id, callback, delay, args, repeat);
        }
      });
    };
    const start = (repeat) => (callback, delay, ...args) => {
      const id = nextId++;
      active.add(id);
      schedule(id, callback, clampDelay(delay), args, repeat);
      return id;
    };
    const clear = (id) => {
      if (active.delete(id)) {
        ops.op_jsplay_clear_timer(id);
      }
    };
    globalThis.setTimeout = start(false);
    globalThis.setInterval = start(true);
    globalThis.clearTimeout = clear;
    globalThis.clearInterval = clear;
    globalThis.queueMicrotask = (callback) => {
      Promise.resolve().then(() => callback());
    };
  } else {
    for (const name of timerNames) {
      delete globalThis[name];
    }
  }

  delete globalThis.Deno;
  delete globalThis.__bootstrap;
}"#;

/// The bootstrap invocation for `caps`.
pub fn bootstrap_source(caps: &Capabilities) -> Result<String, SandboxError> {
    let caps = serde_json::to_string(caps)?;
    Ok(format!("({BOOTSTRAP_JS})(Deno.core.ops, {caps});"))
}
