//! Guest prelude: the script that turns a fresh deno_core realm into the
//! bot's allow-list realm.
//!
//! The prelude runs before the bot source. It captures the bridge ops,
//! deletes every global that is not an ECMAScript intrinsic, disables the
//! code-generating constructors, installs the capability globals, and
//! evaluates to the dispatch function the supervisor calls on every
//! re-entry as `dispatch(kind, id, data, code)`.

use deno_core::v8;
use deno_core::JsRuntime;

use crate::SandboxError;

/// Script name used in stack traces.
pub const PRELUDE_NAME: &str = "[arena:prelude]";

/// Globals that survive the sweep. Anything else on the global object is
/// deleted before the bot runs.
pub const ALLOWED_GLOBALS: &[&str] = &[
    "globalThis",
    "Infinity",
    "NaN",
    "undefined",
    "Object",
    "Array",
    "Number",
    "Boolean",
    "String",
    "Symbol",
    "BigInt",
    "Date",
    "Promise",
    "RegExp",
    "Math",
    "JSON",
    "Intl",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    "WeakRef",
    "FinalizationRegistry",
    "Proxy",
    "Error",
    "AggregateError",
    "EvalError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "TypeError",
    "URIError",
    "ArrayBuffer",
    "DataView",
    "Int8Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "Int16Array",
    "Uint16Array",
    "Int32Array",
    "Uint32Array",
    "Float32Array",
    "Float64Array",
    "BigInt64Array",
    "BigUint64Array",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "encodeURI",
    "encodeURIComponent",
    "decodeURI",
    "decodeURIComponent",
];

const PRELUDE_BODY: &str = r#"
((core, allowed) => {
  "use strict";
  const ops = core.ops;
  const hostLog = ops.op_arena_log;
  const socketOpen = ops.op_arena_socket_open;
  const socketSend = ops.op_arena_socket_send;
  const socketClose = ops.op_arena_socket_close;
  const timerStart = ops.op_arena_timer_start;
  const timerRepeat = ops.op_arena_timer_repeat;
  const timerCancel = ops.op_arena_timer_cancel;
  const reportRejection = ops.op_arena_report_rejection;
  const identity = JSON.parse(ops.op_arena_identity());

  const { defineProperty, freeze, getOwnPropertyNames } = Object;
  const { ownKeys, deleteProperty } = Reflect;
  const stringify = JSON.stringify;
  const StringCtor = String;
  const ErrorCtor = Error;
  const FunctionCtor = Function;

  const describe = (value) => {
    try {
      if (typeof value === "string") return value;
      if (value instanceof ErrorCtor) return StringCtor(value.stack || value);
      const json = stringify(value);
      return json === undefined ? StringCtor(value) : json;
    } catch (_) {
      try {
        return StringCtor(value);
      } catch (_) {
        return "[unprintable]";
      }
    }
  };
  const render = (args) => args.map(describe).join(" ");

  // Promises returned by handlers are watched so rejections surface as
  // recoverable errors instead of vanishing.
  const settle = (result) => {
    if (result !== null && (typeof result === "object" || typeof result === "function")) {
      try {
        if (typeof result.then === "function") {
          result.then(undefined, (reason) => reportRejection(describe(reason)));
        }
      } catch (_) {}
    }
  };

  if (typeof core.setUnhandledPromiseRejectionHandler === "function") {
    core.setUnhandledPromiseRejectionHandler((_promise, reason) => {
      reportRejection(describe(reason));
      return true;
    });
  }

  const CONNECTING = 0;
  const OPEN = 1;
  const CLOSING = 2;
  const CLOSED = 3;
  const sockets = new Map();

  const connect = (url) => {
    const target = StringCtor(url === undefined ? identity.endpoint : url);
    const handle = socketOpen(target);
    if (handle < 0) return handle;
    const listeners = new Map([["open", []], ["message", []], ["error", []], ["close", []]]);
    const socket = {
      url: target,
      readyState: CONNECTING,
      onopen: null,
      onmessage: null,
      onerror: null,
      onclose: null,
      on(event, fn) {
        const list = listeners.get(event);
        if (list !== undefined && typeof fn === "function") list.push(fn);
        return socket;
      },
      send(data) {
        socketSend(handle, typeof data === "string" ? data : describe(data));
      },
      close() {
        if (socket.readyState < CLOSING) {
          socket.readyState = CLOSING;
          socketClose(handle);
        }
      },
    };
    sockets.set(handle, { socket, listeners });
    return socket;
  };

  const emit = (entry, event, args) => {
    const handler = entry.socket["on" + event];
    if (typeof handler === "function") settle(handler.apply(entry.socket, args));
    for (const fn of entry.listeners.get(event)) settle(fn.apply(entry.socket, args));
  };

  const timers = new Map();
  let nextTimerId = 1;
  const schedule = (start, repeat, fn, delay, args) => {
    const id = nextTimerId++;
    if (typeof fn !== "function") return id;
    if (start(id, Number(delay) || 0)) timers.set(id, { fn, args, repeat });
    return id;
  };
  const clear = (id) => {
    const key = Number(id);
    if (timers.delete(key)) timerCancel(key);
  };

  const dispatch = (kind, id, data, code) => {
    if (kind === "timer") {
      const timer = timers.get(id);
      if (timer === undefined) return;
      if (!timer.repeat) timers.delete(id);
      settle(timer.fn.apply(undefined, timer.args));
      return;
    }
    const entry = sockets.get(id);
    if (entry === undefined) return;
    switch (kind) {
      case "open":
        if (entry.socket.readyState !== CONNECTING) break;
        entry.socket.readyState = OPEN;
        emit(entry, "open", []);
        break;
      case "message":
        emit(entry, "message", [data]);
        break;
      case "error":
        emit(entry, "error", [new ErrorCtor(data)]);
        break;
      case "close":
        entry.socket.readyState = CLOSED;
        sockets.delete(id);
        emit(entry, "close", [code, data]);
        break;
    }
  };

  for (const key of ownKeys(globalThis)) {
    if (typeof key !== "string" || !allowed.includes(key)) {
      deleteProperty(globalThis, key);
    }
  }

  const AsyncFunction = (async function () {}).constructor;
  const GeneratorFunction = (function* () {}).constructor;
  const AsyncGeneratorFunction = (async function* () {}).constructor;
  for (const ctor of [FunctionCtor, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {
    defineProperty(ctor.prototype, "constructor", {
      value: undefined,
      configurable: false,
      writable: false,
    });
  }

  const capabilities = {
    console: freeze({
      log: (...args) => hostLog("info", render(args)),
      info: (...args) => hostLog("info", render(args)),
      debug: (...args) => hostLog("debug", render(args)),
      warn: (...args) => hostLog("warn", render(args)),
      error: (...args) => hostLog("error", render(args)),
    }),
    setTimeout: (fn, delay, ...args) => schedule(timerStart, false, fn, delay, args),
    setInterval: (fn, delay, ...args) => schedule(timerRepeat, true, fn, delay, args),
    clearTimeout: clear,
    clearInterval: clear,
    connect,
    SOCKET_DENIED: -1,
    SOCKET_LIMIT: -2,
    bot: freeze({ id: identity.id, endpoint: identity.endpoint }),
  };
  for (const name of getOwnPropertyNames(capabilities)) {
    defineProperty(globalThis, name, {
      value: capabilities[name],
      writable: false,
      enumerable: false,
      configurable: false,
    });
  }

  return dispatch;
})"#;

/// Full prelude source with the allow-list baked in.
pub fn prelude_source() -> String {
    let allowed = serde_json::to_string(ALLOWED_GLOBALS).unwrap_or_else(|_| "[]".to_string());
    format!("{PRELUDE_BODY}(Deno.core, {allowed});")
}

/// Run the prelude in `runtime` and return the dispatch function.
pub fn install(runtime: &mut JsRuntime) -> Result<v8::Global<v8::Function>, SandboxError> {
    let value = runtime
        .execute_script(PRELUDE_NAME, prelude_source())
        .map_err(|e| SandboxError::SetupFailed {
            message: format!("prelude failed: {e}"),
        })?;

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, value);
    let func = v8::Local::<v8::Function>::try_from(local).map_err(|_| {
        SandboxError::SetupFailed {
            message: "prelude did not evaluate to a function".into(),
        }
    })?;
    Ok(v8::Global::new(scope, func))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_excludes_host_and_codegen_globals() {
        for name in [
            "Deno",
            "eval",
            "Function",
            "WebAssembly",
            "SharedArrayBuffer",
            "Atomics",
            "Reflect",
            "queueMicrotask",
        ] {
            assert!(
                !ALLOWED_GLOBALS.contains(&name),
                "{name} must not survive the sweep"
            );
        }
    }

    #[test]
    fn source_ends_with_invocation() {
        let source = prelude_source();
        assert!(source.trim_end().ends_with(");"));
        assert!(source.contains("\"decodeURIComponent\""));
    }
}
