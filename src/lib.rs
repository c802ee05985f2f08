//! concord — a peer-to-peer messaging runtime for interactive music and
//! media applications (hierarchical addressing, discovery, clock sync, and
//! an OSC gateway over a single-threaded cooperative poll loop).
//!
//! The [`runtime`] module holds the real implementation as an ordinary,
//! directly-constructible [`runtime::Runtime`] type. This module additionally
//! exposes the flat, C-style API surface spec'd for embedding hosts (design
//! note §9: "a process-wide singleton behind a thin C ABI, with the Rust
//! implementation sitting underneath it"): one `thread_local!` slot holding
//! at most one live `Runtime`, and free functions that report success or
//! failure as a [`ReturnCode`] instead of propagating a typed error. Callers
//! who embed this crate directly from Rust can skip all of that and hold a
//! `runtime::Runtime` themselves.

pub mod clock_sync;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod logger;
pub mod message;
pub mod osc_gateway;
pub mod peer;
pub mod runtime;
pub mod scheduler;
pub mod trie;

use std::cell::RefCell;

use crate::log_warn;

pub use config::RuntimeConfig;
pub use error::{ReturnCode, RuntimeError, RuntimeResult};
pub use message::{Arg, Message, Timestamp};
pub use runtime::{Runtime, SchedulerKind};
pub use trie::Cookie;

thread_local! {
    /// The process-wide runtime slot (spec §9 "Global singleton"). A
    /// `thread_local!` rather than a true process-global: the runtime's
    /// internals (`Rc`-based tries, non-blocking `TcpStream`s) are not
    /// `Send`, and the cooperative model (spec §5) never hands them to a
    /// second thread anyway.
    static RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

fn with_runtime<T>(f: impl FnOnce(&mut Runtime) -> RuntimeResult<T>) -> RuntimeResult<T> {
    RUNTIME.with(|cell| match cell.borrow_mut().as_mut() {
        Some(rt) => f(rt),
        None => Err(RuntimeError::State("not initialized".into())),
    })
}

fn to_code<T>(result: RuntimeResult<T>) -> ReturnCode {
    match result {
        Ok(_) => ReturnCode::Success,
        Err(e) => {
            log_warn!("{e}");
            ReturnCode::from(&e)
        }
    }
}

/// `initialize(config)` (spec §6). Fails with [`ReturnCode::AlreadyRunning`]
/// if a runtime is already live on this thread, and with
/// [`ReturnCode::BadName`] for an empty application name.
pub fn initialize(config: RuntimeConfig) -> ReturnCode {
    RUNTIME.with(|cell| {
        if cell.borrow().is_some() {
            return to_code::<()>(Err(RuntimeError::State("already running".into())));
        }
        match Runtime::new(config) {
            Ok(rt) => {
                *cell.borrow_mut() = Some(rt);
                ReturnCode::Success
            }
            Err(e) => to_code::<()>(Err(e)),
        }
    })
}

/// `finish()` (spec §6): tears down the singleton. Idempotent — finishing an
/// uninitialized runtime is a no-op success, not an error, matching the
/// "teardown never panics or double-frees" decision (see `DESIGN.md`).
pub fn finish() {
    RUNTIME.with(|cell| *cell.borrow_mut() = None);
}

/// `memory(malloc_fn, free_fn)` (spec §6). Must be called before
/// [`initialize`]; this crate stores but never calls the hooks.
pub fn memory(_malloc: runtime::MallocFn, _free: runtime::FreeFn) -> ReturnCode {
    RUNTIME.with(|cell| {
        if cell.borrow().is_some() {
            return to_code::<()>(Err(RuntimeError::State("already running".into())));
        }
        ReturnCode::Success
    })
}

pub fn add_service(name: &str) -> ReturnCode {
    to_code(with_runtime(|rt| rt.add_service(name)))
}

pub fn add_method(
    path: &str,
    type_descriptor: Option<String>,
    coerce: bool,
    parse: bool,
    cookie: Cookie,
    callback: Box<dyn FnMut(&Message, &Cookie)>,
) -> ReturnCode {
    to_code(with_runtime(|rt| rt.add_method(path, type_descriptor, coerce, parse, cookie, callback)))
}

pub fn status(service: &str) -> directory::ServiceStatus {
    RUNTIME
        .with(|cell| cell.borrow().as_ref().map(|rt| rt.status(service)))
        .unwrap_or(directory::ServiceStatus::Fail)
}

pub fn send(address: &str, time: Timestamp, args: Vec<Arg>, reliable: bool) -> ReturnCode {
    to_code(with_runtime(|rt| rt.send(address, time, args, reliable)))
}

/// `send_message(msg, reliable?)`: lower-level entry point for a caller that
/// already built its own [`Message`] (e.g. via `start_send`/`finish_send`).
pub fn send_message(message: Message, reliable: bool) -> ReturnCode {
    to_code(with_runtime(|rt| rt.send_message(message, reliable)))
}

/// `start_send(address)`: begins an incrementally-built message (spec §6,
/// mirrored here as a `MessageBuilder` handed back to the caller instead of
/// opaque builder-handle bookkeeping). Pair with `finish_send`.
pub fn start_send() -> message::MessageBuilder {
    message::MessageBuilder::new()
}

/// `finish_send(builder, time, address, reliable?)`: seals and sends a
/// message built with [`start_send`].
pub fn finish_send(
    builder: message::MessageBuilder,
    time: Timestamp,
    address: &str,
    reliable: bool,
) -> ReturnCode {
    match builder.seal(time, address) {
        Ok(message) => send_message(message, reliable),
        Err(e) => to_code::<()>(Err(e)),
    }
}

pub fn schedule(which: SchedulerKind, message: Message) -> ReturnCode {
    to_code(with_runtime(|rt| rt.schedule(which, message)))
}

pub fn set_clock(gettime: Option<Box<dyn FnMut() -> Timestamp>>, cookie: Option<Cookie>) -> ReturnCode {
    to_code(with_runtime(|rt| {
        rt.set_clock(gettime, cookie);
        Ok(())
    }))
}

/// `local_time()`: `0.0` if no runtime is initialized.
pub fn local_time() -> Timestamp {
    RUNTIME.with(|cell| cell.borrow_mut().as_mut().map(|rt| rt.local_time())).unwrap_or(0.0)
}

/// `get_time()`: `0.0` if no runtime is initialized.
pub fn get_time() -> Timestamp {
    RUNTIME.with(|cell| cell.borrow_mut().as_mut().map(|rt| rt.get_time())).unwrap_or(0.0)
}

pub fn roundtrip() -> RuntimeResult<(f64, f64)> {
    with_runtime(|rt| rt.roundtrip())
}

pub fn create_osc_port(service: &str, port: u16, udp: bool) -> ReturnCode {
    to_code(with_runtime(|rt| rt.create_osc_port(service, port, udp)))
}

pub fn delegate_to_osc(service: &str, ip: std::net::IpAddr, port: u16, reliable: bool) -> ReturnCode {
    to_code(with_runtime(|rt| rt.delegate_to_osc(service, ip, port, reliable)))
}

pub fn send_osc_message(service: &str, path: &str, args: Vec<Arg>) -> ReturnCode {
    to_code(with_runtime(|rt| rt.send_osc_message(service, path, args)))
}

/// `poll()` (spec §4.7). `AlreadyRunning`'s opposite case — polling before
/// `initialize` — reports [`ReturnCode::Fail`], not a panic.
pub fn poll() -> ReturnCode {
    to_code(with_runtime(|rt| rt.poll()))
}

/// `run(rate_hz)`: blocks, calling [`poll`] at the given rate until
/// `request_stop` is observed.
pub fn run(rate_hz: u32) -> ReturnCode {
    to_code(with_runtime(|rt| rt.run(rate_hz)))
}

pub fn request_stop() {
    RUNTIME.with(|cell| {
        if let Some(rt) = cell.borrow_mut().as_mut() {
            rt.request_stop();
        }
    });
}

pub fn error_counters() -> dispatch::ErrorCounters {
    RUNTIME
        .with(|cell| cell.borrow().as_ref().map(|rt| rt.error_counters()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.application_name = name.to_string();
        config.network.discovery_port = 0;
        config.network.tcp_port = 0;
        config.network.udp_port = 0;
        config.network.broadcast_addr = "127.255.255.255".to_string();
        config
    }

    #[test]
    fn double_initialize_is_rejected() {
        assert_eq!(initialize(config("a")), ReturnCode::Success);
        assert_eq!(initialize(config("a")), ReturnCode::AlreadyRunning);
        finish();
    }

    #[test]
    fn finish_before_initialize_is_a_harmless_no_op() {
        finish();
        finish();
    }

    #[test]
    fn operations_before_initialize_report_fail_not_panic() {
        finish();
        assert_eq!(add_service("chat"), ReturnCode::Fail);
        assert_eq!(status("chat"), directory::ServiceStatus::Fail);
        assert_eq!(local_time(), 0.0);
    }

    #[test]
    fn flat_api_round_trips_a_send_through_poll() {
        use std::cell::Cell;
        use std::rc::Rc;

        finish();
        assert_eq!(initialize(config("flat_api_test")), ReturnCode::Success);
        assert_eq!(add_service("chat"), ReturnCode::Success);

        let seen = Rc::new(Cell::new(false));
        let seen_cl = seen.clone();
        assert_eq!(
            add_method(
                "chat/text",
                Some("s".to_string()),
                false,
                false,
                Rc::new(()),
                Box::new(move |_msg, _cookie| seen_cl.set(true)),
            ),
            ReturnCode::Success
        );

        assert_eq!(send("/chat/text", 0.0, vec![Arg::Str("hi".into())], false), ReturnCode::Success);
        assert_eq!(poll(), ReturnCode::Success);
        assert!(seen.get());
        finish();
    }
}
