//! Command Dispatcher
//!
//! Maps command names to handler functions and turns decoded request
//! messages into response messages.
//!
//! # Command encoding
//!
//! One framed message carries one command. The request body is the command
//! name, a single `0x20` separator, and the payload; the separator is absent
//! when the payload is empty. The response body is a status token followed
//! by the same separator scheme:
//!
//! ```text
//! request:   echo hello
//! response:  ok hello
//! request:   ghost
//! response:  err unknown command: "ghost"
//! ```
//!
//! Names round-trip byte-for-byte and payloads are opaque (they may contain
//! anything except the framing terminator, which is a caller concern).
//!
//! Protocol-level failures — unknown command, malformed name — come back as
//! an `err` response; they never close the connection.
//!
//! # Registration
//!
//! The handler table is built during single-threaded startup and read-only
//! afterwards, so dispatch needs no locking. Duplicate registration is a
//! configuration error reported at setup time, not a runtime fault.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use super::error::ConfigError;

/// Separator between the command name and the payload.
pub const SEPARATOR: u8 = b' ';

const OK_TOKEN: &[u8] = b"ok";
const ERR_TOKEN: &[u8] = b"err";

/// What a handler returns: a response payload, or a protocol-level error
/// message reported back to the caller.
pub type HandlerResult = Result<Vec<u8>, String>;

type HandlerFn = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Observer for per-dispatch timing. Injected explicitly; the default does
/// nothing. There is no process-global writer to swap.
pub trait CallObserver: Send + Sync {
    /// Called once per dispatched command with its outcome.
    fn observe(&self, name: &str, elapsed: Duration, ok: bool);
}

/// The default observer: ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl CallObserver for NoopObserver {
    fn observe(&self, _name: &str, _elapsed: Duration, _ok: bool) {}
}

/// Maps command names to handlers and executes them against decoded
/// messages.
pub struct CommandDispatcher {
    handlers: HashMap<String, HandlerFn>,
    observer: Arc<dyn CallObserver>,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    /// Create a dispatcher with no registered commands and a no-op observer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_observer(Arc::new(NoopObserver))
    }

    /// Create a dispatcher reporting dispatch timing to `observer`.
    #[must_use]
    pub fn with_observer(observer: Arc<dyn CallObserver>) -> Self {
        Self {
            handlers: HashMap::new(),
            observer,
        }
    }

    /// Register a handler for `name`.
    ///
    /// Names must be non-empty, free of the `0x20` separator, and unique
    /// within this dispatcher; violations are configuration errors that
    /// should abort startup.
    pub fn handle<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), ConfigError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if name.is_empty() || name.as_bytes().contains(&SEPARATOR) {
            return Err(ConfigError::InvalidCommandName(name.to_string()));
        }
        if self.handlers.contains_key(name) {
            return Err(ConfigError::DuplicateCommand(name.to_string()));
        }
        let handler: HandlerFn = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Whether a command name is registered.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, unordered.
    #[must_use]
    pub fn command_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Execute the command carried by one decoded request message and build
    /// the response message. Always produces a response; protocol errors
    /// become `err ...` bodies rather than connection failures.
    pub async fn dispatch(&self, request: &[u8]) -> Vec<u8> {
        let (name_bytes, payload) = split_request(request);

        let Ok(name) = std::str::from_utf8(name_bytes) else {
            tracing::debug!("Rejecting command with non-UTF-8 name");
            return encode_err("malformed command name");
        };

        let Some(handler) = self.handlers.get(name) else {
            tracing::debug!(command = name, "Unknown command");
            return encode_err(&format!("unknown command: {name:?}"));
        };

        let started = Instant::now();
        let result = handler(payload.to_vec()).await;
        let elapsed = started.elapsed();
        self.observer.observe(name, elapsed, result.is_ok());

        match result {
            Ok(reply) => {
                tracing::trace!(command = name, elapsed = ?elapsed, "Command handled");
                encode_ok(&reply)
            }
            Err(msg) => {
                tracing::debug!(command = name, error = %msg, "Command failed");
                encode_err(&msg)
            }
        }
    }
}

/// Build a request body from a command name and payload.
#[must_use]
pub fn encode_request(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(name.len() + 1 + payload.len());
    body.extend_from_slice(name.as_bytes());
    if !payload.is_empty() {
        body.push(SEPARATOR);
        body.extend_from_slice(payload);
    }
    body
}

/// Build an `ok` response body.
#[must_use]
pub fn encode_ok(payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(OK_TOKEN.len() + 1 + payload.len());
    body.extend_from_slice(OK_TOKEN);
    if !payload.is_empty() {
        body.push(SEPARATOR);
        body.extend_from_slice(payload);
    }
    body
}

/// Build an `err` response body.
#[must_use]
pub fn encode_err(message: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(ERR_TOKEN.len() + 1 + message.len());
    body.extend_from_slice(ERR_TOKEN);
    if !message.is_empty() {
        body.push(SEPARATOR);
        body.extend_from_slice(message.as_bytes());
    }
    body
}

/// Split a request body into name and payload at the first separator.
#[must_use]
pub fn split_request(body: &[u8]) -> (&[u8], &[u8]) {
    match body.iter().position(|&b| b == SEPARATOR) {
        Some(at) => (&body[..at], &body[at + 1..]),
        None => (body, &[]),
    }
}

/// Interpret a response body: `Ok(payload)` for `ok` responses, the error
/// message for `err` responses, `None` for anything else.
#[must_use]
pub fn parse_response(body: &[u8]) -> Option<Result<Vec<u8>, String>> {
    let (token, rest) = split_request(body);
    if token == OK_TOKEN {
        Some(Ok(rest.to_vec()))
    } else if token == ERR_TOKEN {
        Some(Err(String::from_utf8_lossy(rest).into_owned()))
    } else {
        None
    }
}
