//! Command dispatch table.
//!
//! Maps a command name to a handler over the host state `S`. Handler failures
//! and panics are converted into [`DispatchError`] at this boundary so the
//! caller always has something to put in a reply.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;

use crate::types::{Command, ErrorCode, ErrorInfo, Params, Value, PING_COMMAND};

/// Error a handler may return.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        HandlerError::InvalidParams(message.into())
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command}: {source}")]
    Handler {
        command: String,
        #[source]
        source: HandlerError,
    },

    #[error("{command}: handler panicked: {message}")]
    Panicked { command: String, message: String },
}

impl DispatchError {
    /// Wire form of this error.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            DispatchError::UnknownCommand(name) => ErrorInfo::unknown_command(name),
            DispatchError::Handler { source, .. } => match source {
                HandlerError::InvalidParams(m) => {
                    ErrorInfo::new(ErrorCode::InvalidParams, format!("invalid params: {}", m))
                }
                HandlerError::Failed(m) => ErrorInfo::new(ErrorCode::HandlerFailed, m.clone()),
            },
            DispatchError::Panicked { message, .. } => ErrorInfo::new(
                ErrorCode::HandlerPanicked,
                format!("handler panicked: {}", message),
            ),
        }
    }
}

pub type Handler<S> = Box<dyn Fn(&mut S, &Params) -> Result<Params, HandlerError> + Send + Sync>;

/// Name → handler map.
pub struct DispatchTable<S> {
    handlers: HashMap<String, Handler<S>>,
}

impl<S> Default for DispatchTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> DispatchTable<S> {
    /// A table with the built-in `ping` handler.
    pub fn new() -> Self {
        let mut table = Self::empty();
        table.register(PING_COMMAND, |_, _| {
            let mut out = Params::new();
            out.insert("pong".to_string(), Value::Bool(true));
            Ok(out)
        });
        table
    }

    /// A table with no handlers at all.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) a handler.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut S, &Params) -> Result<Params, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut S, &Params) -> Result<Params, HandlerError> + Send + Sync + 'static,
    {
        self.register(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Sorted command names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `command` against `state`.
    ///
    /// Panics are caught here; `state` may be partially updated by a handler
    /// that panicked midway.
    pub fn dispatch(&self, state: &mut S, command: &Command) -> Result<Params, DispatchError> {
        let handler = self
            .handlers
            .get(&command.name)
            .ok_or_else(|| DispatchError::UnknownCommand(command.name.clone()))?;

        match catch_unwind(AssertUnwindSafe(|| handler(state, &command.params))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(source)) => Err(DispatchError::Handler {
                command: command.name.clone(),
                source,
            }),
            Err(payload) => Err(DispatchError::Panicked {
                command: command.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Typed lookups over a parameter bag.
///
/// `*_or` variants fall back to a default only when the key is absent or
/// null; a present value of the wrong type is still an error.
pub trait ParamsExt {
    fn require_i64(&self, key: &str) -> Result<i64, HandlerError>;
    fn require_f64(&self, key: &str) -> Result<f64, HandlerError>;
    fn i64_or(&self, key: &str, default: i64) -> Result<i64, HandlerError>;
    fn f64_or(&self, key: &str, default: f64) -> Result<f64, HandlerError>;
    fn str_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str, HandlerError>;
    fn list_or_empty(&self, key: &str) -> Result<&[Value], HandlerError>;
}

impl ParamsExt for Params {
    fn require_i64(&self, key: &str) -> Result<i64, HandlerError> {
        match self.get(key) {
            None | Some(Value::Null) => Err(HandlerError::invalid(format!("missing `{}`", key))),
            Some(v) => v
                .as_i64()
                .ok_or_else(|| HandlerError::invalid(format!("`{}` must be an integer", key))),
        }
    }

    fn require_f64(&self, key: &str) -> Result<f64, HandlerError> {
        match self.get(key) {
            None | Some(Value::Null) => Err(HandlerError::invalid(format!("missing `{}`", key))),
            Some(v) => v
                .as_f64()
                .ok_or_else(|| HandlerError::invalid(format!("`{}` must be a number", key))),
        }
    }

    fn i64_or(&self, key: &str, default: i64) -> Result<i64, HandlerError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(_) => self.require_i64(key),
        }
    }

    fn f64_or(&self, key: &str, default: f64) -> Result<f64, HandlerError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(_) => self.require_f64(key),
        }
    }

    fn str_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str, HandlerError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v
                .as_str()
                .ok_or_else(|| HandlerError::invalid(format!("`{}` must be a string", key))),
        }
    }

    fn list_or_empty(&self, key: &str) -> Result<&[Value], HandlerError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(&[]),
            Some(v) => v
                .as_list()
                .ok_or_else(|| HandlerError::invalid(format!("`{}` must be a list", key))),
        }
    }
}
