//! Shared data model for the stagelink protocol.
//!
//! Everything that crosses the wire is defined here: the [`Value`] union used
//! for parameter bags, the [`Command`] a client sends, and the [`Reply`] the
//! host returns on the reliable channel.
//!
//! # Wire shape
//!
//! ```text
//! command: {"type":"set_tempo","params":{"tempo":120.0},"id":7}
//! success: {"status":"success","result":{"tempo":120.0},"id":7}
//! failure: {"status":"error","message":"unknown command: nope","code":"unknown_command","id":8}
//! ```
//!
//! `type`/`params` are the field names existing remote-script peers already
//! speak, so a plain JSON client can talk to the gateway without this crate.
//!
//! # Examples
//!
//! ```
//! use stagelink_types::{Command, Params, Reply, Value};
//!
//! let mut params = Params::new();
//! params.insert("value".to_string(), Value::Int(42));
//! let cmd = Command::new("echo", params.clone());
//! assert_eq!(cmd.name, "echo");
//!
//! let reply = Reply::success(Some(1), params);
//! assert!(reply.is_success());
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default TCP port for command/response traffic.
pub const DEFAULT_TCP_PORT: u16 = 9877;

/// Default UDP port for fire-and-forget streaming.
pub const DEFAULT_UDP_PORT: u16 = 9878;

/// Default bind/connect address.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Universal no-op used for liveness checks.
pub const PING_COMMAND: &str = "ping";

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Parameter and result bag.
pub type Params = BTreeMap<String, Value>;

/// A JSON-shaped value.
///
/// Integers and floats are kept apart so that indices (`track_index`) survive a
/// round trip without turning into `1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(Params),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Params> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<Params> for Value {
    fn from(v: Params) -> Self {
        Value::Map(v)
    }
}

/// Build a [`Params`] bag from `key => value` pairs.
///
/// ```
/// use stagelink_types::{params, Value};
///
/// let p = params! { "track_index" => 0, "value" => 0.5 };
/// assert_eq!(p["track_index"], Value::Int(0));
/// ```
#[macro_export]
macro_rules! params {
    () => { $crate::Params::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut p = $crate::Params::new();
        $( p.insert(($key).to_string(), $crate::Value::from($value)); )+
        p
    }};
}

/// A named, parameterized request to mutate or query host state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub name: String,
    #[serde(default)]
    pub params: Params,
    /// Correlation id, echoed back in the [`Reply`]. Ignored on UDP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Command {
    pub fn new(name: impl Into<String>, params: Params) -> Self {
        Self {
            name: name.into(),
            params,
            id: None,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn ping() -> Self {
        Self::new(PING_COMMAND, Params::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error")]
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "unknown_command")]
    UnknownCommand,
    #[serde(rename = "invalid_params")]
    InvalidParams,
    #[serde(rename = "handler_failed")]
    HandlerFailed,
    #[serde(rename = "handler_panicked")]
    HandlerPanicked,
    #[serde(rename = "host_unavailable")]
    HostUnavailable,
    #[serde(rename = "malformed")]
    Malformed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownCommand => "unknown_command",
            ErrorCode::InvalidParams => "invalid_params",
            ErrorCode::HandlerFailed => "handler_failed",
            ErrorCode::HandlerPanicked => "handler_panicked",
            ErrorCode::HostUnavailable => "host_unavailable",
            ErrorCode::Malformed => "malformed",
        }
    }
}

/// Failure payload of a [`Reply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::new(ErrorCode::UnknownCommand, format!("unknown command: {}", name))
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code.as_str())
    }
}

impl std::error::Error for ErrorInfo {}

/// Outcome of a [`Command`] on the reliable channel.
///
/// Flat on the wire: `result` is present on success, `message`/`code` on
/// failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Reply {
    pub fn success(id: Option<u64>, result: Params) -> Self {
        Self {
            status: Status::Success,
            result: Some(result),
            message: None,
            code: None,
            id,
        }
    }

    pub fn failure(id: Option<u64>, error: ErrorInfo) -> Self {
        Self {
            status: Status::Failure,
            result: None,
            message: Some(error.message),
            code: Some(error.code),
            id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Split into payload or typed failure.
    ///
    /// A failure without a `code` (older peers only send `message`) maps to
    /// [`ErrorCode::HandlerFailed`].
    pub fn into_result(self) -> Result<Params, ErrorInfo> {
        match self.status {
            Status::Success => Ok(self.result.unwrap_or_default()),
            Status::Failure => Err(ErrorInfo {
                code: self.code.unwrap_or(ErrorCode::HandlerFailed),
                message: self.message.unwrap_or_else(|| "unspecified error".to_string()),
            }),
        }
    }
}
