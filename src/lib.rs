//! Stagelink (workspace facade crate).
//!
//! Drive a single-threaded live host from outside: reliable TCP
//! request/response for commands and queries, fire-and-forget UDP for
//! high-rate parameter streams. The implementation lives in dedicated crates
//! under `crates/`; this package re-exports them and carries the demo host
//! model used by the binaries.

pub use stagelink_client as client;
pub use stagelink_codec as codec;
pub use stagelink_gateway as gateway;
pub use stagelink_host as host;
pub use stagelink_types as types;

pub mod live_set;
