//! Host side of the gateway: command dispatch and the main-thread bridge.
//!
//! A live host may only be mutated from its own execution context. This crate
//! keeps that rule in one place:
//!
//! - [`dispatch`]: name → handler table over the host state, with failures and
//!   panics converted to typed errors at the boundary.
//! - [`bridge`]: the queue network threads submit work to, drained by the
//!   host's own loop ([`HostLoop`]), with an inline fallback when no loop is
//!   attached.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use stagelink_host::{Dispatcher, DispatchTable, ScheduledTask, SchedulerBridge, SharedExecutor};
//! use stagelink_host::types::{params, Command};
//!
//! let table = DispatchTable::new().with("set_tempo", |tempo: &mut f64, p| {
//!     *tempo = p.get("tempo").and_then(|v| v.as_f64()).unwrap_or(*tempo);
//!     Ok(params! { "tempo" => *tempo })
//! });
//! let dispatcher = Dispatcher::new(table, 120.0).shared();
//! let executor: SharedExecutor = dispatcher.clone();
//! let (bridge, mut host) = SchedulerBridge::attached(executor);
//!
//! let (task, mut reply) = ScheduledTask::with_reply(Command::new("set_tempo", params! { "tempo" => 128.0 }));
//! bridge.schedule(task, Duration::ZERO);
//!
//! // Later, on the host's own tick:
//! host.pump();
//! assert!(reply.try_recv().unwrap().is_success());
//! assert_eq!(*dispatcher.lock().unwrap().state(), 128.0);
//! ```

pub mod bridge;
pub mod dispatch;

pub use stagelink_types as types;

pub use bridge::{
    Dispatcher, HostLoop, ResultSink, ScheduledTask, SchedulerBridge, SharedExecutor, TaskExecutor,
};
pub use dispatch::{DispatchError, DispatchTable, Handler, HandlerError, ParamsExt};
