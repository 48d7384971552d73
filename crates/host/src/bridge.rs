//! Main-thread scheduler bridge.
//!
//! The only path by which network threads cause handlers to run. Any thread
//! may call [`SchedulerBridge::schedule`]; the host drains the queue from its
//! own execution context through [`HostLoop`].
//!
//! ```text
//! tcp conn 1 ─┐
//! tcp conn 2 ─┼─ schedule() ──> mpsc ──> HostLoop::pump() ──> Dispatcher ──> ResultSink
//! udp loop  ──┘                            (host context)
//! ```
//!
//! Degraded mode: when no host loop is attached, or the loop has gone away,
//! `schedule` runs the task inline on the calling thread. The delay is ignored
//! in that case; callers may only rely on ordering and at-most-once execution,
//! never on asynchronous timing.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::dispatch::DispatchTable;
use crate::types::{Command, Reply};

/// One-shot slot a task's reply is delivered through.
#[derive(Debug)]
pub struct ResultSink(oneshot::Sender<Reply>);

impl ResultSink {
    /// Deliver the reply. Returns `false` if the waiting side already gave up.
    pub fn fill(self, reply: Reply) -> bool {
        self.0.send(reply).is_ok()
    }
}

/// Unit of work handed to the bridge.
#[derive(Debug)]
pub struct ScheduledTask {
    pub command: Command,
    pub sink: Option<ResultSink>,
}

impl ScheduledTask {
    /// Task whose reply is delivered to the returned receiver.
    pub fn with_reply(command: Command) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                sink: Some(ResultSink(tx)),
            },
            rx,
        )
    }

    /// Task with no reply (UDP path).
    pub fn fire_and_forget(command: Command) -> Self {
        Self {
            command,
            sink: None,
        }
    }
}

/// Something that can run a task on the host context.
pub trait TaskExecutor: Send {
    fn execute(&mut self, task: ScheduledTask);
}

pub type SharedExecutor = Arc<Mutex<dyn TaskExecutor>>;

/// Dispatch table plus the host state it operates on.
pub struct Dispatcher<S> {
    table: DispatchTable<S>,
    state: S,
    executed: u64,
    failed: u64,
}

impl<S> Dispatcher<S> {
    pub fn new(table: DispatchTable<S>, state: S) -> Self {
        Self {
            table,
            state,
            executed: 0,
            failed: 0,
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn table(&self) -> &DispatchTable<S> {
        &self.table
    }

    /// Tasks executed so far (including failed ones).
    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Wrap for sharing with a [`SchedulerBridge`].
    pub fn shared(self) -> Arc<Mutex<Self>>
    where
        S: Send + 'static,
    {
        Arc::new(Mutex::new(self))
    }
}

impl<S: Send> TaskExecutor for Dispatcher<S> {
    fn execute(&mut self, task: ScheduledTask) {
        let ScheduledTask { command, sink } = task;
        self.executed += 1;

        let reply = match self.table.dispatch(&mut self.state, &command) {
            Ok(result) => Reply::success(command.id, result),
            Err(e) => {
                self.failed += 1;
                if sink.is_none() {
                    warn!(command = %command.name, error = %e, "streamed command failed");
                } else {
                    debug!(command = %command.name, error = %e, "command failed");
                }
                Reply::failure(command.id, e.to_error_info())
            }
        };

        if let Some(sink) = sink {
            if !sink.fill(reply) {
                debug!(command = %command.name, "reply dropped, caller went away");
            }
        }
    }
}

struct Envelope {
    due: Instant,
    seq: u64,
    task: ScheduledTask,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Envelope {}

impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Envelope {
    // Reversed: BinaryHeap is a max-heap, we want the earliest (due, seq).
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

/// Cloneable handle used by network threads to submit work.
#[derive(Clone)]
pub struct SchedulerBridge {
    tx: Option<mpsc::Sender<Envelope>>,
    executor: SharedExecutor,
    seq: Arc<AtomicU64>,
}

impl SchedulerBridge {
    /// Bridge plus the loop the host must pump from its own context.
    pub fn attached(executor: SharedExecutor) -> (Self, HostLoop) {
        let (tx, rx) = mpsc::channel();
        let bridge = Self {
            tx: Some(tx),
            executor: Arc::clone(&executor),
            seq: Arc::new(AtomicU64::new(0)),
        };
        let host = HostLoop {
            rx,
            heap: BinaryHeap::new(),
            executor,
        };
        (bridge, host)
    }

    /// Bridge with no host loop: every task runs inline on the caller.
    pub fn degraded(executor: SharedExecutor) -> Self {
        Self {
            tx: None,
            executor,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.tx.is_none()
    }

    /// Submit `task` to run on the host context no earlier than `delay` from now.
    pub fn schedule(&self, task: ScheduledTask, delay: Duration) {
        let Some(tx) = self.tx.as_ref() else {
            self.run_inline(task);
            return;
        };

        let envelope = Envelope {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            task,
        };
        if let Err(mpsc::SendError(envelope)) = tx.send(envelope) {
            warn!(command = %envelope.task.command.name, "host loop gone, running inline");
            self.run_inline(envelope.task);
        }
    }

    /// Shorthand for `schedule(task, Duration::ZERO)`.
    pub fn submit(&self, task: ScheduledTask) {
        self.schedule(task, Duration::ZERO);
    }

    fn run_inline(&self, task: ScheduledTask) {
        trace!(command = %task.command.name, "degraded mode: inline execution");
        let mut executor = self.executor.lock().unwrap_or_else(|e| e.into_inner());
        executor.execute(task);
    }
}

/// The host side of the bridge. Owned by, and only driven from, the host's
/// single execution context.
pub struct HostLoop {
    rx: mpsc::Receiver<Envelope>,
    heap: BinaryHeap<Envelope>,
    executor: SharedExecutor,
}

impl HostLoop {
    /// Run every task that is due. Call once per host tick.
    ///
    /// Returns how many tasks ran.
    pub fn pump(&mut self) -> usize {
        while let Ok(envelope) = self.rx.try_recv() {
            self.heap.push(envelope);
        }
        self.run_due(Instant::now())
    }

    fn run_due(&mut self, now: Instant) -> usize {
        let mut ran = 0;
        while self.heap.peek().is_some_and(|e| e.due <= now) {
            let Some(envelope) = self.heap.pop() else {
                break;
            };
            let mut executor = self.executor.lock().unwrap_or_else(|e| e.into_inner());
            executor.execute(envelope.task);
            ran += 1;
        }
        ran
    }

    /// Tasks received but not yet run.
    pub fn queued(&self) -> usize {
        self.heap.len()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.due)
    }

    /// Block the current thread running tasks until `running` clears, or
    /// until every bridge is dropped and nothing is left to run.
    pub fn run(mut self, running: Arc<AtomicBool>, idle: Duration) {
        while running.load(AtomicOrdering::Relaxed) {
            self.pump();

            let wait = match self.next_due() {
                Some(due) => due.saturating_duration_since(Instant::now()).min(idle),
                None => idle,
            };
            match self.rx.recv_timeout(wait) {
                Ok(envelope) => self.heap.push(envelope),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    if self.heap.is_empty() {
                        break;
                    }
                    thread::sleep(wait);
                }
            }
        }
        debug!(dropped = self.heap.len(), "host loop stopped");
    }

    /// Run [`run`](Self::run) on a dedicated thread standing in for the
    /// host's execution context.
    pub fn spawn(
        self,
        running: Arc<AtomicBool>,
        idle: Duration,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("stagelink-host".to_string())
            .spawn(move || self.run(running, idle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerError;
    use crate::types::{params, ErrorCode, Params, Value};

    type Log = Vec<(String, thread::ThreadId)>;

    fn recording_dispatcher() -> Arc<Mutex<Dispatcher<Log>>> {
        let table = DispatchTable::new()
            .with("rec", |log: &mut Log, p: &Params| {
                let tag = p.get("tag").and_then(Value::as_str).unwrap_or("").to_string();
                log.push((tag, thread::current().id()));
                Ok(Params::new())
            })
            .with("fail", |_, _| Err(HandlerError::failed("nope")));
        Dispatcher::new(table, Vec::new()).shared()
    }

    fn rec(tag: &str) -> Command {
        Command::new("rec", params! { "tag" => tag })
    }

    fn tags(d: &Arc<Mutex<Dispatcher<Log>>>) -> Vec<String> {
        d.lock().unwrap().state().iter().map(|(t, _)| t.clone()).collect()
    }

    #[test]
    fn tasks_wait_for_pump_and_run_in_order() {
        let d = recording_dispatcher();
        let shared: SharedExecutor = d.clone();
        let (bridge, mut host) = SchedulerBridge::attached(shared);

        for t in ["a", "b", "c"] {
            bridge.submit(ScheduledTask::fire_and_forget(rec(t)));
        }
        assert!(tags(&d).is_empty());

        assert_eq!(host.pump(), 3);
        assert_eq!(tags(&d), vec!["a", "b", "c"]);
    }

    #[test]
    fn tasks_submitted_from_other_threads_run_on_host_thread() {
        let d = recording_dispatcher();
        let shared: SharedExecutor = d.clone();
        let (bridge, mut host) = SchedulerBridge::attached(shared);

        let worker = {
            let bridge = bridge.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    bridge.submit(ScheduledTask::fire_and_forget(rec(&i.to_string())));
                }
            })
        };
        worker.join().unwrap();
        host.pump();

        let me = thread::current().id();
        let guard = d.lock().unwrap();
        let log = guard.state();
        assert_eq!(log.len(), 10);
        assert!(log.iter().all(|(_, id)| *id == me));
        let order: Vec<String> = log.iter().map(|(t, _)| t.clone()).collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn delayed_task_is_held_back() {
        let d = recording_dispatcher();
        let shared: SharedExecutor = d.clone();
        let (bridge, mut host) = SchedulerBridge::attached(shared);

        bridge.schedule(
            ScheduledTask::fire_and_forget(rec("later")),
            Duration::from_millis(40),
        );
        bridge.submit(ScheduledTask::fire_and_forget(rec("now")));

        assert_eq!(host.pump(), 1);
        assert_eq!(host.queued(), 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(host.pump(), 1);
        assert_eq!(tags(&d), vec!["now", "later"]);
    }

    #[test]
    fn reply_is_delivered_through_sink() {
        let d = recording_dispatcher();
        let shared: SharedExecutor = d.clone();
        let (bridge, mut host) = SchedulerBridge::attached(shared);

        let (task, mut rx) = ScheduledTask::with_reply(Command::ping().with_id(5));
        bridge.submit(task);
        assert!(rx.try_recv().is_err());
        host.pump();
        let reply = rx.try_recv().unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.id, Some(5));

        let (task, mut rx) = ScheduledTask::with_reply(Command::new("fail", Params::new()));
        bridge.submit(task);
        host.pump();
        let err = rx.try_recv().unwrap().into_result().unwrap_err();
        assert_eq!(err.code, ErrorCode::HandlerFailed);
        assert_eq!(d.lock().unwrap().failed(), 1);
    }

    #[test]
    fn degraded_bridge_runs_inline() {
        let d = recording_dispatcher();
        let shared: SharedExecutor = d.clone();
        let bridge = SchedulerBridge::degraded(shared);
        assert!(bridge.is_degraded());

        bridge.schedule(
            ScheduledTask::fire_and_forget(rec("x")),
            Duration::from_secs(60),
        );
        assert_eq!(tags(&d), vec!["x"]);
    }

    #[test]
    fn dropped_host_loop_falls_back_to_inline() {
        let d = recording_dispatcher();
        let shared: SharedExecutor = d.clone();
        let (bridge, host) = SchedulerBridge::attached(shared);
        drop(host);

        let (task, mut rx) = ScheduledTask::with_reply(rec("y"));
        bridge.submit(task);
        assert!(rx.try_recv().unwrap().is_success());
        assert_eq!(tags(&d), vec!["y"]);
    }

    #[test]
    fn spawned_loop_executes_and_stops() {
        let d = recording_dispatcher();
        let shared: SharedExecutor = d.clone();
        let (bridge, host) = SchedulerBridge::attached(shared);
        let running = Arc::new(AtomicBool::new(true));
        let handle = host
            .spawn(Arc::clone(&running), Duration::from_millis(5))
            .unwrap();

        let (task, rx) = ScheduledTask::with_reply(rec("z"));
        bridge.submit(task);
        let reply = rx.blocking_recv().unwrap();
        assert!(reply.is_success());

        running.store(false, AtomicOrdering::Relaxed);
        handle.join().unwrap();
        let guard = d.lock().unwrap();
        assert_ne!(guard.state()[0].1, thread::current().id());
    }
}
