use crate::{DataRequestMonitor, RequestError};
use anyhow::{anyhow, Context as _, Result};
use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashSet, VecDeque},
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};
use util::post_inc;

type Runnable = Box<dyn FnOnce() + Send>;
type FaultHandler = Box<dyn FnOnce(String) + Send>;
type PeriodicCallback = Arc<Mutex<Box<dyn FnMut() + Send>>>;

/// Receives a report for every task that panicked on an executor.
pub type FaultSink = Arc<dyn Fn(&TaskFault) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFault {
    pub executor: String,
    pub message: String,
}

/// A serialized task queue drained by exactly one worker thread.
///
/// Tasks run one at a time, in the order they were submitted. Completion handlers and
/// continuations that submit more work always land at the tail of the queue, so a
/// handler never re-enters the stack of the code that completed it.
///
/// The worker exits once every `Executor` handle has been dropped and the queue is empty.
#[derive(Clone)]
pub struct Executor {
    handle: Arc<Handle>,
}

struct Handle {
    shared: Arc<Shared>,
    thread_id: ThreadId,
}

struct Shared {
    name: String,
    queue: Mutex<Queue>,
    condvar: Condvar,
    fault_sink: Mutex<Option<FaultSink>>,
}

struct Task {
    runnable: Runnable,
    on_fault: Option<FaultHandler>,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Task>,
    timers: BinaryHeap<Reverse<Timer>>,
    live_timers: HashSet<u64>,
    next_timer_seq: u64,
    next_timer_id: u64,
    closed: bool,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    id: u64,
    kind: TimerKind,
}

enum TimerKind {
    Once(Task),
    Periodic {
        period: Duration,
        callback: PeriodicCallback,
    },
}

/// Handle to a delayed or periodic task. Dropping it does not cancel the task.
#[derive(Clone)]
pub struct ScheduledTask {
    id: u64,
    shared: Weak<Shared>,
}

impl Executor {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            queue: Mutex::new(Queue::default()),
            condvar: Condvar::new(),
            fault_sink: Mutex::new(None),
        });
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn({
                let shared = shared.clone();
                move || run_worker(shared)
            })
            .with_context(|| format!("failed to spawn executor thread {name}"))?;
        let thread_id = worker.thread().id();
        Ok(Self {
            handle: Arc::new(Handle { shared, thread_id }),
        })
    }

    pub fn name(&self) -> &str {
        &self.handle.shared.name
    }

    pub fn set_fault_sink(&self, sink: impl Fn(&TaskFault) + Send + Sync + 'static) {
        *self.handle.shared.fault_sink.lock() = Some(Arc::new(sink));
    }

    pub fn is_executor_thread(&self) -> bool {
        thread::current().id() == self.handle.thread_id
    }

    #[track_caller]
    pub fn assert_in_executor_thread(&self) {
        assert!(
            self.is_executor_thread(),
            "must be called on the {} executor thread",
            self.name()
        );
    }

    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.push(Task {
            runnable: Box::new(task),
            on_fault: None,
        });
    }

    /// Submits a task on behalf of a monitor. If the task panics, the monitor is failed
    /// with an internal error unless something already completed it.
    pub fn submit_for<V: Send + 'static>(
        &self,
        rm: &DataRequestMonitor<V>,
        task: impl FnOnce() + Send + 'static,
    ) {
        let rm = rm.clone();
        self.push(Task {
            runnable: Box::new(task),
            on_fault: Some(Box::new(move |message| {
                if !rm.is_done() {
                    rm.fail(RequestError::Internal(message));
                }
            })),
        });
    }

    /// Runs `task` on the executor and blocks the calling thread until it has finished.
    ///
    /// A panic inside the task is returned as an error. Calling this from the executor
    /// thread itself would deadlock, so it fails instead.
    pub fn submit_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R> {
        if self.is_executor_thread() {
            return Err(anyhow!(
                "submit_and_wait called from the {} executor thread",
                self.name()
            ));
        }
        smol::block_on(self.run(task))
    }

    pub fn run<R: Send + 'static>(
        &self,
        task: impl FnOnce() -> R + Send + 'static,
    ) -> impl Future<Output = Result<R>> {
        let (tx, rx) = oneshot::channel();
        self.submit(move || {
            tx.send(panic::catch_unwind(AssertUnwindSafe(task))).ok();
        });
        let name = self.name().to_string();
        async move {
            match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(payload)) => Err(anyhow!(
                    "task panicked on executor {name}: {}",
                    util::panic_message(payload.as_ref())
                )),
                Err(_) => Err(anyhow!("executor {name} dropped the task")),
            }
        }
    }

    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> ScheduledTask {
        self.push_timer(
            delay,
            TimerKind::Once(Task {
                runnable: Box::new(task),
                on_fault: None,
            }),
        )
    }

    pub fn schedule_periodic(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: impl FnMut() + Send + 'static,
    ) -> ScheduledTask {
        self.push_timer(
            initial_delay,
            TimerKind::Periodic {
                period: period.max(Duration::from_millis(1)),
                callback: Arc::new(Mutex::new(Box::new(task))),
            },
        )
    }

    fn push(&self, task: Task) {
        let shared = &self.handle.shared;
        shared.queue.lock().ready.push_back(task);
        shared.condvar.notify_one();
    }

    fn push_timer(&self, delay: Duration, kind: TimerKind) -> ScheduledTask {
        let shared = &self.handle.shared;
        let id = {
            let mut queue = shared.queue.lock();
            let id = post_inc(&mut queue.next_timer_id);
            let seq = post_inc(&mut queue.next_timer_seq);
            queue.live_timers.insert(id);
            queue.timers.push(Reverse(Timer {
                deadline: Instant::now() + delay,
                seq,
                id,
                kind,
            }));
            id
        };
        shared.condvar.notify_one();
        ScheduledTask {
            id,
            shared: Arc::downgrade(shared),
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.queue.lock().closed = true;
        self.shared.condvar.notify_all();
    }
}

impl ScheduledTask {
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.queue.lock().live_timers.remove(&self.id);
        }
    }
}

impl Queue {
    fn promote_due_timers(&mut self, now: Instant) {
        loop {
            match self.timers.peek() {
                Some(Reverse(timer)) if timer.deadline <= now => {}
                _ => break,
            }
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            if !self.live_timers.contains(&timer.id) {
                continue;
            }
            match timer.kind {
                TimerKind::Once(task) => {
                    self.live_timers.remove(&timer.id);
                    self.ready.push_back(task);
                }
                TimerKind::Periodic { period, callback } => {
                    let tick = callback.clone();
                    self.ready.push_back(Task {
                        runnable: Box::new(move || {
                            let mut guard = tick.lock();
                            let callback: &mut (dyn FnMut() + Send) = &mut **guard;
                            callback();
                        }),
                        on_fault: None,
                    });
                    let mut deadline = timer.deadline + period;
                    if deadline <= now {
                        deadline = now + period;
                    }
                    let seq = post_inc(&mut self.next_timer_seq);
                    self.timers.push(Reverse(Timer {
                        deadline,
                        seq,
                        id: timer.id,
                        kind: TimerKind::Periodic { period, callback },
                    }));
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(timer)| timer.deadline)
    }
}

impl Shared {
    fn run_task(&self, task: Task) {
        let Task { runnable, on_fault } = task;
        let Err(payload) = panic::catch_unwind(AssertUnwindSafe(runnable)) else {
            return;
        };
        let message = util::panic_message(payload.as_ref());
        self.report_fault(&message);
        if let Some(on_fault) = on_fault {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || on_fault(message)))
            {
                log::error!(
                    "fault handler panicked on executor {}: {}",
                    self.name,
                    util::panic_message(payload.as_ref())
                );
            }
        }
    }

    fn report_fault(&self, message: &str) {
        let sink = self.fault_sink.lock().clone();
        match sink {
            Some(sink) => sink(&TaskFault {
                executor: self.name.clone(),
                message: message.to_string(),
            }),
            None => log::error!("task panicked on executor {}: {}", self.name, message),
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    log::debug!("executor {} started", shared.name);
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                queue.promote_due_timers(Instant::now());
                if let Some(task) = queue.ready.pop_front() {
                    break Some(task);
                }
                if queue.closed {
                    break None;
                }
                match queue.next_deadline() {
                    Some(deadline) => {
                        shared.condvar.wait_until(&mut queue, deadline);
                    }
                    None => shared.condvar.wait(&mut queue),
                }
            }
        };
        match task {
            Some(task) => shared.run_task(task),
            None => break,
        }
    }
    log::debug!("executor {} stopped", shared.name);
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}
