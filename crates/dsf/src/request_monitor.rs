use crate::{Executor, RequestError};
use parking_lot::Mutex;
use std::{
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

pub type RequestResult<V> = Result<V, RequestError>;

type Handler<V> = Box<dyn FnOnce(RequestResult<V>) + Send>;
type CancelListener = Box<dyn FnOnce() + Send>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Ok,
    Error(RequestError),
}

impl RequestStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    fn of<V>(result: &RequestResult<V>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(error) => Self::Error(error.clone()),
        }
    }
}

/// Completion handle for an asynchronous request that produces a `V`.
///
/// A monitor transitions out of `Pending` exactly once. Its handler is never invoked on
/// the stack of whoever completed it: completion submits the handler to the monitor's
/// executor.
pub struct DataRequestMonitor<V> {
    inner: Arc<Inner<V>>,
}

/// A monitor that carries no payload.
pub type RequestMonitor = DataRequestMonitor<()>;

struct Inner<V> {
    executor: Executor,
    state: Mutex<State<V>>,
    cancelled: AtomicBool,
    cancel_listeners: Mutex<Vec<CancelListener>>,
    parent: Option<Arc<dyn Cancellable>>,
}

enum State<V> {
    Pending(Option<Handler<V>>),
    Done(RequestStatus),
}

trait Cancellable: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

impl<V: Send + 'static> Cancellable for Inner<V> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(SeqCst)
            || self
                .parent
                .as_ref()
                .map_or(false, |parent| parent.is_cancelled())
    }
}

impl<V: Send + 'static> DataRequestMonitor<V> {
    pub fn new(executor: &Executor, handler: impl FnOnce(RequestResult<V>) + Send + 'static) -> Self {
        Self::build(executor.clone(), Some(Box::new(handler)), None)
    }

    /// Creates a monitor that runs on the parent's executor and observes its cancellation.
    pub fn new_child<P: Send + 'static>(
        parent: &DataRequestMonitor<P>,
        handler: impl FnOnce(RequestResult<V>) + Send + 'static,
    ) -> Self {
        let cancellable: Arc<dyn Cancellable> = parent.inner.clone();
        Self::build(
            parent.inner.executor.clone(),
            Some(Box::new(handler)),
            Some(cancellable),
        )
    }

    /// A monitor without a handler. Only its status can be observed.
    pub fn detached(executor: &Executor) -> Self {
        Self::build(executor.clone(), None, None)
    }

    fn build(
        executor: Executor,
        handler: Option<Handler<V>>,
        parent: Option<Arc<dyn Cancellable>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                state: Mutex::new(State::Pending(handler)),
                cancelled: AtomicBool::new(false),
                cancel_listeners: Mutex::new(Vec::new()),
                parent,
            }),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn done_with(&self, value: V) {
        self.complete(Ok(value));
    }

    pub fn fail(&self, error: RequestError) {
        self.complete(Err(error));
    }

    #[track_caller]
    pub fn complete(&self, result: RequestResult<V>) {
        let result = match result {
            Ok(_) if self.is_cancelled() => Err(RequestError::Cancelled),
            result => result,
        };

        let handler = {
            let mut state = self.inner.state.lock();
            if let State::Pending(handler) = &mut *state {
                let handler = handler.take();
                *state = State::Done(RequestStatus::of(&result));
                Some(handler)
            } else {
                None
            }
        };

        match handler {
            Some(Some(handler)) => self.inner.executor.submit(move || handler(result)),
            Some(None) => {}
            None => {
                log::error!(
                    "request monitor completed twice, second result: {:?}",
                    RequestStatus::of(&result)
                );
                util::debug_panic!("request monitor completed twice");
            }
        }
    }

    /// Requests cancellation. This is advisory: the owner of the request observes the flag
    /// and still completes the monitor, which then reports `Cancelled`.
    pub fn cancel(&self) {
        if self.is_done() || self.inner.cancelled.swap(true, SeqCst) {
            return;
        }
        let listeners = mem::take(&mut *self.inner.cancel_listeners.lock());
        for listener in listeners {
            self.inner.executor.submit(listener);
        }
    }

    pub fn on_cancel(&self, listener: impl FnOnce() + Send + 'static) {
        let mut listeners = self.inner.cancel_listeners.lock();
        if self.inner.cancelled.load(SeqCst) {
            drop(listeners);
            self.inner.executor.submit(listener);
        } else {
            listeners.push(Box::new(listener));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }

    pub fn status(&self) -> RequestStatus {
        match &*self.inner.state.lock() {
            State::Pending(_) => RequestStatus::Pending,
            State::Done(status) => status.clone(),
        }
    }

    pub fn error(&self) -> Option<RequestError> {
        match self.status() {
            RequestStatus::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Creates a child monitor producing a `U`. On success `f` receives the value together
    /// with this monitor and is responsible for completing it; failures complete this
    /// monitor directly.
    pub fn chain<U: Send + 'static>(
        &self,
        f: impl FnOnce(U, DataRequestMonitor<V>) + Send + 'static,
    ) -> DataRequestMonitor<U> {
        let parent = self.clone();
        DataRequestMonitor::new_child(self, move |result| match result {
            Ok(value) => {
                let guard = parent.clone();
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || f(value, parent)))
                {
                    let message = util::panic_message(payload.as_ref());
                    log::error!("request continuation panicked: {message}");
                    if !guard.is_done() {
                        guard.fail(RequestError::Internal(message));
                    }
                }
            }
            Err(error) => parent.fail(error),
        })
    }
}

impl RequestMonitor {
    pub fn done(&self) {
        self.complete(Ok(()));
    }

    /// Adapts this monitor to a request whose payload the caller does not need.
    pub fn discard_data<U: Send + 'static>(&self) -> DataRequestMonitor<U> {
        self.chain(|_: U, parent| parent.done())
    }
}

impl<V> Clone for DataRequestMonitor<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Send + 'static> fmt::Debug for DataRequestMonitor<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataRequestMonitor")
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Fan-in monitor: completes its parent once `count` children have completed.
///
/// The parent succeeds only if every child succeeded. Otherwise it fails with the first
/// failure observed; later failures are dropped.
pub struct CountingRequestMonitor {
    parent: RequestMonitor,
    state: Arc<Mutex<Counting>>,
}

struct Counting {
    remaining: usize,
    first_error: Option<RequestError>,
}

impl CountingRequestMonitor {
    pub fn new(parent: RequestMonitor, count: usize) -> Self {
        if count == 0 {
            parent.done();
        }
        Self {
            parent,
            state: Arc::new(Mutex::new(Counting {
                remaining: count,
                first_error: None,
            })),
        }
    }

    pub fn child<V: Send + 'static>(&self) -> DataRequestMonitor<V> {
        let state = self.state.clone();
        let parent = self.parent.clone();
        DataRequestMonitor::new_child(&self.parent, move |result: RequestResult<V>| {
            let finished = {
                let mut state = state.lock();
                if let Err(error) = result {
                    state.first_error.get_or_insert(error);
                }
                match state.remaining.checked_sub(1) {
                    Some(remaining) => {
                        state.remaining = remaining;
                        (remaining == 0).then(|| state.first_error.take())
                    }
                    None => {
                        log::error!("counting monitor received more completions than expected");
                        None
                    }
                }
            };
            match finished {
                Some(None) => parent.done(),
                Some(Some(error)) => parent.fail(error),
                None => {}
            }
        })
    }

    pub fn parent(&self) -> &RequestMonitor {
        &self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{sync::mpsc, time::Duration};

    fn executor() -> Executor {
        Executor::new("monitor-tests").unwrap()
    }

    fn recording<V: Send + 'static>(
        executor: &Executor,
    ) -> (DataRequestMonitor<V>, mpsc::Receiver<RequestResult<V>>) {
        let (tx, rx) = mpsc::channel();
        let rm = DataRequestMonitor::new(executor, move |result| {
            tx.send(result).ok();
        });
        (rm, rx)
    }

    fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_handler_runs_after_the_completing_task() {
        let executor = executor();
        let order = Arc::new(Mutex::new(Vec::new()));
        executor
            .submit_and_wait({
                let executor = executor.clone();
                let order = order.clone();
                move || {
                    let rm = DataRequestMonitor::new(&executor, {
                        let order = order.clone();
                        move |result: RequestResult<u32>| order.lock().push(result.unwrap())
                    });
                    rm.done_with(7);
                    order.lock().push(0);
                }
            })
            .unwrap();
        executor.submit_and_wait(|| ()).unwrap();
        assert_eq!(*order.lock(), vec![0, 7]);
    }

    #[test]
    fn test_status_transitions() {
        let executor = executor();
        let (rm, rx) = recording::<String>(&executor);
        assert_eq!(rm.status(), RequestStatus::Pending);
        rm.done_with("value".into());
        assert_eq!(recv(&rx), Ok("value".to_string()));
        assert_eq!(rm.status(), RequestStatus::Ok);
        assert!(rm.is_done());

        let (rm, rx) = recording::<String>(&executor);
        rm.fail(RequestError::failed("bad-arg"));
        assert_eq!(recv(&rx), Err(RequestError::failed("bad-arg")));
        assert_eq!(rm.error(), Some(RequestError::failed("bad-arg")));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "completed twice")]
    fn test_second_completion_is_a_programming_error() {
        let executor = executor();
        let rm = RequestMonitor::detached(&executor);
        rm.done();
        rm.fail(RequestError::Disconnected);
    }

    #[test]
    fn test_cancelled_monitor_reports_cancelled() {
        let executor = executor();
        let (rm, rx) = recording::<u32>(&executor);
        let (cancel_tx, cancel_rx) = mpsc::channel();
        rm.on_cancel(move || {
            cancel_tx.send(()).ok();
        });
        rm.cancel();
        recv(&cancel_rx);
        assert!(rm.is_cancelled());

        rm.done_with(1);
        assert_eq!(recv(&rx), Err(RequestError::Cancelled));

        let late = RequestMonitor::detached(&executor);
        late.done();
        late.cancel();
        assert!(!late.is_cancelled());
        assert_eq!(late.status(), RequestStatus::Ok);
    }

    #[test]
    fn test_child_observes_parent_cancellation() {
        let executor = executor();
        let (parent, parent_rx) = recording::<()>(&executor);
        let child = parent.discard_data::<u32>();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());

        child.done_with(5);
        assert_eq!(recv(&parent_rx), Err(RequestError::Cancelled));
    }

    #[test]
    fn test_chain() {
        let executor = executor();
        let (parent, rx) = recording::<String>(&executor);
        let child = parent.chain(|value: u32, parent| parent.done_with(format!("got {value}")));
        child.done_with(3);
        assert_eq!(recv(&rx), Ok("got 3".to_string()));

        let (parent, rx) = recording::<String>(&executor);
        let child = parent.chain(|_: u32, _| unreachable!());
        child.fail(RequestError::Timeout(Duration::from_secs(2)));
        assert_eq!(recv(&rx), Err(RequestError::Timeout(Duration::from_secs(2))));

        let (parent, rx) = recording::<String>(&executor);
        let child = parent.chain(|_: u32, _| panic!("continuation failed"));
        child.done_with(1);
        assert_eq!(
            recv(&rx),
            Err(RequestError::Internal("continuation failed".into()))
        );
    }

    #[test]
    fn test_counting_monitor_waits_for_every_child() {
        let executor = executor();
        let (parent, rx) = recording::<()>(&executor);
        let counting = CountingRequestMonitor::new(parent.clone(), 3);
        let children = (0..3).map(|_| counting.child::<u32>()).collect::<Vec<_>>();

        children[2].done_with(2);
        children[0].done_with(0);
        executor.submit_and_wait(|| ()).unwrap();
        assert_eq!(parent.status(), RequestStatus::Pending);

        children[1].done_with(1);
        assert_eq!(recv(&rx), Ok(()));
    }

    #[test]
    fn test_counting_monitor_reports_first_failure() {
        let executor = executor();
        let (parent, rx) = recording::<()>(&executor);
        let counting = CountingRequestMonitor::new(parent, 3);
        let a = counting.child::<()>();
        let b = counting.child::<()>();
        let c = counting.child::<()>();

        b.fail(RequestError::failed("first"));
        executor.submit_and_wait(|| ()).unwrap();
        c.fail(RequestError::failed("second"));
        executor.submit_and_wait(|| ()).unwrap();
        a.done();
        assert_eq!(recv(&rx), Err(RequestError::failed("first")));
    }

    #[test]
    fn test_counting_monitor_with_no_children_completes_immediately() {
        let executor = executor();
        let (parent, rx) = recording::<()>(&executor);
        let _counting = CountingRequestMonitor::new(parent, 0);
        assert_eq!(recv(&rx), Ok(()));
    }
}
