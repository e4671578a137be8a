use crate::{Executor, RequestError, RequestMonitor, RequestResult};
use parking_lot::Mutex;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// One asynchronous unit of work inside a [`Sequence`].
pub trait Step: Send + 'static {
    fn name(&self) -> &str {
        ""
    }

    fn execute(&mut self, rm: RequestMonitor);

    /// Undoes the effect of a successful `execute`. Invoked only when a later step fails.
    fn rollback(&mut self, rm: RequestMonitor) {
        rm.done();
    }
}

type StepFn = Box<dyn FnMut(RequestMonitor) + Send>;

pub struct FnStep {
    name: String,
    execute: StepFn,
    rollback: Option<StepFn>,
}

pub fn step(name: impl Into<String>, execute: impl FnMut(RequestMonitor) + Send + 'static) -> FnStep {
    FnStep {
        name: name.into(),
        execute: Box::new(execute),
        rollback: None,
    }
}

impl FnStep {
    pub fn with_rollback(mut self, rollback: impl FnMut(RequestMonitor) + Send + 'static) -> Self {
        self.rollback = Some(Box::new(rollback));
        self
    }

    pub fn boxed(self) -> Box<dyn Step> {
        Box::new(self)
    }
}

impl Step for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, rm: RequestMonitor) {
        (self.execute)(rm)
    }

    fn rollback(&mut self, rm: RequestMonitor) {
        match &mut self.rollback {
            Some(rollback) => rollback(rm),
            None => rm.done(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceState {
    NotStarted,
    Running(usize),
    RollingBack(usize),
    Done,
    Failed,
    Cancelled,
}

impl SequenceState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Runs steps strictly in order on an executor. When step `i` fails or the sequence is
/// cancelled, steps `i - 1` down to `0` are rolled back in reverse order and the sequence
/// monitor completes with the failure that started the rollback.
#[derive(Clone)]
pub struct Sequence {
    inner: Arc<SequenceInner>,
}

struct SequenceInner {
    name: String,
    executor: Executor,
    rm: RequestMonitor,
    driver: Mutex<Driver>,
}

struct Driver {
    steps: Vec<Option<Box<dyn Step>>>,
    state: SequenceState,
    cancel_requested: bool,
    current_rm: Option<RequestMonitor>,
    failure: Option<RequestError>,
}

impl Sequence {
    pub fn new(
        executor: &Executor,
        name: impl Into<String>,
        steps: Vec<Box<dyn Step>>,
        rm: RequestMonitor,
    ) -> Self {
        Self {
            inner: Arc::new(SequenceInner {
                name: name.into(),
                executor: executor.clone(),
                rm,
                driver: Mutex::new(Driver {
                    steps: steps.into_iter().map(Some).collect(),
                    state: SequenceState::NotStarted,
                    cancel_requested: false,
                    current_rm: None,
                    failure: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> SequenceState {
        self.inner.driver.lock().state
    }

    pub fn start(&self) {
        let this = self.inner.clone();
        self.inner.executor.submit(move || {
            if this.driver.lock().state != SequenceState::NotStarted {
                log::error!("sequence {} started twice", this.name);
                return;
            }
            if this.should_cancel() {
                this.finish(SequenceState::Cancelled, Err(RequestError::Cancelled));
                return;
            }
            log::debug!("sequence {} started", this.name);
            this.execute_step(0);
        });
    }

    /// Stops the sequence at the next step boundary. The running step's monitor is
    /// cancelled, which the step may observe to stop early.
    pub fn cancel(&self) {
        let current = {
            let mut driver = self.inner.driver.lock();
            if driver.state.is_finished() {
                return;
            }
            driver.cancel_requested = true;
            driver.current_rm.clone()
        };
        if let Some(rm) = current {
            rm.cancel();
        }
    }
}

impl SequenceInner {
    fn should_cancel(&self) -> bool {
        self.driver.lock().cancel_requested || self.rm.is_cancelled()
    }

    fn execute_step(self: &Arc<Self>, index: usize) {
        if self.should_cancel() {
            self.begin_rollback(index, RequestError::Cancelled);
            return;
        }

        let mut step = {
            let mut driver = self.driver.lock();
            match driver.steps.get_mut(index) {
                None => {
                    drop(driver);
                    self.finish(SequenceState::Done, Ok(()));
                    return;
                }
                Some(slot) => match slot.take() {
                    Some(step) => {
                        driver.state = SequenceState::Running(index);
                        step
                    }
                    None => {
                        drop(driver);
                        log::error!("sequence {} re-entered step {index}", self.name);
                        self.begin_rollback(index, RequestError::Internal("step re-entered".into()));
                        return;
                    }
                },
            }
        };

        let step_rm = RequestMonitor::new_child(&self.rm, {
            let this = self.clone();
            move |result| this.step_finished(index, result)
        });
        self.driver.lock().current_rm = Some(step_rm.clone());

        log::debug!("sequence {} executing step {index} {}", self.name, step.name());
        let result = panic::catch_unwind(AssertUnwindSafe(|| step.execute(step_rm.clone())));
        self.driver.lock().steps[index] = Some(step);

        if let Err(payload) = result {
            let message = util::panic_message(payload.as_ref());
            log::error!("sequence {} step {index} panicked: {message}", self.name);
            if !step_rm.is_done() {
                step_rm.fail(RequestError::Internal(message));
            }
        }
    }

    fn step_finished(self: &Arc<Self>, index: usize, result: RequestResult<()>) {
        self.driver.lock().current_rm = None;
        match result {
            Ok(()) => self.execute_step(index + 1),
            Err(error) => {
                log::debug!("sequence {} step {index} failed: {error}", self.name);
                self.begin_rollback(index, error);
            }
        }
    }

    /// Rolls back the first `count` steps, last one first.
    fn begin_rollback(self: &Arc<Self>, count: usize, error: RequestError) {
        self.driver.lock().failure = Some(error);
        self.rollback_step(count);
    }

    fn rollback_step(self: &Arc<Self>, remaining: usize) {
        let Some(index) = remaining.checked_sub(1) else {
            let (state, error) = {
                let mut driver = self.driver.lock();
                let error = driver.failure.take().unwrap_or(RequestError::Cancelled);
                let state = if error.is_cancelled() {
                    SequenceState::Cancelled
                } else {
                    SequenceState::Failed
                };
                (state, error)
            };
            self.finish(state, Err(error));
            return;
        };

        let step = {
            let mut driver = self.driver.lock();
            driver.state = SequenceState::RollingBack(index);
            driver.steps[index].take()
        };
        let Some(mut step) = step else {
            log::error!("sequence {} lost step {index} before rollback", self.name);
            self.rollback_step(index);
            return;
        };

        let rollback_rm = RequestMonitor::new(&self.executor, {
            let this = self.clone();
            let name = step.name().to_string();
            move |result| {
                if let Err(error) = result {
                    log::warn!("sequence {} rollback of step {index} {name} failed: {error}", this.name);
                }
                this.rollback_step(index);
            }
        });

        log::debug!("sequence {} rolling back step {index} {}", self.name, step.name());
        let result = panic::catch_unwind(AssertUnwindSafe(|| step.rollback(rollback_rm.clone())));
        self.driver.lock().steps[index] = Some(step);
        if let Err(payload) = result {
            if !rollback_rm.is_done() {
                rollback_rm.fail(RequestError::Internal(util::panic_message(payload.as_ref())));
            }
        }
    }

    fn finish(&self, state: SequenceState, result: RequestResult<()>) {
        self.driver.lock().state = state;
        log::debug!("sequence {} finished: {state:?}", self.name);
        self.rm.complete(result);
    }
}
