use crate::{
    control::{CommandControl, PendingCommand, QueuedCommand, Resolution},
    Command, CommandEvent, CommandHandle, CommandId, CommandInfo, CommandOutput,
    DataRequestMonitor, Executor, IoKind, Protocol, Record, RequestError, RequestMonitor,
    ServiceRegistration, ServicesTracker, SessionEvent, SessionSettings, Transport,
    TransportEvent, TransportIo,
};
use anyhow::{anyhow, Context as _, Result};
use futures::channel::oneshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering::SeqCst},
        Arc, Weak,
    },
    time::Duration,
};

type Listener = Arc<dyn Send + Sync + Fn(&SessionEvent)>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Initializing,
    Active,
    Terminating,
    Terminated,
}

impl SessionState {
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }
}

/// One connection to a debugger.
///
/// The session owns an executor that is the only writer of its state: commands, records
/// from the transport, timeouts and shutdown all run as tasks on it. Every method may be
/// called from any thread unless documented otherwise.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    executor: Executor,
    protocol: Arc<dyn Protocol>,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    transport: Mutex<Option<Arc<Transport>>>,
    control: Mutex<CommandControl>,
    services: Mutex<ServicesTracker>,
    listeners: Mutex<Vec<(usize, Listener)>>,
    next_listener_id: AtomicUsize,
    next_command_id: AtomicU64,
    shutdown_waiters: Mutex<Vec<RequestMonitor>>,
}

/// Keeps a listener registered until dropped.
#[must_use]
pub struct Subscription {
    id: Option<usize>,
    session: Weak<SessionInner>,
}

impl Session {
    pub fn connect(
        io: TransportIo,
        protocol: Arc<dyn Protocol>,
        settings: SessionSettings,
    ) -> Result<Self> {
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, SeqCst));
        let executor = Executor::new(format!("session-{id}"))?;
        let inner = Arc::new(SessionInner {
            id,
            executor: executor.clone(),
            protocol: protocol.clone(),
            control: Mutex::new(CommandControl::new(
                settings.max_outstanding_commands,
                settings.accumulated_record_limit,
            )),
            settings,
            state: Mutex::new(SessionState::Initializing),
            transport: Mutex::new(None),
            services: Mutex::new(ServicesTracker::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicUsize::new(0),
            next_command_id: AtomicU64::new(1),
            shutdown_waiters: Mutex::new(Vec::new()),
        });

        let transport = Transport::start(
            format!("{}-{id}", protocol.name()),
            io,
            &executor,
            protocol,
            inner.settings.log_protocol_communications,
            {
                let session = Arc::downgrade(&inner);
                move |event| {
                    if let Some(session) = session.upgrade() {
                        session.handle_transport_event(event);
                    }
                }
            },
        )
        .with_context(|| format!("failed to start transport for session {id}"))?;
        *inner.transport.lock() = Some(Arc::new(transport));

        executor.submit({
            let inner = inner.clone();
            move || {
                if *inner.state.lock() == SessionState::Initializing {
                    inner.set_state(SessionState::Active);
                    inner.process_next();
                }
            }
        });
        log::info!("session {id} connected");
        Ok(Self { inner })
    }

    pub fn launch(
        binary: &Path,
        args: &[String],
        cwd: Option<&Path>,
        protocol: Arc<dyn Protocol>,
        settings: SessionSettings,
    ) -> Result<Self> {
        let io = TransportIo::spawn(binary, args, cwd)?;
        Self::connect(io, protocol, settings)
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Queues `command`; `rm` receives its decoded result.
    ///
    /// Commands are sent in the order they were queued. Once the session is shutting down
    /// new commands fail with `Disconnected` without reaching the debugger.
    pub fn queue_command<C: Command>(
        &self,
        command: C,
        rm: DataRequestMonitor<C::Output>,
    ) -> CommandHandle {
        let id = CommandId(self.inner.next_command_id.fetch_add(1, SeqCst));
        let handle = CommandHandle { id };
        if self.state().is_shutting_down() {
            rm.fail(RequestError::Disconnected);
            return handle;
        }
        let info = CommandInfo {
            id,
            token: None,
            operation: command.operation(),
            context: command.context().clone(),
        };
        let queued = QueuedCommand::new(info, command, rm);
        let inner = self.inner.clone();
        self.inner.executor.submit(move || inner.enqueue(queued));
        handle
    }

    /// Removes a command that has not been sent yet, failing it with `Cancelled`. Commands
    /// already sent are unaffected.
    pub fn remove_command(&self, handle: CommandHandle) {
        let inner = self.inner.clone();
        self.inner.executor.submit(move || {
            let removed = inner.control.lock().remove(handle.id);
            if let Some(command) = removed {
                inner.emit(&SessionEvent::Command(CommandEvent::Removed(command.info.clone())));
                command.complete(Err(RequestError::Cancelled));
            }
        });
    }

    pub fn add_listener(&self, listener: impl Send + Sync + Fn(&SessionEvent) + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, SeqCst);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id: Some(id),
            session: Arc::downgrade(&self.inner),
        }
    }

    pub fn on_io(&self, handler: impl Send + Sync + Fn(IoKind, &str) + 'static) {
        if let Some(transport) = self.inner.transport.lock().as_ref() {
            transport.on_io(handler);
        }
    }

    pub fn get_service<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner.services.lock().get::<T>()
    }

    pub fn get_services<T: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        self.inner.services.lock().get_all::<T>()
    }

    pub fn require_service<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, RequestError> {
        self.inner.services.lock().require::<T>()
    }

    /// Must be called on the session executor.
    pub fn register_service<T: ?Sized + Send + Sync + 'static>(
        &self,
        service: Arc<T>,
        priority: i32,
    ) -> Result<ServiceRegistration, RequestError> {
        self.inner.executor.assert_in_executor_thread();
        if self.state().is_shutting_down() {
            return Err(RequestError::InvalidState(format!(
                "session {} is shutting down",
                self.inner.id
            )));
        }
        Ok(self.inner.services.lock().register(service, priority))
    }

    /// Must be called on the session executor.
    pub fn unregister_service(&self, registration: ServiceRegistration) -> bool {
        self.inner.executor.assert_in_executor_thread();
        self.inner.services.lock().unregister(registration)
    }

    /// Shuts the session down. `rm` completes once the session is terminated: every
    /// queued and pending command has failed with `Disconnected`, the transport is
    /// disconnected and every service is unregistered.
    pub fn shutdown(&self, rm: RequestMonitor) {
        let inner = self.inner.clone();
        self.inner
            .executor
            .submit(move || inner.begin_shutdown("session shut down".into(), Some(rm)));
    }

    pub fn shutdown_and_wait(&self) -> Result<()> {
        if self.inner.executor.is_executor_thread() {
            return Err(anyhow!(
                "shutdown_and_wait called from the executor of session {}",
                self.inner.id
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.shutdown(RequestMonitor::new(&self.inner.executor, move |result| {
            tx.send(result).ok();
        }));
        smol::block_on(async {
            rx.await
                .map_err(|_| anyhow!("session {} dropped its shutdown", self.inner.id))??;
            let transport = self.inner.transport.lock().clone();
            if let Some(output_done) = transport.and_then(|transport| transport.output_done()) {
                output_done.await;
            }
            Ok::<_, anyhow::Error>(())
        })
    }

    /// Number of commands waiting to be sent and awaiting a reply.
    pub fn command_counts(&self) -> Result<(usize, usize)> {
        let inner = self.inner.clone();
        self.inner.executor.submit_and_wait(move || {
            let control = inner.control.lock();
            (control.queued_len(), control.outstanding())
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn enqueue(self: &Arc<Self>, command: QueuedCommand) {
        if self.state.lock().is_shutting_down() {
            command.complete(Err(RequestError::Disconnected));
            return;
        }
        self.emit(&SessionEvent::Command(CommandEvent::Queued(command.info.clone())));
        self.control.lock().enqueue(command);
        self.process_next();
    }

    /// Sends queued commands while the window of outstanding commands has room.
    fn process_next(self: &Arc<Self>) {
        loop {
            if *self.state.lock() != SessionState::Active {
                return;
            }
            let Some(command) = self.control.lock().pop_sendable() else {
                return;
            };
            if command.is_cancelled() {
                self.emit(&SessionEvent::Command(CommandEvent::Removed(command.info.clone())));
                command.complete(Err(RequestError::Cancelled));
                continue;
            }
            if command.expects_reply {
                self.send_with_reply(command);
            } else {
                self.send_raw(command);
            }
        }
    }

    fn send_with_reply(self: &Arc<Self>, command: QueuedCommand) {
        let allocated = self.control.lock().allocate_token();
        let token = match allocated {
            Ok(token) => token,
            Err(error) => {
                self.fail_queued(command, error);
                return;
            }
        };
        let encoded = self.guard_protocol("encode", || {
            self.protocol.encode(Some(token), &command.info.operation)
        });
        let message = match encoded {
            Ok(message) => message,
            Err(error) => {
                self.fail_queued(command, error);
                return;
            }
        };
        let timeout = command.timeout.or_else(|| self.settings.command_timeout());
        let timer = timeout.map(|timeout| {
            let session = Arc::downgrade(self);
            let id = command.info.id;
            self.executor.schedule(timeout, move || {
                if let Some(session) = session.upgrade() {
                    session.handle_timeout(id, timeout);
                }
            })
        });

        let pending = command.into_pending(token, timer);
        let info = pending.info.clone();
        let registered = self.control.lock().register_sent(token, pending);
        if let Err((error, pending)) = registered {
            self.finish_command(pending, Err(error));
            return;
        }

        if let Err(error) = self.send(message) {
            log::warn!("session {} failed to send {}: {error:#}", self.id, info.operation);
            let resolution = self.control.lock().resolve(token);
            if let Resolution::Matched(pending) = resolution {
                self.finish_command(pending, Err(RequestError::Disconnected));
            }
            return;
        }
        self.emit(&SessionEvent::Command(CommandEvent::Sent(info)));
    }

    fn send_raw(&self, command: QueuedCommand) {
        let encoded = self.guard_protocol("encode", || {
            self.protocol.encode(None, &command.info.operation)
        });
        let message = match encoded {
            Ok(message) => message,
            Err(error) => {
                self.fail_queued(command, error);
                return;
            }
        };
        let info = command.info.clone();
        let result = match self.send(message) {
            Ok(()) => {
                self.emit(&SessionEvent::Command(CommandEvent::Sent(info)));
                Ok(CommandOutput::default())
            }
            Err(error) => {
                log::warn!("session {} failed to send {}: {error:#}", self.id, info.operation);
                Err(RequestError::Disconnected)
            }
        };
        let (info, status) = command.complete(result);
        self.emit(&SessionEvent::Command(CommandEvent::Done(info, status)));
    }

    fn fail_queued(&self, command: QueuedCommand, error: RequestError) {
        let (info, status) = command.complete(Err(error));
        self.emit(&SessionEvent::Command(CommandEvent::Done(info, status)));
    }

    /// Runs a protocol callback, turning a panic into an internal error for the command
    /// it was working on.
    fn guard_protocol<R>(&self, what: &str, f: impl FnOnce() -> R) -> Result<R, RequestError> {
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
            let message = util::panic_message(payload.as_ref());
            log::error!(
                "session {} protocol {} panicked in {what}: {message}",
                self.id,
                self.protocol.name()
            );
            RequestError::Internal(message)
        })
    }

    fn send(&self, message: Vec<u8>) -> Result<()> {
        let transport = self.transport.lock().clone();
        transport
            .ok_or_else(|| anyhow!("session {} has no transport", self.id))?
            .send(message)
    }

    fn finish_command(&self, command: PendingCommand, result: Result<CommandOutput, RequestError>) {
        let (info, status) = command.complete(result);
        self.emit(&SessionEvent::Command(CommandEvent::Done(info, status)));
    }

    fn handle_timeout(self: &Arc<Self>, id: CommandId, timeout: Duration) {
        let Some(command) = self.control.lock().time_out(id) else {
            return;
        };
        log::warn!(
            "session {} command {} timed out after {timeout:?}",
            self.id,
            command.info.operation
        );
        self.finish_command(command, Err(RequestError::Timeout(timeout)));
        self.process_next();
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Record(record) => self.handle_record(record),
            TransportEvent::Closed { reason } => self.begin_shutdown(reason, None),
        }
    }

    fn handle_record(self: &Arc<Self>, record: Record) {
        if *self.state.lock() == SessionState::Terminated {
            log::debug!("session {} dropped record after termination", self.id);
            return;
        }
        match record {
            Record::Result(result) => {
                let Some(token) = result.token else {
                    self.emit(&SessionEvent::UnsolicitedResult(result));
                    return;
                };
                let resolution = self.control.lock().resolve(token);
                match resolution {
                    Resolution::Matched(command) => {
                        let oob = self.control.lock().take_oob();
                        let failure = self.guard_protocol("error_from_result", || {
                            self.protocol.error_from_result(&result)
                        });
                        let outcome = match failure {
                            Ok(None) => Ok(CommandOutput {
                                oob,
                                record: Some(result),
                            }),
                            Ok(Some(error)) | Err(error) => Err(error),
                        };
                        self.finish_command(command, outcome);
                        self.process_next();
                    }
                    Resolution::Late => {}
                    Resolution::Unknown => self.emit(&SessionEvent::UnsolicitedResult(result)),
                }
            }
            Record::Async(mut record) => {
                {
                    let mut control = self.control.lock();
                    control.push_oob(Record::Async(record.clone()));
                    record.streams = control.recent_streams();
                }
                let event = self
                    .guard_protocol("event_for", || self.protocol.event_for(&record))
                    .unwrap_or_else(|_| SessionEvent::Notification(record.clone()));
                self.emit(&event);
            }
            Record::Stream(record) => {
                self.control.lock().push_oob(Record::Stream(record.clone()));
                self.emit(&SessionEvent::Stream(record));
            }
        }
    }

    fn begin_shutdown(self: &Arc<Self>, reason: String, waiter: Option<RequestMonitor>) {
        let state = *self.state.lock();
        if state == SessionState::Terminated {
            if let Some(waiter) = waiter {
                waiter.done();
            }
            return;
        }
        if let Some(waiter) = waiter {
            self.shutdown_waiters.lock().push(waiter);
        }
        if state == SessionState::Terminating {
            return;
        }

        log::info!("session {} shutting down: {reason}", self.id);
        self.set_state(SessionState::Terminating);
        let inner = self.clone();
        self.executor.submit(move || inner.finish_shutdown(reason));
    }

    fn finish_shutdown(&self, reason: String) {
        let (queued, pending) = self.control.lock().drain();
        for command in queued {
            self.emit(&SessionEvent::Command(CommandEvent::Removed(command.info.clone())));
            command.complete(Err(RequestError::Disconnected));
        }
        for command in pending {
            self.finish_command(command, Err(RequestError::Disconnected));
        }

        let transport = self.transport.lock().clone();
        if let Some(transport) = transport {
            transport.disconnect();
        }
        self.services.lock().clear();
        self.set_state(SessionState::Terminated);
        self.emit(&SessionEvent::Terminated { reason });
        log::info!("session {} terminated", self.id);

        let waiters = std::mem::take(&mut *self.shutdown_waiters.lock());
        for waiter in waiters {
            waiter.done();
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        self.emit(&SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: &SessionEvent) {
        debug_assert!(self.executor.is_executor_thread());
        let listeners = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();
        for listener in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                log::error!(
                    "session {} listener panicked on {event:?}: {}",
                    self.id,
                    util::panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl Subscription {
    pub fn detach(mut self) {
        self.id.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some((id, session)) = self.id.zip(self.session.upgrade()) {
            session.listeners.lock().retain(|(listener_id, _)| *listener_id != id);
        }
    }
}

/// Lets command consumers such as the command cache target a session or a stand-in.
pub trait CommandSink: Clone + Send + Sync + 'static {
    fn executor(&self) -> &Executor;

    fn queue_command<C: Command>(&self, command: C, rm: DataRequestMonitor<C::Output>) -> CommandHandle;
}

impl CommandSink for Session {
    fn executor(&self) -> &Executor {
        Session::executor(self)
    }

    fn queue_command<C: Command>(&self, command: C, rm: DataRequestMonitor<C::Output>) -> CommandHandle {
        Session::queue_command(self, command, rm)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        test_support::FakeDebugger, AsyncKind, AsyncRecord, ExecutionContext, ResultClass,
        ResultRecord, Token,
    };
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;

    /// Lines are `<token> <operation>`; replies are `<token> ok|err <text>`; `* <class>` is
    /// an async record. The operation `unencodable` and the reply text `panic` make the
    /// protocol panic.
    struct LineProtocol;

    impl Protocol for LineProtocol {
        fn name(&self) -> &str {
            "line"
        }

        fn decode(&self, line: &str) -> Result<Option<Record>> {
            let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
            if head == "*" {
                return Ok(Some(Record::Async(AsyncRecord {
                    token: None,
                    kind: AsyncKind::Exec,
                    class: rest.to_string(),
                    results: Default::default(),
                    streams: Vec::new(),
                })));
            }
            let token = head.parse().context("invalid token")?;
            let (class, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let mut results = serde_json::Map::new();
            results.insert("text".into(), text.into());
            Ok(Some(Record::Result(ResultRecord {
                token: Some(Token(token)),
                class: if class == "err" {
                    ResultClass::Error
                } else {
                    ResultClass::Done
                },
                results,
            })))
        }

        fn encode(&self, token: Option<Token>, operation: &str) -> Vec<u8> {
            if operation == "unencodable" {
                panic!("cannot encode {operation}");
            }
            match token {
                Some(token) => format!("{token} {operation}\n").into_bytes(),
                None => format!("{operation}\n").into_bytes(),
            }
        }

        fn error_from_result(&self, record: &ResultRecord) -> Option<RequestError> {
            if record.get_str("text") == Some("panic") {
                panic!("cannot classify reply");
            }
            (record.class == ResultClass::Error)
                .then(|| RequestError::failed(record.get_str("text").unwrap_or_default()))
        }
    }

    struct Say {
        text: String,
        context: ExecutionContext,
        raw: bool,
    }

    fn say(text: &str) -> Say {
        Say {
            text: text.into(),
            context: ExecutionContext::root(),
            raw: false,
        }
    }

    impl Command for Say {
        type Output = String;

        fn operation(&self) -> String {
            self.text.clone()
        }

        fn context(&self) -> &ExecutionContext {
            &self.context
        }

        fn decode(&self, output: &CommandOutput) -> Result<String, RequestError> {
            match &output.record {
                Some(record) => Ok(record.get_str("text").unwrap_or_default().to_string()),
                None => Ok(String::new()),
            }
        }

        fn expects_reply(&self) -> bool {
            !self.raw
        }
    }

    fn connect(settings: SessionSettings) -> (Session, FakeDebugger) {
        let (io, fake) = FakeDebugger::new().unwrap();
        let session = Session::connect(io, Arc::new(LineProtocol), settings).unwrap();
        (session, fake)
    }

    fn monitor(session: &Session) -> (DataRequestMonitor<String>, mpsc::Receiver<Result<String, RequestError>>) {
        let (tx, rx) = mpsc::channel();
        let rm = DataRequestMonitor::new(session.executor(), move |result| {
            tx.send(result).ok();
        });
        (rm, rx)
    }

    fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_replies_are_routed_by_token() {
        let (session, mut fake) = connect(SessionSettings::default());
        let (first_rm, first_rx) = monitor(&session);
        let (second_rm, second_rx) = monitor(&session);
        session.queue_command(say("first"), first_rm);
        session.queue_command(say("second"), second_rm);

        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "1 first");
            assert_eq!(fake.receive_line().await.unwrap(), "2 second");
            fake.send_line("2 ok two").await.unwrap();
            fake.send_line("1 ok one").await.unwrap();
        });
        assert_eq!(recv(&second_rx), Ok("two".to_string()));
        assert_eq!(recv(&first_rx), Ok("one".to_string()));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_unmatched_replies_are_reported_and_session_continues() {
        let (session, mut fake) = connect(SessionSettings::default());
        let unsolicited = Arc::new(Mutex::new(Vec::new()));
        session
            .add_listener({
                let unsolicited = unsolicited.clone();
                move |event| {
                    if let SessionEvent::UnsolicitedResult(record) = event {
                        unsolicited
                            .lock()
                            .push((record.token, record.get_str("text").unwrap_or_default().to_string()));
                    }
                }
            })
            .detach();

        let (first_rm, first_rx) = monitor(&session);
        session.queue_command(say("first"), first_rm);
        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "1 first");
            fake.send_line("1 ok one").await.unwrap();
            fake.send_line("1 ok again").await.unwrap();
            fake.send_line("9 ok stray").await.unwrap();
        });
        assert_eq!(recv(&first_rx), Ok("one".to_string()));

        let (second_rm, second_rx) = monitor(&session);
        session.queue_command(say("second"), second_rm);
        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "2 second");
            fake.send_line("2 ok two").await.unwrap();
        });
        assert_eq!(recv(&second_rx), Ok("two".to_string()));

        assert_eq!(
            *unsolicited.lock(),
            vec![
                (Some(Token(1)), "again".to_string()),
                (Some(Token(9)), "stray".to_string()),
            ]
        );
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_protocol_panics_fail_the_affected_command() {
        let (session, mut fake) = connect(SessionSettings {
            command_timeout: 300,
            ..Default::default()
        });

        let (rm, rx) = monitor(&session);
        session.queue_command(say("classify"), rm);
        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "1 classify");
            fake.send_line("1 ok panic").await.unwrap();
        });
        assert_eq!(
            recv(&rx),
            Err(RequestError::Internal("cannot classify reply".into()))
        );

        let (rm, rx) = monitor(&session);
        session.queue_command(say("unencodable"), rm);
        assert_eq!(
            recv(&rx),
            Err(RequestError::Internal("cannot encode unencodable".into()))
        );

        let (rm, rx) = monitor(&session);
        session.queue_command(say("after"), rm);
        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "3 after");
            fake.send_line("3 ok fine").await.unwrap();
        });
        assert_eq!(recv(&rx), Ok("fine".to_string()));
        assert_eq!(session.command_counts().unwrap(), (0, 0));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_window_holds_back_excess_commands() {
        let (session, mut fake) = connect(SessionSettings {
            max_outstanding_commands: 1,
            ..Default::default()
        });
        let (first_rm, first_rx) = monitor(&session);
        let (second_rm, second_rx) = monitor(&session);
        session.queue_command(say("first"), first_rm);
        session.queue_command(say("second"), second_rm);

        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "1 first");
        });
        assert_eq!(session.command_counts().unwrap(), (1, 1));

        smol::block_on(async {
            fake.send_line("1 ok").await.unwrap();
            assert_eq!(fake.receive_line().await.unwrap(), "2 second");
            fake.send_line("2 err bad-arg").await.unwrap();
        });
        assert_eq!(recv(&first_rx), Ok(String::new()));
        assert_eq!(recv(&second_rx), Err(RequestError::failed("bad-arg")));
    }

    #[test]
    fn test_events_and_command_lifecycle_reach_listeners() {
        let (session, mut fake) = connect(SessionSettings::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        session
            .add_listener({
                let events = events.clone();
                move |event| events.lock().push(event.clone())
            })
            .detach();
        let _panicking = session.add_listener(|_| panic!("listener failure"));

        let (rm, rx) = monitor(&session);
        session.queue_command(say("run"), rm);
        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "1 run");
            fake.send_line("* stopped").await.unwrap();
            fake.send_line("1 ok").await.unwrap();
        });
        recv(&rx).unwrap();
        session.executor().submit_and_wait(|| ()).unwrap();

        let events = events.lock();
        let summary = events
            .iter()
            .filter(|event| !matches!(event, SessionEvent::StateChanged(_)))
            .map(|event| match event {
                SessionEvent::Command(CommandEvent::Queued(info)) => format!("queued {}", info.operation),
                SessionEvent::Command(CommandEvent::Sent(info)) => {
                    format!("sent {} {:?}", info.operation, info.token)
                }
                SessionEvent::Command(CommandEvent::Done(info, status)) => {
                    format!("done {} {status:?}", info.operation)
                }
                SessionEvent::Notification(record) => format!("notify {}", record.class),
                other => format!("{other:?}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                "queued run",
                "sent run Some(Token(1))",
                "notify stopped",
                "done run Ok",
            ]
        );
    }

    #[test]
    fn test_raw_commands_complete_once_written() {
        let (session, mut fake) = connect(SessionSettings::default());
        let (rm, rx) = monitor(&session);
        session.queue_command(
            Say {
                raw: true,
                ..say("interrupt")
            },
            rm,
        );
        assert_eq!(recv(&rx), Ok(String::new()));
        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "interrupt");
        });
    }

    #[test]
    fn test_remove_command_before_send() {
        let (session, mut fake) = connect(SessionSettings {
            max_outstanding_commands: 1,
            ..Default::default()
        });
        let (first_rm, _first_rx) = monitor(&session);
        let (second_rm, second_rx) = monitor(&session);
        let (third_rm, third_rx) = monitor(&session);
        session.queue_command(say("first"), first_rm);
        let second = session.queue_command(say("second"), second_rm);
        session.queue_command(say("third"), third_rm.clone());
        third_rm.cancel();
        session.remove_command(second);

        assert_eq!(recv(&second_rx), Err(RequestError::Cancelled));
        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "1 first");
            fake.send_line("1 ok").await.unwrap();
        });
        assert_eq!(recv(&third_rx), Err(RequestError::Cancelled));
    }

    #[test]
    fn test_shutdown_fails_pending_commands_and_clears_services() {
        let (session, mut fake) = connect(SessionSettings::default());
        let (rm, rx) = monitor(&session);
        session.queue_command(say("wait"), rm);
        smol::block_on(async {
            assert_eq!(fake.receive_line().await.unwrap(), "1 wait");
        });

        let service = session
            .executor()
            .submit_and_wait({
                let session = session.clone();
                move || session.register_service(Arc::new(String::from("registers")), 0)
            })
            .unwrap();
        assert!(service.is_ok());
        assert_eq!(*session.get_service::<String>().unwrap(), "registers");

        session.shutdown_and_wait().unwrap();
        assert_eq!(recv(&rx), Err(RequestError::Disconnected));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.get_service::<String>().is_none());

        let (late_rm, late_rx) = monitor(&session);
        session.queue_command(say("late"), late_rm);
        assert_eq!(recv(&late_rx), Err(RequestError::Disconnected));
        assert_eq!(smol::block_on(fake.receive_line()), None);
    }

    #[test]
    fn test_debugger_exit_terminates_session() {
        let (session, fake) = connect(SessionSettings::default());
        let (tx, rx) = mpsc::channel();
        let _subscription = session.add_listener(move |event| {
            if let SessionEvent::Terminated { reason } = event {
                tx.send(reason.clone()).ok();
            }
        });
        fake.close();
        assert_eq!(recv(&rx), "debugger closed its output");
        assert_eq!(session.state(), SessionState::Terminated);
    }
}
