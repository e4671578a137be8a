use crate::{Executor, Protocol, Record};
use anyhow::{anyhow, Context, Result};
use futures::{AsyncRead, AsyncWrite};
use parking_lot::{Mutex, RwLock};
use postage::{barrier, prelude::Stream};
use smol::{
    channel,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    process::{Child, Command},
};
use std::{
    path::Path,
    process::Stdio,
    sync::Arc,
    thread,
};
use util::ResultExt;

type IoHandler = Box<dyn Send + Sync + Fn(IoKind, &str)>;
type EventHandler = Arc<dyn Send + Sync + Fn(TransportEvent)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Send,
    Receive,
    Stderr,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Record(Record),
    Closed { reason: String },
}

/// The byte streams of a debugger, and the process owning them if there is one.
pub struct TransportIo {
    pub stdin: Box<dyn AsyncWrite + Unpin + Send>,
    pub stdout: Box<dyn AsyncRead + Unpin + Send>,
    pub stderr: Option<Box<dyn AsyncRead + Unpin + Send>>,
    pub process: Option<Child>,
}

impl TransportIo {
    pub fn new<Stdin, Stdout>(stdin: Stdin, stdout: Stdout) -> Self
    where
        Stdin: AsyncWrite + Unpin + Send + 'static,
        Stdout: AsyncRead + Unpin + Send + 'static,
    {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: None,
            process: None,
        }
    }

    pub fn spawn(binary: &Path, args: &[String], cwd: Option<&Path>) -> Result<Self> {
        let mut command = Command::new(binary);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let mut process = command
            .spawn()
            .with_context(|| format!("failed to spawn debugger {binary:?}"))?;
        let stdin = process.stdin.take().context("debugger has no stdin")?;
        let stdout = process.stdout.take().context("debugger has no stdout")?;
        let stderr = process.stderr.take().context("debugger has no stderr")?;
        log::info!("spawned debugger {binary:?} with pid {}", process.id());
        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Some(Box::new(stderr)),
            process: Some(process),
        })
    }
}

/// Moves lines between a debugger and a session executor.
///
/// A reader thread decodes every line of output and submits one executor task per record.
/// A writer thread drains the outbound channel. Once output ends, a single
/// [`TransportEvent::Closed`] is submitted.
pub struct Transport {
    name: String,
    executor: Executor,
    outbound_tx: channel::Sender<Vec<u8>>,
    io_handlers: Arc<RwLock<Vec<IoHandler>>>,
    process: Mutex<Option<Child>>,
    output_done_rx: Mutex<Option<barrier::Receiver>>,
    log_traffic: bool,
}

impl Transport {
    pub fn start(
        name: impl Into<String>,
        io: TransportIo,
        executor: &Executor,
        protocol: Arc<dyn Protocol>,
        log_traffic: bool,
        on_event: impl Send + Sync + Fn(TransportEvent) + 'static,
    ) -> Result<Self> {
        let name = name.into();
        let TransportIo {
            stdin,
            stdout,
            stderr,
            process,
        } = io;
        let on_event: EventHandler = Arc::new(on_event);
        let io_handlers = Arc::new(RwLock::new(Vec::<IoHandler>::new()));
        let (outbound_tx, outbound_rx) = channel::unbounded::<Vec<u8>>();
        let (output_done_tx, output_done_rx) = barrier::channel();

        thread::Builder::new()
            .name(format!("{name}-reader"))
            .spawn({
                let executor = executor.clone();
                let io_handlers = io_handlers.clone();
                let name = name.clone();
                move || {
                    let reason = smol::block_on(read_records(
                        &name,
                        stdout,
                        protocol.as_ref(),
                        &executor,
                        &on_event,
                        &io_handlers,
                        log_traffic,
                    ));
                    log::info!("{name} output closed: {reason}");
                    executor.submit(move || on_event(TransportEvent::Closed { reason }));
                }
            })
            .context("failed to spawn transport reader")?;

        thread::Builder::new()
            .name(format!("{name}-writer"))
            .spawn(move || {
                smol::block_on(async move {
                    let mut stdin = BufWriter::new(stdin);
                    while let Ok(message) = outbound_rx.recv().await {
                        stdin.write_all(&message).await?;
                        stdin.flush().await?;
                    }
                    stdin.close().await.ok();
                    drop(output_done_tx);
                    Ok::<_, anyhow::Error>(())
                })
                .log_err();
            })
            .context("failed to spawn transport writer")?;

        if let Some(stderr) = stderr {
            thread::Builder::new()
                .name(format!("{name}-stderr"))
                .spawn({
                    let io_handlers = io_handlers.clone();
                    let name = name.clone();
                    move || {
                        smol::block_on(async move {
                            let mut stderr = BufReader::new(stderr);
                            let mut buffer = Vec::new();
                            loop {
                                buffer.clear();
                                if stderr.read_until(b'\n', &mut buffer).await? == 0 {
                                    break;
                                }
                                let line = String::from_utf8_lossy(&buffer);
                                let line = line.trim_end();
                                log::debug!("{name} stderr: {line}");
                                notify_io(&io_handlers, IoKind::Stderr, line);
                            }
                            Ok::<_, anyhow::Error>(())
                        })
                        .log_err();
                    }
                })
                .context("failed to spawn transport stderr reader")?;
        }

        Ok(Self {
            name,
            executor: executor.clone(),
            outbound_tx,
            io_handlers,
            process: Mutex::new(process),
            output_done_rx: Mutex::new(Some(output_done_rx)),
            log_traffic,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, message: Vec<u8>) -> Result<()> {
        debug_assert!(self.executor.is_executor_thread());
        let text = String::from_utf8_lossy(&message);
        let line = text.trim_end();
        if self.log_traffic {
            log::debug!("{} <-- {line}", self.name);
        }
        notify_io(&self.io_handlers, IoKind::Send, line);
        self.outbound_tx
            .try_send(message)
            .map_err(|_| anyhow!("{} is disconnected", self.name))
    }

    pub fn on_io(&self, handler: impl Send + Sync + Fn(IoKind, &str) + 'static) {
        self.io_handlers.write().push(Box::new(handler));
    }

    pub fn is_connected(&self) -> bool {
        !self.outbound_tx.is_closed()
    }

    /// Stops accepting messages and kills the debugger process, if one was spawned.
    pub fn disconnect(&self) {
        if self.outbound_tx.close() {
            log::info!("{} disconnected", self.name);
        }
        if let Some(mut process) = self.process.lock().take() {
            process.kill().warn_on_err();
        }
    }

    /// Resolves once the writer has flushed everything sent before `disconnect`.
    pub fn output_done(&self) -> Option<impl 'static + Send + std::future::Future<Output = ()>> {
        let mut output_done_rx = self.output_done_rx.lock().take()?;
        Some(async move {
            output_done_rx.recv().await;
        })
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn read_records(
    name: &str,
    stdout: Box<dyn AsyncRead + Unpin + Send>,
    protocol: &dyn Protocol,
    executor: &Executor,
    on_event: &EventHandler,
    io_handlers: &RwLock<Vec<IoHandler>>,
    log_traffic: bool,
) -> String {
    let mut stdout = BufReader::new(stdout);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match stdout.read_until(b'\n', &mut buffer).await {
            Ok(0) => return "debugger closed its output".to_string(),
            Ok(_) => {}
            Err(error) => return format!("failed to read debugger output: {error}"),
        }
        let line = String::from_utf8_lossy(&buffer);
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.trim().is_empty() {
            continue;
        }
        if log_traffic {
            log::debug!("{name} --> {line}");
        }
        notify_io(io_handlers, IoKind::Receive, line);

        match protocol.decode(line) {
            Ok(Some(record)) => {
                let on_event = on_event.clone();
                executor.submit(move || on_event(TransportEvent::Record(record)));
            }
            Ok(None) => {}
            Err(error) => log::warn!("{name} failed to decode {line:?}: {error:#}"),
        }
    }
}

fn notify_io(io_handlers: &RwLock<Vec<IoHandler>>, kind: IoKind, line: &str) {
    for handler in io_handlers.read().iter() {
        handler(kind, line);
    }
}
