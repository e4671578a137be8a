use crate::TransportIo;
use anyhow::{Context, Result};
use smol::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::unix::UnixStream,
};
use std::thread;

/// The debugger end of an in-memory transport. Tests read the commands a session sends
/// and write back whatever output they want the session to see.
pub struct FakeDebugger {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl FakeDebugger {
    pub fn new() -> Result<(TransportIo, Self)> {
        let (local, remote) = UnixStream::pair().context("failed to create socket pair")?;
        let io = TransportIo::new(local.clone(), local);
        Ok((
            io,
            Self {
                reader: BufReader::new(remote.clone()),
                writer: remote,
            },
        ))
    }

    /// Returns the next line sent by the session, or `None` once it stopped writing.
    pub async fn receive_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end().to_string()),
        }
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Answers every line with the lines `handler` returns, on a background thread, until
    /// the session stops writing.
    pub fn serve(
        mut self,
        mut handler: impl FnMut(&str) -> Vec<String> + Send + 'static,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            smol::block_on(async move {
                while let Some(line) = self.receive_line().await {
                    for reply in handler(&line) {
                        if let Err(error) = self.send_line(&reply).await {
                            log::warn!("fake debugger failed to reply: {error:#}");
                            return;
                        }
                    }
                }
            })
        })
    }

    /// Closes both directions, as if the debugger process exited.
    pub fn close(self) {
        self.writer.shutdown(std::net::Shutdown::Both).ok();
    }
}
