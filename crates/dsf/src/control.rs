use crate::{
    executor::ScheduledTask, Command, CommandId, CommandInfo, CommandOutput, DataRequestMonitor,
    Record, RequestError, RequestStatus, StreamRecord, Token,
};
use std::{
    collections::{HashMap, VecDeque},
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

const MAX_TOKEN: u64 = u32::MAX as u64;

/// Maps the tokens of sent commands to whatever awaits their results.
///
/// A timed-out token stays registered until its late reply arrives or the table is
/// drained, so it is never reissued while the debugger may still answer it.
pub struct TokenTable<E> {
    next_token: u64,
    max_token: u64,
    entries: HashMap<Token, Slot<E>>,
}

enum Slot<E> {
    Pending(E),
    TimedOut,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Resolution<E> {
    Matched(E),
    /// The entry had already timed out; the reply is consumed and discarded.
    Late,
    Unknown,
}

impl<E> Default for TokenTable<E> {
    fn default() -> Self {
        Self::with_max_token(MAX_TOKEN)
    }
}

impl<E> TokenTable<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_token(max_token: u64) -> Self {
        Self {
            next_token: 1,
            max_token: max_token.max(1),
            entries: HashMap::default(),
        }
    }

    /// Returns `None` when every token up to the maximum is still registered.
    pub fn allocate(&mut self) -> Option<Token> {
        for _ in 0..self.max_token {
            if self.next_token == 0 || self.next_token > self.max_token {
                self.next_token = 1;
            }
            let token = Token(self.next_token);
            self.next_token += 1;
            if !self.entries.contains_key(&token) {
                return Some(token);
            }
        }
        None
    }

    /// Registers `entry` under `token`. A token that is already registered is a protocol
    /// violation; the new entry is handed back so the caller can fail it.
    pub fn register_pending(&mut self, token: Token, entry: E) -> Result<(), (RequestError, E)> {
        if self.entries.contains_key(&token) {
            log::error!("token {token} is already registered");
            return Err((
                RequestError::Protocol(format!("duplicate token {token}")),
                entry,
            ));
        }
        self.entries.insert(token, Slot::Pending(entry));
        Ok(())
    }

    pub fn resolve(&mut self, token: Token) -> Resolution<E> {
        match self.entries.remove(&token) {
            Some(Slot::Pending(entry)) => Resolution::Matched(entry),
            Some(Slot::TimedOut) => {
                log::debug!("discarding late result for token {token}");
                Resolution::Late
            }
            None => {
                log::warn!("received result for unknown token {token}");
                Resolution::Unknown
            }
        }
    }

    pub fn mark_timed_out(&mut self, token: Token) -> Option<E> {
        let slot = self.entries.get_mut(&token)?;
        match std::mem::replace(slot, Slot::TimedOut) {
            Slot::Pending(entry) => Some(entry),
            Slot::TimedOut => None,
        }
    }

    /// Number of entries still awaiting a result, not counting timed-out ones.
    pub fn outstanding(&self) -> usize {
        self.entries
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entries.contains_key(&token)
    }

    /// Removes every entry, returning the pending ones in token order.
    pub fn drain(&mut self) -> Vec<E> {
        let mut pending = self
            .entries
            .drain()
            .filter_map(|(token, slot)| match slot {
                Slot::Pending(entry) => Some((token, entry)),
                Slot::TimedOut => None,
            })
            .collect::<Vec<_>>();
        pending.sort_by_key(|(token, _)| *token);
        pending.into_iter().map(|(_, entry)| entry).collect()
    }
}

type Completion = Box<dyn FnOnce(Result<CommandOutput, RequestError>) -> RequestStatus + Send>;

/// A command with its type erased, waiting in the session queue.
pub struct QueuedCommand {
    pub info: CommandInfo,
    pub expects_reply: bool,
    pub timeout: Option<Duration>,
    is_cancelled: Box<dyn Fn() -> bool + Send>,
    completion: Completion,
}

impl QueuedCommand {
    pub fn new<C: Command>(info: CommandInfo, command: C, rm: DataRequestMonitor<C::Output>) -> Self {
        let expects_reply = command.expects_reply();
        let timeout = command.timeout();
        let cancellation = rm.clone();
        Self {
            info,
            expects_reply,
            timeout,
            is_cancelled: Box::new(move || cancellation.is_cancelled()),
            completion: Box::new(move |result| {
                if rm.is_done() {
                    log::warn!("command monitor was completed by someone else");
                    return rm.status();
                }
                let result = result.and_then(|output| decode(&command, &output));
                rm.complete(result);
                rm.status()
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        (self.is_cancelled)()
    }

    pub fn complete(self, result: Result<CommandOutput, RequestError>) -> (CommandInfo, RequestStatus) {
        let status = (self.completion)(result);
        (self.info, status)
    }

    pub(crate) fn into_pending(self, token: Token, timer: Option<ScheduledTask>) -> PendingCommand {
        let mut info = self.info;
        info.token = Some(token);
        PendingCommand {
            info,
            completion: self.completion,
            timer,
        }
    }
}

fn decode<C: Command>(command: &C, output: &CommandOutput) -> Result<C::Output, RequestError> {
    match panic::catch_unwind(AssertUnwindSafe(|| command.decode(output))) {
        Ok(result) => result,
        Err(payload) => {
            let message = util::panic_message(payload.as_ref());
            log::error!("decoder for {} panicked: {message}", command.operation());
            Err(RequestError::Internal(message))
        }
    }
}

/// A sent command awaiting its result.
pub struct PendingCommand {
    pub info: CommandInfo,
    completion: Completion,
    timer: Option<ScheduledTask>,
}

impl PendingCommand {
    pub fn complete(self, result: Result<CommandOutput, RequestError>) -> (CommandInfo, RequestStatus) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
        let status = (self.completion)(result);
        (self.info, status)
    }
}

/// Command bookkeeping owned by a session's executor: the send queue, the window of
/// outstanding commands and the out-of-band records waiting for the next result.
pub struct CommandControl {
    queue: VecDeque<QueuedCommand>,
    tokens: TokenTable<PendingCommand>,
    timeouts: HashMap<CommandId, Token>,
    oob: VecDeque<Record>,
    max_outstanding: usize,
    oob_limit: usize,
}

impl CommandControl {
    pub fn new(max_outstanding: usize, oob_limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            tokens: TokenTable::new(),
            timeouts: HashMap::default(),
            oob: VecDeque::new(),
            max_outstanding: max_outstanding.max(1),
            oob_limit,
        }
    }

    pub fn enqueue(&mut self, command: QueuedCommand) {
        self.queue.push_back(command);
    }

    pub fn remove(&mut self, id: CommandId) -> Option<QueuedCommand> {
        let position = self.queue.iter().position(|command| command.info.id == id)?;
        self.queue.remove(position)
    }

    /// Takes the next command to send, unless the window of outstanding commands is full.
    pub fn pop_sendable(&mut self) -> Option<QueuedCommand> {
        if self.tokens.outstanding() >= self.max_outstanding {
            return None;
        }
        self.queue.pop_front()
    }

    pub fn allocate_token(&mut self) -> Result<Token, RequestError> {
        self.tokens.allocate().ok_or_else(|| {
            log::error!("every command token is in use");
            RequestError::InvalidState("no command token is available".into())
        })
    }

    pub fn register_sent(&mut self, token: Token, command: PendingCommand) -> Result<(), (RequestError, PendingCommand)> {
        let id = command.info.id;
        self.tokens.register_pending(token, command)?;
        self.timeouts.insert(id, token);
        Ok(())
    }

    pub fn resolve(&mut self, token: Token) -> Resolution<PendingCommand> {
        let resolution = self.tokens.resolve(token);
        if let Resolution::Matched(command) = &resolution {
            self.timeouts.remove(&command.info.id);
        }
        resolution
    }

    pub fn time_out(&mut self, id: CommandId) -> Option<PendingCommand> {
        let token = self.timeouts.remove(&id)?;
        self.tokens.mark_timed_out(token)
    }

    pub fn push_oob(&mut self, record: Record) {
        if self.oob_limit == 0 {
            return;
        }
        while self.oob.len() >= self.oob_limit {
            self.oob.pop_front();
        }
        self.oob.push_back(record);
    }

    /// The stream records among those accumulated since the previous result.
    pub fn recent_streams(&self) -> Vec<StreamRecord> {
        self.oob
            .iter()
            .filter_map(|record| match record {
                Record::Stream(stream) => Some(stream.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn take_oob(&mut self) -> Vec<Record> {
        self.oob.drain(..).collect()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn outstanding(&self) -> usize {
        self.tokens.outstanding()
    }

    /// Empties the queue and the token table. Timed-out tokens are forgotten.
    pub fn drain(&mut self) -> (Vec<QueuedCommand>, Vec<PendingCommand>) {
        self.timeouts.clear();
        self.oob.clear();
        (self.queue.drain(..).collect(), self.tokens.drain())
    }
}
