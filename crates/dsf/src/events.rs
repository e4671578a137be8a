use crate::{
    AsyncRecord, CommandId, ExecutionContext, RequestStatus, ResultRecord, SessionState,
    StreamRecord, Token,
};

/// Events broadcast to session listeners, always on the session's executor thread.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Suspended(AsyncRecord),
    Resumed(AsyncRecord),
    Created(AsyncRecord),
    Destroyed(AsyncRecord),
    Notification(AsyncRecord),
    /// A result record that matched no pending command.
    UnsolicitedResult(ResultRecord),
    Stream(StreamRecord),
    Command(CommandEvent),
    Terminated { reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandEvent {
    Queued(CommandInfo),
    Sent(CommandInfo),
    Removed(CommandInfo),
    Done(CommandInfo, RequestStatus),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandInfo {
    pub id: CommandId,
    pub token: Option<Token>,
    pub operation: String,
    pub context: ExecutionContext,
}

impl CommandEvent {
    pub fn info(&self) -> &CommandInfo {
        match self {
            CommandEvent::Queued(info)
            | CommandEvent::Sent(info)
            | CommandEvent::Removed(info)
            | CommandEvent::Done(info, _) => info,
        }
    }
}
