use crate::{Record, RequestError, ResultRecord};
use std::{fmt, sync::Arc, time::Duration};

/// Hierarchical path naming what a command targets, e.g. `inferior:1/thread:2/frame:0`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionContext {
    segments: Arc<[String]>,
}

impl ExecutionContext {
    pub fn root() -> Self {
        Self {
            segments: Arc::from(Vec::new()),
        }
    }

    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.to_vec();
        segments.push(segment.into());
        Self {
            segments: segments.into(),
        }
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.segments.split_last()?;
        Some(Self {
            segments: parent.into(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether a change to `self` can change what a command on `other` observes: `self`
    /// is `other` or one of its ancestors.
    pub fn affects(&self, other: &ExecutionContext) -> bool {
        other.segments.starts_with(&self.segments)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutionContext({self})")
    }
}

/// What a command's decoder sees: its result record and the out-of-band records that
/// arrived since the previous result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandOutput {
    pub record: Option<ResultRecord>,
    pub oob: Vec<Record>,
}

impl CommandOutput {
    pub fn result(&self) -> Result<&ResultRecord, RequestError> {
        self.record
            .as_ref()
            .ok_or_else(|| RequestError::Protocol("command produced no result record".into()))
    }
}

/// An immutable request to the debugger together with the decoder for its reply.
pub trait Command: Send + 'static {
    type Output: Send + 'static;

    /// The request text, without a token.
    fn operation(&self) -> String;

    fn context(&self) -> &ExecutionContext;

    fn decode(&self, output: &CommandOutput) -> Result<Self::Output, RequestError>;

    /// Identifies equivalent commands for coalescing and caching.
    fn signature(&self) -> String {
        self.operation()
    }

    /// Mutating commands change debugger state and are never cached.
    fn is_mutating(&self) -> bool {
        false
    }

    /// Overrides the session's default command timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Commands that expect no reply are sent without a token and complete once written.
    fn expects_reply(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Returned by `Session::queue_command`; used to remove the command before it is sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandHandle {
    pub(crate) id: CommandId,
}

impl CommandHandle {
    pub fn id(&self) -> CommandId {
        self.id
    }
}
