use crate::{RequestError, SessionEvent};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Correlates a command with its result record. Unique for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncKind {
    Exec,
    Status,
    Notify,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub token: Option<Token>,
    pub class: ResultClass,
    pub results: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AsyncRecord {
    pub token: Option<Token>,
    pub kind: AsyncKind,
    pub class: String,
    pub results: Map<String, Value>,
    /// Stream records received since the previous result record. Filled in by the
    /// session before the record reaches listeners; some stop reasons are only reported
    /// as console text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub kind: StreamKind,
    pub text: String,
}

/// One decoded line of debugger output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Result(ResultRecord),
    Async(AsyncRecord),
    Stream(StreamRecord),
}

impl Record {
    pub fn token(&self) -> Option<Token> {
        match self {
            Record::Result(record) => record.token,
            Record::Async(record) => record.token,
            Record::Stream(_) => None,
        }
    }

    pub fn is_out_of_band(&self) -> bool {
        !matches!(self, Record::Result(_))
    }
}

impl ResultRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.results.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

impl AsyncRecord {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.results.get(key).and_then(Value::as_str)
    }
}

/// The wire format spoken by a debugger back end.
pub trait Protocol: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Decodes one line of output. `Ok(None)` means the line carries no record, such as
    /// a prompt.
    fn decode(&self, line: &str) -> Result<Option<Record>>;

    /// Serializes a command. Commands that expect no reply are sent without a token.
    fn encode(&self, token: Option<Token>, operation: &str) -> Vec<u8>;

    /// Returns the failure carried by a result record, if any.
    fn error_from_result(&self, record: &ResultRecord) -> Option<RequestError>;

    fn event_for(&self, record: &AsyncRecord) -> SessionEvent {
        SessionEvent::Notification(record.clone())
    }
}
