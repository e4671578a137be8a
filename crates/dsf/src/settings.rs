use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSettings {
    /// Time in milliseconds until a command without a reply fails with a timeout.
    /// Zero disables the timeout.
    ///
    /// Default: 10000ms
    pub command_timeout: u64,
    /// How many commands may be awaiting a reply from the debugger at once.
    ///
    /// Default: 3
    pub max_outstanding_commands: usize,
    /// Whether to log every line exchanged with the debugger.
    ///
    /// Default: true
    pub log_protocol_communications: bool,
    /// How many out-of-band records are kept for the next command result.
    ///
    /// Default: 20
    pub accumulated_record_limit: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command_timeout: 10000,
            max_outstanding_commands: 3,
            log_protocol_communications: true,
            accumulated_record_limit: 20,
        }
    }
}

impl SessionSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid session settings")
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout > 0).then(|| Duration::from_millis(self.command_timeout))
    }

    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(SessionSettings)
    }
}
