use dsf::{Command, CommandOutput, ExecutionContext, RequestError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, marker::PhantomData, time::Duration};

use crate::parser::escape_c_string;

/// The untyped results of a record, for commands nobody wrote a struct for.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MiInfo(pub Map<String, Value>);

impl MiInfo {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

/// An MI request, decoded into `T` by deserializing the results of its result record.
pub struct MiCommand<T = MiInfo> {
    context: ExecutionContext,
    operation: String,
    options: Vec<String>,
    parameters: Vec<String>,
    mutating: bool,
    timeout: Option<Duration>,
    raw: bool,
    output: PhantomData<fn() -> T>,
}

impl<T> Clone for MiCommand<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            operation: self.operation.clone(),
            options: self.options.clone(),
            parameters: self.parameters.clone(),
            mutating: self.mutating,
            timeout: self.timeout,
            raw: self.raw,
            output: PhantomData,
        }
    }
}

impl<T> fmt::Debug for MiCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiCommand")
            .field("context", &self.context)
            .field("text", &self.text())
            .field("mutating", &self.mutating)
            .field("raw", &self.raw)
            .finish()
    }
}

impl<T> MiCommand<T> {
    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    fn text(&self) -> String {
        if self.raw {
            return self.operation.clone();
        }

        let mut text = self.operation.clone();
        for option in &self.options {
            text.push(' ');
            text.push_str(&quote(option));
        }
        let starts_with_dash = self
            .parameters
            .first()
            .map_or(false, |parameter| parameter.starts_with('-'));
        if !self.options.is_empty() && starts_with_dash {
            text.push_str(" --");
        }
        for parameter in &self.parameters {
            text.push(' ');
            text.push_str(&quote(parameter));
        }
        text
    }
}

fn quote(argument: &str) -> String {
    let needs_quotes = argument.is_empty()
        || argument
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || c.is_control());
    if needs_quotes {
        format!("\"{}\"", escape_c_string(argument))
    } else {
        argument.to_string()
    }
}

impl<T: DeserializeOwned + Send + 'static> Command for MiCommand<T> {
    type Output = T;

    fn operation(&self) -> String {
        self.text()
    }

    fn context(&self) -> &ExecutionContext {
        &self.context
    }

    fn decode(&self, output: &CommandOutput) -> Result<T, RequestError> {
        let results = match &output.record {
            Some(record) => record.results.clone(),
            None if self.raw => Map::new(),
            None => return Err(RequestError::Protocol("command produced no result record".into())),
        };
        let value = if results.is_empty() {
            serde_json::from_value(Value::Null)
                .or_else(|_| serde_json::from_value(Value::Object(Map::new())))
        } else {
            serde_json::from_value(Value::Object(results))
        };
        value.map_err(|error| {
            log::debug!("failed to decode reply to {}: {error}", self.text());
            RequestError::Protocol(format!("unexpected reply to {}: {error}", self.operation))
        })
    }

    fn signature(&self) -> String {
        format!("{}|{}", self.context, self.text())
    }

    fn is_mutating(&self) -> bool {
        self.mutating
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn expects_reply(&self) -> bool {
        !self.raw
    }
}

/// Builds MI commands.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandFactory;

impl CommandFactory {
    pub fn create<T, I, S>(context: &ExecutionContext, operation: &str, parameters: I) -> MiCommand<T>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MiCommand {
            context: context.clone(),
            operation: operation.to_string(),
            options: Vec::new(),
            parameters: parameters.into_iter().map(Into::into).collect(),
            mutating: false,
            timeout: None,
            raw: false,
            output: PhantomData,
        }
    }

    /// A command sent verbatim, without a token. It completes as soon as it is written.
    pub fn raw(context: &ExecutionContext, text: &str) -> MiCommand<()> {
        MiCommand {
            raw: true,
            mutating: true,
            ..Self::create(context, text, Vec::<String>::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsf::{ResultClass, ResultRecord, Token};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Frame {
        level: String,
        func: String,
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct Stack {
        stack: Vec<Frame>,
    }

    fn output(results: Value) -> CommandOutput {
        let Value::Object(results) = results else {
            panic!("expected an object");
        };
        CommandOutput {
            record: Some(ResultRecord {
                token: Some(Token(1)),
                class: ResultClass::Done,
                results,
            }),
            oob: Vec::new(),
        }
    }

    #[test]
    fn test_command_text() {
        let root = ExecutionContext::root();
        let command = CommandFactory::create::<MiInfo, _, _>(&root, "-break-insert", ["main"]);
        assert_eq!(command.operation(), "-break-insert main");

        let command = CommandFactory::create::<MiInfo, _, _>(
            &root,
            "-data-evaluate-expression",
            ["a + b"],
        );
        assert_eq!(command.operation(), "-data-evaluate-expression \"a + b\"");

        let command = CommandFactory::create::<MiInfo, _, _>(&root, "-data-evaluate-expression", ["-1"])
            .with_options(["--thread", "1"]);
        assert_eq!(command.operation(), "-data-evaluate-expression --thread 1 -- -1");

        let command = CommandFactory::create::<MiInfo, _, _>(&root, "-gdb-set", ["args", ""]);
        assert_eq!(command.operation(), "-gdb-set args \"\"");

        let command = CommandFactory::raw(&root, "info frame");
        assert_eq!(command.operation(), "info frame");
        assert!(!command.expects_reply());
        assert!(command.is_mutating());
    }

    #[test]
    fn test_signature_includes_context() {
        let thread_1 = ExecutionContext::parse("thread:1");
        let thread_2 = ExecutionContext::parse("thread:2");
        let a = CommandFactory::create::<MiInfo, _, _>(&thread_1, "-stack-list-frames", Vec::<String>::new());
        let b = CommandFactory::create::<MiInfo, _, _>(&thread_2, "-stack-list-frames", Vec::<String>::new());
        assert_ne!(a.signature(), b.signature());
        assert_eq!(a.signature(), a.clone().signature());
    }

    #[test]
    fn test_decode_typed_results() {
        let command = CommandFactory::create::<Stack, _, _>(
            &ExecutionContext::parse("thread:1"),
            "-stack-list-frames",
            Vec::<String>::new(),
        );
        let decoded = command
            .decode(&output(json!({
                "stack": [{"level": "0", "func": "main"}, {"level": "1", "func": "start"}]
            })))
            .unwrap();
        assert_eq!(
            decoded,
            Stack {
                stack: vec![
                    Frame { level: "0".into(), func: "main".into() },
                    Frame { level: "1".into(), func: "start".into() },
                ]
            }
        );

        assert!(matches!(
            command.decode(&output(json!({"frames": []}))),
            Err(RequestError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_empty_results() {
        let root = ExecutionContext::root();
        let unit = CommandFactory::create::<(), _, _>(&root, "-exec-continue", Vec::<String>::new());
        assert_eq!(unit.decode(&output(json!({}))), Ok(()));

        let info = CommandFactory::create::<MiInfo, _, _>(&root, "-gdb-exit", Vec::<String>::new());
        assert_eq!(info.decode(&output(json!({}))), Ok(MiInfo::default()));
        assert!(matches!(
            info.decode(&CommandOutput::default()),
            Err(RequestError::Protocol(_))
        ));

        let raw = CommandFactory::raw(&root, "info frame");
        assert_eq!(raw.decode(&CommandOutput::default()), Ok(()));
    }
}
