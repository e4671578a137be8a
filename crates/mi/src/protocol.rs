use crate::parser::parse_line;
use anyhow::Result;
use dsf::{AsyncRecord, Protocol, Record, RequestError, ResultClass, ResultRecord, SessionEvent, Token};
use serde_json::Value;

/// GDB's machine interface.
#[derive(Clone, Copy, Debug, Default)]
pub struct MiProtocol;

impl Protocol for MiProtocol {
    fn name(&self) -> &str {
        "gdb-mi"
    }

    fn decode(&self, line: &str) -> Result<Option<Record>> {
        parse_line(line)
    }

    fn encode(&self, token: Option<Token>, operation: &str) -> Vec<u8> {
        match token {
            Some(token) => format!("{token}{operation}\n").into_bytes(),
            None => format!("{operation}\n").into_bytes(),
        }
    }

    fn error_from_result(&self, record: &ResultRecord) -> Option<RequestError> {
        (record.class == ResultClass::Error).then(|| RequestError::failed(backend_message(record)))
    }

    fn event_for(&self, record: &AsyncRecord) -> SessionEvent {
        let class = record.class.as_str();
        match class {
            "stopped" => SessionEvent::Suspended(record.clone()),
            "running" => SessionEvent::Resumed(record.clone()),
            "thread-group-started" => SessionEvent::Created(record.clone()),
            _ if class.ends_with("-created") => SessionEvent::Created(record.clone()),
            _ if class.ends_with("-exited") || class.ends_with("-deleted") => {
                SessionEvent::Destroyed(record.clone())
            }
            _ => SessionEvent::Notification(record.clone()),
        }
    }
}

/// Extracts the human readable message of an error result.
///
/// GDB reports it under `msg`, other back ends under `message`. Placeholders such as `{0}`
/// are filled in from a `parameters` list when one is present.
pub fn backend_message(record: &ResultRecord) -> String {
    let Some(message) = record.get_str("message").or_else(|| record.get_str("msg")) else {
        return "unknown error".into();
    };
    let Some(Value::Array(parameters)) = record.get("parameters") else {
        return message.to_string();
    };

    let mut message = message.to_string();
    for (index, parameter) in parameters.iter().enumerate() {
        let text = match parameter {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        message = message.replace(&format!("{{{index}}}"), &text);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsf::AsyncKind;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    fn error_record(results: Value) -> ResultRecord {
        let Value::Object(results) = results else {
            panic!("expected an object");
        };
        ResultRecord {
            token: Some(Token(4)),
            class: ResultClass::Error,
            results,
        }
    }

    fn async_record(class: &str) -> AsyncRecord {
        AsyncRecord {
            token: None,
            kind: AsyncKind::Notify,
            class: class.into(),
            results: Map::new(),
            streams: Vec::new(),
        }
    }

    #[test]
    fn test_encode() {
        assert_eq!(
            MiProtocol.encode(Some(Token(17)), "-break-insert main"),
            b"17-break-insert main\n".to_vec()
        );
        assert_eq!(MiProtocol.encode(None, "info frame"), b"info frame\n".to_vec());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            MiProtocol.error_from_result(&error_record(json!({"msg": "bad-arg"}))),
            Some(RequestError::failed("bad-arg"))
        );
        assert_eq!(
            backend_message(&error_record(json!({
                "message": "cannot read {0} bytes at {1}",
                "parameters": ["8", "0x1000"]
            }))),
            "cannot read 8 bytes at 0x1000"
        );
        assert_eq!(backend_message(&error_record(json!({}))), "unknown error");

        let done = ResultRecord {
            class: ResultClass::Done,
            ..error_record(json!({"msg": "ignored"}))
        };
        assert_eq!(MiProtocol.error_from_result(&done), None);
    }

    #[test]
    fn test_async_events() {
        assert!(matches!(
            MiProtocol.event_for(&async_record("stopped")),
            SessionEvent::Suspended(_)
        ));
        assert!(matches!(
            MiProtocol.event_for(&async_record("running")),
            SessionEvent::Resumed(_)
        ));
        assert!(matches!(
            MiProtocol.event_for(&async_record("thread-created")),
            SessionEvent::Created(_)
        ));
        assert!(matches!(
            MiProtocol.event_for(&async_record("thread-group-started")),
            SessionEvent::Created(_)
        ));
        assert!(matches!(
            MiProtocol.event_for(&async_record("thread-exited")),
            SessionEvent::Destroyed(_)
        ));
        assert!(matches!(
            MiProtocol.event_for(&async_record("breakpoint-deleted")),
            SessionEvent::Destroyed(_)
        ));
        assert!(matches!(
            MiProtocol.event_for(&async_record("library-loaded")),
            SessionEvent::Notification(_)
        ));
    }
}
