use anyhow::{anyhow, bail, Result};
use dsf::{
    AsyncKind, AsyncRecord, Record, ResultClass, ResultRecord, StreamKind, StreamRecord, Token,
};
use serde_json::{Map, Value};
use std::collections::HashSet;

const PROMPT: &str = "(gdb)";

/// Parses one line of GDB/MI output. The prompt yields `Ok(None)`.
///
/// Tuples become JSON objects and lists become arrays. Results repeated under the same
/// name inside one tuple are collected into an array, and the names of results inside a
/// list are dropped, so `stack=[frame={..},frame={..}]` becomes an array of two objects.
pub fn parse_line(line: &str) -> Result<Option<Record>> {
    let line = line.trim_end();
    if line.trim() == PROMPT {
        return Ok(None);
    }

    let mut parser = Parser::new(line);
    let token = parser.token()?;
    let marker = parser
        .next()
        .ok_or_else(|| anyhow!("missing record type in {line:?}"))?;
    let record = match marker {
        b'^' => {
            let class = match parser.identifier() {
                "done" => ResultClass::Done,
                "running" => ResultClass::Running,
                "connected" => ResultClass::Connected,
                "error" => ResultClass::Error,
                "exit" => ResultClass::Exit,
                other => bail!("unknown result class {other:?}"),
            };
            Record::Result(ResultRecord {
                token,
                class,
                results: parser.results()?,
            })
        }
        b'*' | b'+' | b'=' => {
            let kind = match marker {
                b'*' => AsyncKind::Exec,
                b'+' => AsyncKind::Status,
                _ => AsyncKind::Notify,
            };
            let class = parser.identifier().to_string();
            if class.is_empty() {
                bail!("missing async class in {line:?}");
            }
            Record::Async(AsyncRecord {
                token,
                kind,
                class,
                results: parser.results()?,
                streams: Vec::new(),
            })
        }
        b'~' | b'@' | b'&' => {
            let kind = match marker {
                b'~' => StreamKind::Console,
                b'@' => StreamKind::Target,
                _ => StreamKind::Log,
            };
            let text = parser.c_string()?;
            parser.expect_end()?;
            Record::Stream(StreamRecord { kind, text })
        }
        other => bail!("unknown record type {:?} in {line:?}", other as char),
    };
    Ok(Some(record))
}

/// Escapes `text` so that it can be placed between double quotes in an MI command.
pub fn escape_c_string(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if c.is_ascii_control() => escaped.push_str(&format!("\\{:03o}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

struct Parser<'a> {
    input: &'a [u8],
    text: &'a str,
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            input: text.as_bytes(),
            text,
            position: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.position += 1;
        Some(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        match self.next() {
            Some(byte) if byte == expected => Ok(()),
            Some(byte) => Err(anyhow!(
                "expected {:?} at offset {}, found {:?}",
                expected as char,
                self.position - 1,
                byte as char
            )),
            None => Err(anyhow!("expected {:?}, found end of line", expected as char)),
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.position < self.input.len() {
            bail!("unexpected trailing input {:?}", &self.text[self.position..]);
        }
        Ok(())
    }

    fn token(&mut self) -> Result<Option<Token>> {
        let start = self.position;
        while self.peek().map_or(false, |byte| byte.is_ascii_digit()) {
            self.position += 1;
        }
        if start == self.position {
            return Ok(None);
        }
        Ok(Some(Token(self.text[start..self.position].parse()?)))
    }

    fn identifier(&mut self) -> &'a str {
        let start = self.position;
        while self
            .peek()
            .map_or(false, |byte| !matches!(byte, b',' | b'=' | b'{' | b'[' | b'"'))
        {
            self.position += 1;
        }
        &self.text[start..self.position]
    }

    fn results(&mut self) -> Result<Map<String, Value>> {
        let mut results = Results::default();
        while self.peek() == Some(b',') {
            self.position += 1;
            let (name, value) = self.result()?;
            results.insert(name, value);
        }
        self.expect_end()?;
        Ok(results.map)
    }

    fn result(&mut self) -> Result<(String, Value)> {
        let name = self.identifier().to_string();
        if name.is_empty() {
            bail!("missing result name at offset {}", self.position);
        }
        self.expect(b'=')?;
        Ok((name, self.value()?))
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek() {
            Some(b'"') => Ok(Value::String(self.c_string()?)),
            Some(b'{') => self.tuple(),
            Some(b'[') => self.list(),
            Some(byte) => bail!("unexpected {:?} at offset {}", byte as char, self.position),
            None => bail!("expected a value, found end of line"),
        }
    }

    fn tuple(&mut self) -> Result<Value> {
        self.expect(b'{')?;
        let mut results = Results::default();
        if self.peek() == Some(b'}') {
            self.position += 1;
            return Ok(Value::Object(results.map));
        }
        loop {
            let (name, value) = self.result()?;
            results.insert(name, value);
            match self.next() {
                Some(b',') => continue,
                Some(b'}') => return Ok(Value::Object(results.map)),
                _ => bail!("unterminated tuple"),
            }
        }
    }

    fn list(&mut self) -> Result<Value> {
        self.expect(b'[')?;
        let mut values = Vec::new();
        if self.peek() == Some(b']') {
            self.position += 1;
            return Ok(Value::Array(values));
        }
        loop {
            let value = match self.peek() {
                Some(b'"' | b'{' | b'[') => self.value()?,
                _ => self.result()?.1,
            };
            values.push(value);
            match self.next() {
                Some(b',') => continue,
                Some(b']') => return Ok(Value::Array(values)),
                _ => bail!("unterminated list"),
            }
        }
    }

    /// Decodes a C string. Octal escapes produce raw bytes, which are then read as UTF-8.
    fn c_string(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut bytes = Vec::new();
        loop {
            let byte = self
                .next()
                .ok_or_else(|| anyhow!("unterminated string"))?;
            match byte {
                b'"' => break,
                b'\\' => {
                    let escaped = self
                        .next()
                        .ok_or_else(|| anyhow!("unterminated escape sequence"))?;
                    match escaped {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        b'a' => bytes.push(0x07),
                        b'b' => bytes.push(0x08),
                        b'f' => bytes.push(0x0c),
                        b'v' => bytes.push(0x0b),
                        b'e' | b'E' => bytes.push(0x1b),
                        b'0'..=b'7' => {
                            let mut value = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(digit @ b'0'..=b'7') => {
                                        self.position += 1;
                                        value = value * 8 + u32::from(digit - b'0');
                                    }
                                    _ => break,
                                }
                            }
                            bytes.push((value & 0xff) as u8);
                        }
                        other => bytes.push(other),
                    }
                }
                other => bytes.push(other),
            }
        }
        Ok(match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(error) => String::from_utf8_lossy(error.as_bytes()).into_owned(),
        })
    }
}

#[derive(Default)]
struct Results {
    map: Map<String, Value>,
    repeated: HashSet<String>,
}

impl Results {
    fn insert(&mut self, name: String, value: Value) {
        let Some(existing) = self.map.get_mut(&name) else {
            self.map.insert(name, value);
            return;
        };
        if self.repeated.contains(&name) {
            if let Value::Array(values) = existing {
                values.push(value);
            }
        } else {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
            self.repeated.insert(name);
        }
    }
}
