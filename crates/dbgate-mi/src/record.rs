//! GDB/MI output records.
//!
//! Every line gdb writes in MI mode is one record:
//!
//! ```text
//! 12^done,bkpt={number="1",type="breakpoint",...}
//! *stopped,reason="breakpoint-hit",frame={...}
//! ~"Reading symbols...\n"
//! (gdb)
//! ```
//!
//! Result values are converted to `serde_json::Value` so they can be handed to
//! clients unchanged: c-strings become strings, tuples objects and lists arrays.

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Result(ResultRecord),
    Async(AsyncRecord),
    Stream(StreamRecord),
    Prompt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub token: Option<u64>,
    pub class: ResultClass,
    pub results: Map<String, Value>,
}

impl ResultRecord {
    /// The `msg` field of an `^error` record.
    pub fn error_message(&self) -> Option<&str> {
        self.results.get("msg").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    fn parse(word: &str) -> Option<Self> {
        Some(match word {
            "done" => Self::Done,
            "running" => Self::Running,
            "connected" => Self::Connected,
            "error" => Self::Error,
            "exit" => Self::Exit,
            _ => return None,
        })
    }
}

/// Out-of-band status record (`*`, `+` or `=`), forwarded to viewers verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AsyncRecord {
    #[serde(rename = "Type")]
    pub kind: AsyncKind,
    pub class: String,
    pub results: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncKind {
    /// `*`: the target changed execution state.
    Exec,
    /// `+`: progress of a long-running operation.
    Status,
    /// `=`: supplementary information (breakpoint modified, library loaded, ...).
    Notify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub kind: StreamKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `~`: CLI console output.
    Console,
    /// `@`: output produced by the running target.
    Target,
    /// `&`: gdb's internal log.
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty record")]
    Empty,
    #[error("unknown record prefix {0:?}")]
    UnknownPrefix(char),
    #[error("unknown result class {0:?}")]
    UnknownResultClass(String),
    #[error("unexpected end of record at byte {0}")]
    UnexpectedEnd(usize),
    #[error("expected {expected:?} at byte {position}")]
    Expected { expected: char, position: usize },
    #[error("unterminated c-string")]
    UnterminatedString,
    #[error("trailing input at byte {0}")]
    Trailing(usize),
}

/// Parses a single line of MI output (without its line terminator).
pub fn parse_line(line: &str) -> Result<Record, ParseError> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    if line.trim_end() == "(gdb)" {
        return Ok(Record::Prompt);
    }

    let mut cursor = Cursor::new(line.as_bytes());
    let token = cursor.token();
    let prefix = cursor.next().ok_or(ParseError::Empty)?;

    let record = match prefix {
        b'^' => {
            let word = cursor.word();
            let class = ResultClass::parse(word)
                .ok_or_else(|| ParseError::UnknownResultClass(word.to_owned()))?;
            let results = cursor.trailing_results()?;
            Record::Result(ResultRecord {
                token,
                class,
                results,
            })
        }
        b'*' | b'+' | b'=' => {
            let kind = match prefix {
                b'*' => AsyncKind::Exec,
                b'+' => AsyncKind::Status,
                _ => AsyncKind::Notify,
            };
            let class = cursor.word().to_owned();
            let results = cursor.trailing_results()?;
            Record::Async(AsyncRecord {
                kind,
                class,
                results,
            })
        }
        b'~' | b'@' | b'&' if token.is_none() => {
            let kind = match prefix {
                b'~' => StreamKind::Console,
                b'@' => StreamKind::Target,
                _ => StreamKind::Log,
            };
            let text = cursor.c_string()?;
            cursor.finish()?;
            Record::Stream(StreamRecord { kind, text })
        }
        other => return Err(ParseError::UnknownPrefix(other as char)),
    };

    Ok(record)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<(), ParseError> {
        match self.next() {
            Some(byte) if byte == expected => Ok(()),
            Some(_) => Err(ParseError::Expected {
                expected: expected as char,
                position: self.pos - 1,
            }),
            None => Err(ParseError::UnexpectedEnd(self.pos)),
        }
    }

    fn finish(&self) -> Result<(), ParseError> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(ParseError::Trailing(self.pos))
        }
    }

    fn token(&mut self) -> Option<u64> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        match std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse().ok())
        {
            Some(token) => Some(token),
            None => {
                self.pos = start;
                None
            }
        }
    }

    /// Class names and variable names: everything up to `,` `=` or end of input.
    fn word(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == b',' || byte == b'=' {
                break;
            }
            self.pos += 1;
        }
        std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("")
    }

    fn trailing_results(&mut self) -> Result<Map<String, Value>, ParseError> {
        let mut results = ResultMap::default();
        while self.peek() == Some(b',') {
            self.pos += 1;
            let (name, value) = self.result()?;
            results.insert(name, value);
        }
        self.finish()?;
        Ok(results.into_map())
    }

    fn result(&mut self) -> Result<(String, Value), ParseError> {
        let name = self.word().to_owned();
        self.expect(b'=')?;
        let value = self.value()?;
        Ok((name, value))
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            Some(b'"') => self.c_string().map(Value::String),
            Some(b'{') => self.tuple(),
            Some(b'[') => self.list(),
            Some(_) => Err(ParseError::Expected {
                expected: '"',
                position: self.pos,
            }),
            None => Err(ParseError::UnexpectedEnd(self.pos)),
        }
    }

    fn tuple(&mut self) -> Result<Value, ParseError> {
        self.expect(b'{')?;
        let mut results = ResultMap::default();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Value::Object(results.into_map()));
        }
        loop {
            let (name, value) = self.result()?;
            results.insert(name, value);
            match self.next() {
                Some(b',') => continue,
                Some(b'}') => break,
                Some(_) => {
                    return Err(ParseError::Expected {
                        expected: '}',
                        position: self.pos - 1,
                    })
                }
                None => return Err(ParseError::UnexpectedEnd(self.pos)),
            }
        }
        Ok(Value::Object(results.into_map()))
    }

    fn list(&mut self) -> Result<Value, ParseError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Value::Array(items));
        }
        let named = !matches!(self.peek(), Some(b'"' | b'{' | b'['));
        loop {
            let item = if named {
                self.result()?.1
            } else {
                self.value()?
            };
            items.push(item);
            match self.next() {
                Some(b',') => continue,
                Some(b']') => break,
                Some(_) => {
                    return Err(ParseError::Expected {
                        expected: ']',
                        position: self.pos - 1,
                    })
                }
                None => return Err(ParseError::UnexpectedEnd(self.pos)),
            }
        }
        Ok(Value::Array(items))
    }

    fn c_string(&mut self) -> Result<String, ParseError> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            let byte = self.next().ok_or(ParseError::UnterminatedString)?;
            match byte {
                b'"' => break,
                b'\\' => {
                    let escaped = self.next().ok_or(ParseError::UnterminatedString)?;
                    match escaped {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'a' => out.push(0x07),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'v' => out.push(0x0b),
                        b'e' => out.push(0x1b),
                        b'0'..=b'7' => {
                            // Up to three octal digits; gdb escapes non-ASCII bytes this way.
                            let mut code = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(digit @ b'0'..=b'7') => {
                                        code = code * 8 + u32::from(digit - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((code & 0xff) as u8);
                        }
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Object builder that keeps every value of a repeated key.
///
/// `thread-ids={thread-id="1",thread-id="2"}` becomes
/// `{"thread-id": ["1", "2"]}`.
#[derive(Default)]
struct ResultMap {
    map: Map<String, Value>,
    repeated: Vec<String>,
}

impl ResultMap {
    fn insert(&mut self, name: String, value: Value) {
        if self.repeated.contains(&name) {
            if let Some(Value::Array(values)) = self.map.get_mut(&name) {
                values.push(value);
            }
            return;
        }
        match self.map.remove(&name) {
            Some(previous) => {
                self.map.insert(name.clone(), Value::Array(vec![previous, value]));
                self.repeated.push(name);
            }
            None => {
                self.map.insert(name, value);
            }
        }
    }

    fn into_map(self) -> Map<String, Value> {
        self.map
    }
}
