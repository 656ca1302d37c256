//! Wire types for the newline-delimited JSON protocol.
//!
//! The UI writes one [`Request`] per line on stdin. The server writes
//! [`Response`]s and [`Event`]s, one per line, on stdout. Responses may
//! arrive in any order; the `id` ties them to their request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest request line accepted, in bytes.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// One request from the UI.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    /// Chosen by the UI; echoed on the response and on related events.
    pub id: u64,
    /// Method name such as `execute-code`.
    pub method: String,
    /// Method arguments. Absent means `{}`.
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

/// A protocol-level failure: the request could not be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl ErrorBody {
    /// The line was not a request object.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_request".into(),
            message: message.into(),
        }
    }

    /// No such method.
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: "method_not_found".into(),
            message: format!("unknown method '{method}'"),
        }
    }

    /// The params did not match the method.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_params".into(),
            message: message.into(),
        }
    }
}

/// Reply to one request: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    /// The request's id, or `null` when the line carried none.
    pub id: Option<u64>,
    /// Method result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Dispatch failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// A successful reply.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// A failed reply.
    pub fn err(id: Option<u64>, error: ErrorBody) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A one-way notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Channel name, e.g. `console-log` or `package-install-status`.
    pub event: String,
    /// The request that caused the event, if any.
    pub request_id: Option<u64>,
    /// Channel-specific payload.
    pub payload: Value,
}

/// Anything the server writes to its output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    /// A reply.
    Response(Response),
    /// A notification.
    Event(Event),
}

impl From<Response> for Outgoing {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Event> for Outgoing {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// Parse one input line. On failure, returns the reply to send, carrying the
/// line's `id` when one can be recovered.
pub fn parse_request(line: &str) -> Result<Request, Response> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        Response::err(None, ErrorBody::invalid_request(format!("malformed JSON: {e}")))
    })?;
    let id = value.get("id").and_then(Value::as_u64);
    serde_json::from_value(value)
        .map_err(|e| Response::err(id, ErrorBody::invalid_request(e.to_string())))
}

/// One line of input, read as bytes so a bad line can be answered instead
/// of ending the session.
#[derive(Debug, PartialEq, Eq)]
pub enum InputLine {
    /// A complete UTF-8 line without its terminator.
    Text(String),
    /// The line is not valid UTF-8.
    NotUtf8,
    /// The line ran past the limit; its remaining bytes were discarded.
    TooLong,
}

impl InputLine {
    /// The reply to a line that could not be parsed as text.
    pub fn rejection(&self, max: usize) -> Option<Response> {
        let message = match self {
            Self::Text(_) => return None,
            Self::NotUtf8 => "request line is not valid UTF-8".to_string(),
            Self::TooLong => format!("request line exceeds {max} bytes"),
        };
        Some(Response::err(None, ErrorBody::invalid_request(message)))
    }
}

/// Read the next line of at most `max` bytes. `None` at end of input.
///
/// `buf` is scratch space reused across calls.
pub async fn read_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<Option<InputLine>>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max as u64 + 1;
    buf.clear();
    if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && buf.len() > max {
        loop {
            buf.clear();
            let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
            if read == 0 || buf.last() == Some(&b'\n') {
                break;
            }
        }
        buf.clear();
        return Ok(Some(InputLine::TooLong));
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(match std::str::from_utf8(buf) {
        Ok(text) => InputLine::Text(text.to_string()),
        Err(_) => InputLine::NotUtf8,
    }))
}
