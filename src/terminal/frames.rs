//! Frames carried on a terminal session's dedicated stream.
//!
//! Client → server:
//!
//! ```json
//! {"type": "input", "data": "ls -la\r"}
//! {"type": "resize", "cols": 120, "rows": 40}
//! ```
//!
//! Server → client:
//!
//! ```json
//! {"type": "output", "data": "..."}
//! {"type": "exit", "code": 0}
//! {"type": "title_change", "title": "vim"}
//! {"type": "rate_limit", ...}          // any other type is a domain signal
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Signal: the agent in the session hit a rate limit.
pub const RATE_LIMIT: &str = "rate_limit";
/// Signal: an OAuth token was extracted from the session output.
pub const OAUTH_TOKEN: &str = "oauth_token";
/// Signal: the agent announced its own session id.
pub const CLAUDE_SESSION: &str = "claude_session";

/// Frame written by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keystrokes for the remote process.
    Input {
        /// Input text.
        data: String,
    },
    /// New terminal dimensions.
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
}

impl ClientFrame {
    /// Input frame for raw bytes. Invalid UTF-8 is replaced.
    pub fn input(bytes: &[u8]) -> Self {
        Self::Input {
            data: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Frame received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Output produced by the remote process.
    Output(Bytes),
    /// The remote process ended.
    Exit {
        /// Exit code, if the server knows it.
        code: Option<i32>,
    },
    /// The terminal title changed.
    TitleChange(String),
    /// Domain signal riding on the stream; `body` is the whole frame.
    Signal {
        /// Value of the frame's `type` field.
        kind: String,
        /// The full frame object.
        body: Value,
    },
}

impl ServerFrame {
    /// Classify one parsed frame.
    pub fn from_value(value: Value) -> Result<Self> {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(Error::MalformedFrame(
                "terminal frame has no 'type' field".to_string(),
            ));
        };

        let frame = match kind {
            "output" => Self::Output(text_field(&value, "data").map_or_else(Bytes::new, |data| {
                Bytes::copy_from_slice(data.as_bytes())
            })),
            "exit" => Self::Exit {
                code: ["code", "exit_code", "exitCode"]
                    .iter()
                    .find_map(|key| value.get(*key).and_then(Value::as_i64))
                    .and_then(|code| i32::try_from(code).ok()),
            },
            "title_change" => Self::TitleChange(
                text_field(&value, "title")
                    .unwrap_or_default()
                    .to_string(),
            ),
            other => Self::Signal {
                kind: other.to_string(),
                body: value,
            },
        };
        Ok(frame)
    }
}

fn text_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
