//! CLI utilities for wirecall.
//!
//! The utilities in this module back the interactive client: a prompt that reads one line
//! and turns it into a [`Command`] to run against a server.
//!
//! # Example
//! ```rust
//! use serde_json::json;
//! use wirecall::Command;
//!
//! let cmd: Command = r#"echo {"n": 42}"#.try_into().unwrap();
//! assert_eq!(
//!     cmd,
//!     Command::Call {
//!         handler: "echo".to_string(),
//!         data: json!({"n": 42}),
//!         params: json!(null),
//!     }
//! );
//! ```
use std::io::{self, BufRead, Write};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid arguments for '{handler}': {reason}")]
    InvalidArguments { handler: String, reason: String },

    #[error("no command provided")]
    Empty,

    #[error("failed to read command: {0}")]
    Io(#[from] io::Error),
}

/// Possible commands from a user.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `.exit`, or end of input.
    Exit,
    /// `.ping`: liveness probe against the server.
    Ping,
    /// `<handler> [data] [params]`, with `data` and `params` as JSON.
    Call {
        handler: String,
        data: Value,
        params: Value,
    },
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();
        match line {
            "" => Err(CommandError::Empty),
            ".exit" => Ok(Command::Exit),
            ".ping" => Ok(Command::Ping),
            s if s.starts_with('.') => Err(CommandError::UnrecognizedCommand(s.to_string())),
            s => {
                let (handler, rest) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
                let invalid = |reason: String| CommandError::InvalidArguments {
                    handler: handler.to_string(),
                    reason,
                };

                let mut args = Vec::with_capacity(2);
                for value in serde_json::Deserializer::from_str(rest).into_iter::<Value>() {
                    args.push(value.map_err(|e| invalid(e.to_string()))?);
                }
                if args.len() > 2 {
                    return Err(invalid(format!(
                        "expected at most 2 JSON values, got {}",
                        args.len()
                    )));
                }

                let mut args = args.into_iter();
                Ok(Command::Call {
                    handler: handler.to_string(),
                    data: args.next().unwrap_or(Value::Null),
                    params: args.next().unwrap_or(Value::Null),
                })
            }
        }
    }
}

/// Prompt the user for a command. End of input reads as [`Command::Exit`].
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    write!(&mut writer, "> ")?;
    writer.flush()?;

    let mut line = String::default();
    if reader.read_line(&mut line)? == 0 {
        return Ok(Command::Exit);
    }
    Command::try_from(line.as_str())
}
