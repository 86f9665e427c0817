//! Text command/response protocol
//!
//! Control commands are ASCII lines of the form `NAME[,arg]*\n`. Every command
//! sent to an instrument is echoed back; [`ControlProtocol::confirm_transmission`]
//! checks that the echo names the same command with the same arguments, where
//! numeric arguments may differ by at most [`ARGUMENT_TOLERANCE`] because
//! some firmware echoes normalized values.
//!
//! # Commands
//!
//! | command | reply |
//! |---|---|
//! | `ID_G` | `ID_G,<id>` |
//! | `PRDS,<ms>` | echo |
//! | `STRT` | echo |
//! | `STOP` | echo |

use crate::backend::serial_channel::SerialLink;
use crate::error::{DaqError, Result};

/// Largest accepted difference between a sent and an echoed argument
pub const ARGUMENT_TOLERANCE: f64 = 0.1;

/// Delimiters used when comparing a command with its echo
pub const ECHO_DELIMITERS: &str = ", \r\n";

/// Delimiters used when splitting a query reply
pub const REPLY_DELIMITERS: &str = ",\r\n";

/// Commands understood by the instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Query the instrument identifier
    IdentityQuery,
    /// Set the telemetry period in milliseconds
    SetSamplingPeriod(u32),
    /// Start streaming telemetry
    Start,
    /// Stop streaming telemetry
    Stop,
}

impl Command {
    /// Command name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Command::IdentityQuery => "ID_G",
            Command::SetSamplingPeriod(_) => "PRDS",
            Command::Start => "STRT",
            Command::Stop => "STOP",
        }
    }

    /// Newline-terminated wire form
    pub fn to_wire(&self) -> String {
        format!("{}\n", self)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SetSamplingPeriod(ms) => write!(f, "{},{}", self.name(), ms),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Split `text` on any of the `delimiters`, dropping empty tokens
pub fn tokenize(text: &str, delimiters: &str) -> Vec<String> {
    text.split(|c: char| delimiters.contains(c))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Check that `reply` is a faithful echo of `sent`
pub fn validate_echo(sent: &str, reply: &str) -> Result<()> {
    let command = sent.trim_end().to_string();
    let sent_tokens = tokenize(sent, ECHO_DELIMITERS);
    let reply_tokens = tokenize(reply, ECHO_DELIMITERS);

    let expected_name = sent_tokens.first().map(String::as_str).unwrap_or_default();
    let received_name = reply_tokens.first().map(String::as_str).unwrap_or_default();
    if expected_name != received_name {
        return Err(DaqError::ProtocolMismatch {
            command,
            expected: expected_name.to_string(),
            received: received_name.to_string(),
        });
    }

    if sent_tokens.len() != reply_tokens.len() {
        return Err(DaqError::ArgumentCountMismatch {
            command,
            expected: sent_tokens.len().saturating_sub(1),
            received: reply_tokens.len().saturating_sub(1),
        });
    }

    for (index, (expected, received)) in sent_tokens
        .iter()
        .zip(reply_tokens.iter())
        .enumerate()
        .skip(1)
    {
        let matches = match (expected.parse::<f64>(), received.parse::<f64>()) {
            (Ok(a), Ok(b)) => (a - b).abs() <= ARGUMENT_TOLERANCE,
            _ => false,
        };
        if !matches {
            return Err(DaqError::ArgumentValueMismatch {
                command,
                index,
                expected: expected.clone(),
                received: received.clone(),
            });
        }
    }

    Ok(())
}

/// Command/response operations over a device's serial link
pub struct ControlProtocol<'a> {
    link: &'a dyn SerialLink,
}

impl<'a> ControlProtocol<'a> {
    /// Wrap a link
    pub fn new(link: &'a dyn SerialLink) -> Self {
        Self { link }
    }

    /// Write a raw command string
    pub fn send(&self, command: &str) -> usize {
        self.link.write(command.as_bytes())
    }

    /// Read one reply line and validate it as the echo of `command`
    pub fn confirm_transmission(&self, command: &str) -> Result<()> {
        let reply = self.link.read_line();
        validate_echo(command, &reply)
    }

    /// Send a command and confirm its echo
    pub fn execute(&self, command: Command) -> Result<()> {
        let wire = command.to_wire();
        self.send(&wire);
        self.confirm_transmission(&wire)
    }

    /// Send a query and return the reply tokens after the command name
    pub fn write_and_tokenize_result(&self, command: &str) -> Result<Vec<String>> {
        self.send(command);
        let reply = self.link.read_line();
        let mut tokens = tokenize(&reply, REPLY_DELIMITERS);

        let expected = tokenize(command, REPLY_DELIMITERS)
            .into_iter()
            .next()
            .unwrap_or_default();
        let received = tokens.first().cloned().unwrap_or_default();
        if received != expected {
            return Err(DaqError::ProtocolMismatch {
                command: command.trim_end().to_string(),
                expected,
                received,
            });
        }

        tokens.remove(0);
        Ok(tokens)
    }
}
