//! Text command protocols spoken between worker processes and the launcher.
//!
//! - **v1**: `cmd=<name> <key>=<val> ...\n`
//! - **v2**: `<len>cmd=<name>;<key>=<val>;...;` where `<len>` is a 6-digit
//!   decimal that the framing codec strips before anything here runs.
//!
//! Parsing only splits a line into the command name and its raw argument
//! fields. Splitting fields into key/value pairs is [`crate::token`]'s job.

use std::fmt;

use serde::Serialize;

use crate::error::ParseError;

/// Wire protocol revision of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn major(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.major())
    }
}

/// A command line split into its name and opaque argument fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
}

/// Split a raw command line into the command name and argument fields.
///
/// A single trailing newline is stripped first. In v1, a line starting with
/// `cmd=` is split on spaces; any other line is split on newlines (legacy
/// multi-line form). In v2 fields are split on `;`. Runs of delimiters
/// collapse and empty fields are dropped.
///
/// The command name is whatever follows the first `=` of the first field.
pub fn parse_command(raw: &[u8], version: ProtocolVersion) -> Result<ParsedCommand, ParseError> {
    if raw.contains(&0) {
        return Err(ParseError::NulByte);
    }
    let line = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidUtf8)?;
    let line = line.strip_suffix('\n').unwrap_or(line);

    let delim = match version {
        ProtocolVersion::V1 if line.starts_with("cmd=") => ' ',
        ProtocolVersion::V1 => '\n',
        ProtocolVersion::V2 => ';',
    };

    let mut fields = line.split(delim).filter(|f| !f.is_empty());
    let first = fields.next().ok_or(ParseError::MissingCommandName)?;
    let name = match first.split_once('=') {
        Some((_, name)) if !name.is_empty() => name,
        _ => return Err(ParseError::MissingCommandName),
    };

    Ok(ParsedCommand {
        name: name.to_string(),
        args: fields.map(str::to_string).collect(),
    })
}

/// A response line under construction.
///
/// Renders `cmd=<name> k=v ...\n` for v1 and `cmd=<name>;k=v;...;` for v2.
/// The v2 length prefix is added by the framing codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    version: ProtocolVersion,
    body: String,
}

impl Response {
    pub fn new(version: ProtocolVersion, cmd: &str) -> Self {
        let mut body = format!("cmd={cmd}");
        if version == ProtocolVersion::V2 {
            body.push(';');
        }
        Self { version, body }
    }

    pub fn arg(mut self, key: &str, value: impl fmt::Display) -> Self {
        use std::fmt::Write as _;

        // Writing into a String cannot fail.
        let _ = match self.version {
            ProtocolVersion::V1 => write!(self.body, " {key}={value}"),
            ProtocolVersion::V2 => write!(self.body, "{key}={value};"),
        };
        self
    }

    /// Append `rc=<rc>`.
    pub fn rc(self, rc: i32) -> Self {
        self.arg("rc", rc)
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Wire text without the v2 length prefix.
    pub fn to_wire(&self) -> String {
        match self.version {
            ProtocolVersion::V1 => format!("{}\n", self.body),
            ProtocolVersion::V2 => self.body.clone(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body)
    }
}
