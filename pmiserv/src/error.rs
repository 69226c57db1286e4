//! Error types for the rendezvous service.
//!
//! Errors are scoped to the thing that failed: a malformed line fails one
//! command, a full KVS fails one put, an unreadable hostname fails one group.
//! None of them stop the event loop.

use std::collections::TryReserveError;
use std::io;

use crate::group::{Pgid, Pid};
use crate::service::ConnId;

/// A command line that could not be split into a command name and arguments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The first field has no `=`, or nothing follows it.
    #[error("command line has no command name")]
    MissingCommandName,

    #[error("command line contains a NUL byte")]
    NulByte,

    #[error("command line is not valid UTF-8")]
    InvalidUtf8,
}

/// Framing failures on a connection (text protocols and binary header).
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The v2 length prefix or the header buflen is not a usable length.
    #[error("bad frame length field: {0}")]
    BadLength(String),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLong { len: usize, max: usize },

    #[error("unknown header command code {0}")]
    UnknownCommand(i32),

    /// A header still carrying the invalid-command sentinel was about to be sent.
    #[error("refusing to encode a header with the invalid command sentinel")]
    InvalidHeader,

    #[error("connection closed with {0} bytes of a partial frame buffered")]
    Truncated(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Key-value store failures.
#[derive(Debug, thiserror::Error)]
pub enum KvsError {
    /// Strict mode only: the key is already present and the store is unchanged.
    #[error("duplicate key {0}")]
    DuplicateKey(String),

    #[error("unable to get local hostname: {0}")]
    HostnameUnavailable(String),

    #[error("unable to grow key-value store: {0}")]
    AllocationFailure(#[from] TryReserveError),
}

/// Name service failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("service {0} is already published")]
    AlreadyPublished(String),

    #[error("service {0} is not published")]
    NotFound(String),
}

/// Errors surfaced by the command dispatch path.
#[derive(Debug, thiserror::Error)]
pub enum PmiError {
    #[error("malformed command: {0}")]
    Parse(#[from] ParseError),

    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("command `{cmd}` is missing required key `{key}`")]
    MissingKey { cmd: String, key: &'static str },

    #[error("invalid value `{value}` for key `{key}`")]
    InvalidValue { key: &'static str, value: String },

    #[error(transparent)]
    Kvs(#[from] KvsError),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error("process group {0} does not exist")]
    UnknownGroup(Pgid),

    #[error("process group {0} already exists")]
    GroupExists(Pgid),

    #[error("connection {0} is not bound to a process group")]
    UnboundConnection(ConnId),

    #[error("connection {0} lost")]
    ConnectionLost(ConnId),

    #[error("process {pid} in group {pgid} already exited")]
    ProcessExited { pgid: Pgid, pid: Pid },

    #[error("process {pid} is already waiting in the barrier")]
    AlreadyWaiting { pid: Pid },

    #[error("rank {pid} is already bound to connection {holder}")]
    RankInUse { pid: Pid, holder: ConnId },
}
