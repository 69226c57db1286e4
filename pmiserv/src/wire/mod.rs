//! Wire formats for launcher communication.
//!
//! # Architecture
//!
//! - **command**: v1/v2 text command parsing and response rendering
//! - **codec**: framing codec for worker connections (v1 lines, v2 blocks)
//! - **header**: binary header codec for the launcher/proxy channel

pub mod codec;
pub mod command;
pub mod header;

pub use codec::{Decoded, Frame, PmiCodec};
pub use command::{ParsedCommand, ProtocolVersion, Response, parse_command};
pub use header::{Header, HeaderCmd, HeaderCodec, ProxyFrame};
