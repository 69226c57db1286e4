//! Framed codec for worker connections.
//!
//! v1 frames are newline-terminated lines. v2 frames are a 6-digit decimal
//! length (zero- or space-padded) followed by that many bytes of command text.
//! The protocol is fixed by the first byte a connection sends: an ASCII digit
//! or a space means v2.
//!
//! An over-long v1 line is skipped through its newline and reported as
//! [`Decoded::Skipped`], leaving the connection usable. A bad v2 length cannot
//! be resynchronized and is a decode error.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::command::{ProtocolVersion, Response};
use crate::error::FrameError;

/// Width of the v2 length prefix.
pub const V2_LENGTH_DIGITS: usize = 6;

/// Largest body a v2 length prefix can describe.
pub const V2_MAX_BODY: usize = 999_999;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// One decoded command frame, length prefix already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: ProtocolVersion,
    pub body: Bytes,
}

impl Frame {
    pub fn new(version: ProtocolVersion, body: impl Into<Bytes>) -> Self {
        Self {
            version,
            body: body.into(),
        }
    }
}

/// What the decoder produced.
#[derive(Debug)]
pub enum Decoded {
    Frame(Frame),
    /// A frame that was dropped without losing sync with the stream.
    Skipped {
        version: ProtocolVersion,
        error: FrameError,
    },
}

/// Codec that frames v1 lines and v2 length-prefixed blocks.
pub struct PmiCodec {
    version: Option<ProtocolVersion>,
    max_length: usize,
    /// Where to resume the newline scan on the next v1 decode.
    next_index: usize,
    /// Dropping the rest of an over-long v1 line.
    is_discarding: bool,
}

impl Default for PmiCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PmiCodec {
    pub fn new() -> Self {
        Self {
            version: None,
            max_length: DEFAULT_MAX_FRAME_LENGTH,
            next_index: 0,
            is_discarding: false,
        }
    }

    /// Set the largest accepted frame body.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Protocol detected on this connection, if any frame has started yet.
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, FrameError> {
        loop {
            let scan_from = self.next_index.min(src.len());
            let newline = src[scan_from..].iter().position(|&b| b == b'\n');
            match (self.is_discarding, newline) {
                (true, Some(offset)) => {
                    src.advance(scan_from + offset + 1);
                    self.is_discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(offset)) => {
                    let end = scan_from + offset + 1;
                    self.next_index = 0;
                    if end > self.max_length {
                        src.advance(end);
                        return Ok(Some(self.skipped(end)));
                    }
                    let body = src.split_to(end).freeze();
                    return Ok(Some(Decoded::Frame(Frame::new(ProtocolVersion::V1, body))));
                }
                (false, None) if src.len() > self.max_length => {
                    let len = src.len();
                    src.clear();
                    self.next_index = 0;
                    self.is_discarding = true;
                    return Ok(Some(self.skipped(len)));
                }
                (false, None) => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn skipped(&self, len: usize) -> Decoded {
        tracing::debug!(len, max = self.max_length, "Skipping over-long line");
        Decoded::Skipped {
            version: ProtocolVersion::V1,
            error: FrameError::TooLong {
                len,
                max: self.max_length,
            },
        }
    }

    fn decode_block(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, FrameError> {
        if src.len() < V2_LENGTH_DIGITS {
            return Ok(None);
        }

        let prefix = &src[..V2_LENGTH_DIGITS];
        let len = std::str::from_utf8(prefix)
            .ok()
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| FrameError::BadLength(String::from_utf8_lossy(prefix).into_owned()))?;

        if len > self.max_length {
            return Err(FrameError::TooLong {
                len,
                max: self.max_length,
            });
        }

        if src.len() < V2_LENGTH_DIGITS + len {
            src.reserve(V2_LENGTH_DIGITS + len - src.len());
            return Ok(None);
        }

        src.advance(V2_LENGTH_DIGITS);
        let body = src.split_to(len).freeze();
        Ok(Some(Decoded::Frame(Frame::new(ProtocolVersion::V2, body))))
    }
}

impl Decoder for PmiCodec {
    type Item = Decoded;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let version = match self.version {
            Some(version) => version,
            None => {
                let Some(&first) = src.first() else {
                    return Ok(None);
                };
                let version = if first.is_ascii_digit() || first == b' ' {
                    ProtocolVersion::V2
                } else {
                    ProtocolVersion::V1
                };
                tracing::trace!(%version, "Detected protocol version");
                self.version = Some(version);
                version
            }
        };

        match version {
            ProtocolVersion::V1 => self.decode_line(src),
            ProtocolVersion::V2 => self.decode_block(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        match self.version {
            // A final v1 line without its newline is still a whole command.
            Some(ProtocolVersion::V1) => {
                self.next_index = 0;
                let body = src.split_to(src.len()).freeze();
                Ok(Some(Decoded::Frame(Frame::new(ProtocolVersion::V1, body))))
            }
            _ => Err(FrameError::Truncated(src.len())),
        }
    }
}

impl Encoder<Response> for PmiCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        tracing::trace!(version = %item.version(), len = wire.len(), "Encoding response");
        match item.version() {
            ProtocolVersion::V1 => {
                dst.extend_from_slice(wire.as_bytes());
            }
            ProtocolVersion::V2 => {
                if wire.len() > V2_MAX_BODY {
                    return Err(FrameError::TooLong {
                        len: wire.len(),
                        max: V2_MAX_BODY,
                    });
                }
                dst.reserve(V2_LENGTH_DIGITS + wire.len());
                dst.extend_from_slice(format!("{:06}", wire.len()).as_bytes());
                dst.extend_from_slice(wire.as_bytes());
            }
        }
        Ok(())
    }
}
