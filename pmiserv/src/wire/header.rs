//! Fixed-layout binary header exchanged between the launcher and its proxies.
//!
//! On-wire layout (little-endian):
//! ```text
//! [cmd:i32][buflen:i32][payload: buflen bytes, absent when buflen == -1]
//! ```
//! The payload is opaque here.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;

/// Header command codes.
///
/// Real commands start at 1 and `Invalid` is -1, so an all-zero record never
/// decodes as a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderCmd {
    Invalid,
    /// Launcher → proxy: process placement and environment for a launch.
    ProcInfo,
    /// Launcher → proxy: a PMI response to relay to a local process.
    PmiResponse,
    /// Launcher → proxy: deliver a signal to local processes.
    Signal,
    /// Launcher → proxy: stdin data for the root process.
    Stdin,
    /// Proxy → launcher: local process ids after launch.
    PidList,
    /// Proxy → launcher: exit statuses of local processes.
    ExitStatus,
    /// Proxy → launcher: a PMI command forwarded from a local process.
    Pmi,
    Stdout,
    Stderr,
    /// Proxy → launcher: a local process terminated abnormally.
    ProcessTerminated,
}

impl HeaderCmd {
    /// Wire discriminant value.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Invalid => -1,
            Self::ProcInfo => 1,
            Self::PmiResponse => 2,
            Self::Signal => 3,
            Self::Stdin => 4,
            Self::PidList => 5,
            Self::ExitStatus => 6,
            Self::Pmi => 7,
            Self::Stdout => 8,
            Self::Stderr => 9,
            Self::ProcessTerminated => 10,
        }
    }

    /// Parse a wire discriminant; `None` for unknown codes and the sentinel.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::ProcInfo),
            2 => Some(Self::PmiResponse),
            3 => Some(Self::Signal),
            4 => Some(Self::Stdin),
            5 => Some(Self::PidList),
            6 => Some(Self::ExitStatus),
            7 => Some(Self::Pmi),
            8 => Some(Self::Stdout),
            9 => Some(Self::Stderr),
            10 => Some(Self::ProcessTerminated),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Invalid => "INVALID",
            Self::ProcInfo => "PROC_INFO",
            Self::PmiResponse => "PMI_RESPONSE",
            Self::Signal => "SIGNAL",
            Self::Stdin => "STDIN",
            Self::PidList => "PID_LIST",
            Self::ExitStatus => "EXIT_STATUS",
            Self::Pmi => "PMI",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::ProcessTerminated => "PROCESS_TERMINATED",
        };
        f.write_str(label)
    }
}

/// Launcher/proxy header. `buflen == -1` means no payload follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    pub cmd: HeaderCmd,
    pub buflen: i32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            cmd: HeaderCmd::Invalid,
            buflen: -1,
        }
    }
}

impl Header {
    pub const WIRE_BYTES: usize = 8;

    pub fn new(cmd: HeaderCmd) -> Self {
        Self {
            cmd,
            ..Self::default()
        }
    }

    /// Payload length, or `None` when no payload follows.
    pub fn payload_len(&self) -> Option<usize> {
        usize::try_from(self.buflen).ok()
    }

    pub fn to_bytes(self) -> [u8; Self::WIRE_BYTES] {
        let mut out = [0u8; Self::WIRE_BYTES];
        out[..4].copy_from_slice(&self.cmd.code().to_le_bytes());
        out[4..].copy_from_slice(&self.buflen.to_le_bytes());
        out
    }

    pub fn from_bytes(src: [u8; Self::WIRE_BYTES]) -> Result<Self, FrameError> {
        let code = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let buflen = i32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        let cmd = HeaderCmd::from_code(code).ok_or(FrameError::UnknownCommand(code))?;
        if buflen < -1 {
            return Err(FrameError::BadLength(buflen.to_string()));
        }
        Ok(Self { cmd, buflen })
    }
}

/// A header with its payload, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyFrame {
    pub header: Header,
    pub payload: Option<Bytes>,
}

impl ProxyFrame {
    pub fn new(cmd: HeaderCmd) -> Self {
        Self {
            header: Header::new(cmd),
            payload: None,
        }
    }

    pub fn with_payload(cmd: HeaderCmd, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let mut header = Header::new(cmd);
        header.buflen = i32::try_from(payload.len()).unwrap_or(i32::MAX);
        Self {
            header,
            payload: Some(payload),
        }
    }
}

/// Codec for launcher/proxy header frames.
pub struct HeaderCodec {
    max_payload: usize,
    /// Header already read while waiting for its payload.
    pending: Option<Header>,
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCodec {
    pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            max_payload: Self::DEFAULT_MAX_PAYLOAD,
            pending: None,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

impl Decoder for HeaderCodec {
    type Item = ProxyFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                if src.len() < Header::WIRE_BYTES {
                    return Ok(None);
                }
                let mut raw = [0u8; Header::WIRE_BYTES];
                src.copy_to_slice(&mut raw);
                Header::from_bytes(raw)?
            }
        };

        let Some(len) = header.payload_len() else {
            return Ok(Some(ProxyFrame {
                header,
                payload: None,
            }));
        };

        if len > self.max_payload {
            return Err(FrameError::TooLong {
                len,
                max: self.max_payload,
            });
        }

        if src.len() < len {
            src.reserve(len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(len).freeze();
        Ok(Some(ProxyFrame {
            header,
            payload: Some(payload),
        }))
    }
}

impl Encoder<ProxyFrame> for HeaderCodec {
    type Error = FrameError;

    fn encode(&mut self, item: ProxyFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.header.cmd == HeaderCmd::Invalid {
            return Err(FrameError::InvalidHeader);
        }

        let mut header = item.header;
        let payload_len = item.payload.as_ref().map_or(0, Bytes::len);
        header.buflen = match item.payload {
            Some(_) => i32::try_from(payload_len).map_err(|_| FrameError::TooLong {
                len: payload_len,
                max: i32::MAX as usize,
            })?,
            None => -1,
        };

        dst.reserve(Header::WIRE_BYTES + payload_len);
        dst.put_slice(&header.to_bytes());
        if let Some(payload) = item.payload {
            dst.put_slice(&payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_header_is_invalid_without_payload() {
        let header = Header::default();
        assert_eq!(header.cmd, HeaderCmd::Invalid);
        assert_eq!(header.buflen, -1);
        assert_eq!(header.payload_len(), None);
    }

    #[test]
    fn zeroed_record_does_not_decode_as_a_command() {
        let err = Header::from_bytes([0u8; Header::WIRE_BYTES]).unwrap_err();
        assert!(matches!(err, FrameError::UnknownCommand(0)));
    }

    #[test]
    fn sentinel_code_does_not_decode() {
        let raw = Header::default().to_bytes();
        assert!(matches!(
            Header::from_bytes(raw),
            Err(FrameError::UnknownCommand(-1))
        ));
    }

    #[test]
    fn codes_round_trip() {
        for code in 1..=10 {
            let cmd = HeaderCmd::from_code(code).unwrap();
            assert_eq!(cmd.code(), code);
        }
        assert_eq!(HeaderCmd::from_code(11), None);
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let header = Header {
            cmd: HeaderCmd::Pmi,
            buflen: 300,
        };
        assert_eq!(header.to_bytes(), [7, 0, 0, 0, 44, 1, 0, 0]);
    }

    #[test]
    fn frame_without_payload() {
        let mut codec = HeaderCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(ProxyFrame::new(HeaderCmd::Signal), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), Header::WIRE_BYTES);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.cmd, HeaderCmd::Signal);
        assert_eq!(frame.header.buflen, -1);
        assert!(frame.payload.is_none());
    }

    #[test]
    fn payload_split_across_reads() {
        let mut codec = HeaderCodec::new();
        let mut wire = BytesMut::new();
        codec
            .encode(
                ProxyFrame::with_payload(HeaderCmd::Pmi, &b"cmd=barrier_in\n"[..]),
                &mut wire,
            )
            .unwrap();

        let mut src = wire.split_to(Header::WIRE_BYTES + 4);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.unsplit(wire);

        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.header.buflen, 15);
        assert_eq!(frame.payload.as_deref(), Some(&b"cmd=barrier_in\n"[..]));
    }

    #[test]
    fn refuses_to_encode_sentinel() {
        let mut codec = HeaderCodec::new();
        let mut buf = BytesMut::new();
        let err = codec
            .encode(
                ProxyFrame {
                    header: Header::default(),
                    payload: None,
                },
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(err, FrameError::InvalidHeader));
        assert!(buf.is_empty());
    }

    #[test]
    fn negative_length_other_than_sentinel_is_rejected() {
        let mut raw = [0u8; Header::WIRE_BYTES];
        raw[..4].copy_from_slice(&HeaderCmd::Stdout.code().to_le_bytes());
        raw[4..].copy_from_slice(&(-7i32).to_le_bytes());
        assert!(matches!(
            Header::from_bytes(raw),
            Err(FrameError::BadLength(ref s)) if s == "-7"
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut codec = HeaderCodec::new().with_max_payload(4);
        let mut buf = BytesMut::new();
        buf.put_slice(
            &Header {
                cmd: HeaderCmd::Stdin,
                buflen: 5,
            }
            .to_bytes(),
        );
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLong { len: 5, max: 4 })
        ));
    }
}
