//! TFTP packet encoding and decoding (RFC 1350).
//!
//! ```text
//!  RRQ/WRQ  | 01/02 | filename | 0 | mode | 0 |
//!  DATA     | 03    | block #  | payload (0..512)  |
//!  ACK      | 04    | block #  |
//!  ERROR    | 05    | code     | message | 0 |
//! ```
//!
//! All 2-byte fields are big-endian. A DATA payload shorter than
//! [`BLOCK_SIZE`] marks the terminal block of a transfer.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{ErrorCode, Opcode, Result, TftpError, BLOCK_SIZE, DATA_HEADER_LEN, OCTET_MODE};

/// A decoded TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest { filename: String },
    WriteRequest { filename: String },
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

impl Packet {
    /// Build an ERROR packet.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::ReadRequest { .. } => Opcode::ReadRequest,
            Packet::WriteRequest { .. } => Opcode::WriteRequest,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    /// `true` for a DATA packet whose payload is shorter than a full block.
    pub fn is_terminal_data(&self) -> bool {
        matches!(self, Packet::Data { payload, .. } if payload.len() < BLOCK_SIZE)
    }

    /// Decode a datagram.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(TftpError::Truncated {
                need: 2,
                got: buf.len(),
            });
        }
        let opcode = Opcode::from_u16(BigEndian::read_u16(&buf[0..2]))?;
        let body = &buf[2..];

        match opcode {
            Opcode::ReadRequest => {
                let filename = decode_request(body)?;
                Ok(Packet::ReadRequest { filename })
            }
            Opcode::WriteRequest => {
                let filename = decode_request(body)?;
                Ok(Packet::WriteRequest { filename })
            }
            Opcode::Data => {
                if buf.len() < DATA_HEADER_LEN {
                    return Err(TftpError::Truncated {
                        need: DATA_HEADER_LEN,
                        got: buf.len(),
                    });
                }
                let payload = &buf[DATA_HEADER_LEN..];
                if payload.len() > BLOCK_SIZE {
                    return Err(TftpError::PayloadTooLarge(payload.len()));
                }
                Ok(Packet::Data {
                    block: BigEndian::read_u16(&buf[2..4]),
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            Opcode::Ack => {
                if buf.len() != 4 {
                    return Err(TftpError::BadLength {
                        opcode,
                        len: buf.len(),
                    });
                }
                Ok(Packet::Ack {
                    block: BigEndian::read_u16(&buf[2..4]),
                })
            }
            Opcode::Error => {
                if buf.len() < 4 {
                    return Err(TftpError::Truncated {
                        need: 4,
                        got: buf.len(),
                    });
                }
                let code = ErrorCode::from_u16(BigEndian::read_u16(&buf[2..4]));
                // Peers do not always terminate the message; take what is there.
                let raw = &buf[4..];
                let raw = match raw.iter().position(|&b| b == 0) {
                    Some(end) => &raw[..end],
                    None => raw,
                };
                Ok(Packet::Error {
                    code,
                    message: String::from_utf8_lossy(raw).into_owned(),
                })
            }
        }
    }

    /// Encode into a datagram.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(self.opcode().as_u16());

        match self {
            Packet::ReadRequest { filename } | Packet::WriteRequest { filename } => {
                put_cstr(&mut buf, filename, "filename")?;
                put_cstr(&mut buf, OCTET_MODE, "mode")?;
            }
            Packet::Data { block, payload } => {
                if payload.len() > BLOCK_SIZE {
                    return Err(TftpError::PayloadTooLarge(payload.len()));
                }
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => buf.put_u16(*block),
            Packet::Error { code, message } => {
                buf.put_u16(code.as_u16());
                put_cstr(&mut buf, message, "error message")?;
            }
        }

        Ok(buf.freeze())
    }

    fn encoded_len(&self) -> usize {
        match self {
            Packet::ReadRequest { filename } | Packet::WriteRequest { filename } => {
                2 + filename.len() + 1 + OCTET_MODE.len() + 1
            }
            Packet::Data { payload, .. } => DATA_HEADER_LEN + payload.len(),
            Packet::Ack { .. } => 4,
            Packet::Error { message, .. } => 4 + message.len() + 1,
        }
    }
}

/// Encode an ACK for `block`.
pub fn encode_ack(block: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16(Opcode::Ack.as_u16());
    buf.put_u16(block);
    buf.freeze()
}

/// Split `filename\0mode\0` and validate the mode. Anything after the
/// second terminator (RFC 2347 options) is ignored.
fn decode_request(body: &[u8]) -> Result<String> {
    let name_end = body
        .iter()
        .position(|&b| b == 0)
        .ok_or(TftpError::MissingTerminator("filename"))?;
    let rest = &body[name_end + 1..];
    let mode_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(TftpError::MissingTerminator("mode"))?;

    let filename = std::str::from_utf8(&body[..name_end])
        .map_err(|_| TftpError::InvalidText("filename"))?;
    if filename.is_empty() {
        return Err(TftpError::EmptyField("filename"));
    }

    let mode = &rest[..mode_end];
    if !mode.eq_ignore_ascii_case(OCTET_MODE.as_bytes()) {
        return Err(TftpError::UnsupportedMode(
            String::from_utf8_lossy(mode).into_owned(),
        ));
    }

    Ok(filename.to_owned())
}

fn put_cstr(buf: &mut BytesMut, text: &str, field: &'static str) -> Result<()> {
    if text.as_bytes().contains(&0) {
        return Err(TftpError::EmbeddedNul(field));
    }
    buf.put_slice(text.as_bytes());
    buf.put_u8(0);
    Ok(())
}
