//! Packet layout and framing: length-prefix (4 bytes BE) + payload.
//!
//! Request payload: raw 8-byte method id, then tagged arguments.
//! Reply payload: status byte (0 ok, 1 fault), then tagged values. A fault
//! carries a single string with the error message.

use crate::id::Id;
use crate::value::{CodecError, PacketReader, PacketWriter, Value};

const LEN_SIZE: usize = 4;
/// Largest payload accepted in one frame.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

const STATUS_OK: u8 = 0;
const STATUS_FAULT: u8 = 1;

/// Wrap a payload into a single frame: 4 bytes BE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Payload length announced by a frame header.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameError> {
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    Ok(len as usize)
}

/// A frame announced or built with a payload over `MAX_FRAME_LEN`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large")]
    TooLarge,
}

/// A call: target method plus arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Id,
    pub args: Vec<Value>,
}

impl Request {
    pub fn new(method: Id, args: Vec<Value>) -> Self {
        Self { method, args }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = PacketWriter::new();
        w.put_raw_id(self.method)?;
        w.put_all(&self.args)?;
        Ok(w.into_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = PacketReader::new(payload);
        let method = r.read_raw_id()?;
        let args = r.read_values()?;
        Ok(Self { method, args })
    }
}

/// Outcome of a call as carried back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok(Vec<Value>),
    Fault(String),
}

impl Reply {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = PacketWriter::new();
        match self {
            Reply::Ok(values) => {
                w.put_raw_u8(STATUS_OK)?;
                w.put_all(values)?;
            }
            Reply::Fault(message) => {
                w.put_raw_u8(STATUS_FAULT)?;
                w.put(&Value::Str(message.clone()))?;
            }
        }
        Ok(w.into_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = PacketReader::new(payload);
        match r.read_raw_u8()? {
            STATUS_OK => Ok(Reply::Ok(r.read_values()?)),
            STATUS_FAULT => match r.read_values()?.as_slice() {
                [Value::Str(message)] => Ok(Reply::Fault(message.clone())),
                other => Err(CodecError::MalformedReply(format!(
                    "fault carries {} values",
                    other.len()
                ))),
            },
            status => Err(CodecError::MalformedReply(format!("status {status}"))),
        }
    }

    /// Reply for a handler failure.
    pub fn fault(err: impl std::fmt::Display) -> Self {
        Reply::Fault(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values;

    #[test]
    fn request_layout() {
        let req = Request::new(Id::new(3), values![5i32]);
        let bytes = req.encode().unwrap();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn request_without_id_is_truncated() {
        assert!(matches!(
            Request::decode(&[0, 0, 1]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn fault_reply() {
        let reply = Reply::fault("invalid method id :9");
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded, Reply::Fault("invalid method id :9".into()));
        assert!(matches!(
            Reply::decode(&[7]),
            Err(CodecError::MalformedReply(_))
        ));
    }

    #[test]
    fn empty_ok_reply() {
        let bytes = Reply::Ok(vec![]).encode().unwrap();
        assert_eq!(bytes, vec![STATUS_OK]);
        assert_eq!(Reply::decode(&bytes).unwrap(), Reply::Ok(vec![]));
    }

    #[test]
    fn frame_header_announces_payload() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(frame.len(), LEN_SIZE + 5);
        let header = [frame[0], frame[1], frame[2], frame[3]];
        assert_eq!(frame_len(header), Ok(5));
        assert_eq!(&frame[LEN_SIZE..], b"hello");
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_be_bytes();
        assert_eq!(frame_len(header), Err(FrameError::TooLarge));
    }
}
