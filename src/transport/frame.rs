//! Wire frames for stream transports.
//!
//! Frame layout:
//!
//! ```text
//! +----------------+------+-----------------+
//! | length: u32 BE | kind | payload ...     |
//! +----------------+------+-----------------+
//! ```
//!
//! `length` counts every byte after the length field. Payloads:
//! - HELLO: role (u8), version (u8)
//! - READY: empty
//! - MESSAGE: flags (u8), body
//! - CREDIT: count (u64 BE), slots released by the subscriber

use bytes::{Buf, BufMut, BytesMut};

use super::{Result, TransportError};
use crate::message::{Message, MessageFlags};

/// Protocol version sent in HELLO.
pub const PROTOCOL_VERSION: u8 = 1;

const LENGTH_LEN: usize = 4;
const KIND_HELLO: u8 = 1;
const KIND_READY: u8 = 2;
const KIND_MESSAGE: u8 = 3;
const KIND_CREDIT: u8 = 4;

/// Bytes of a MESSAGE frame besides the body (kind + flags).
const MESSAGE_OVERHEAD: usize = 2;
/// Largest non-MESSAGE frame after the length field.
const CONTROL_FRAME_MAX: usize = 1 + 8;
/// Largest body a MESSAGE frame can carry.
const MAX_MESSAGE_BODY: usize = u32::MAX as usize - MESSAGE_OVERHEAD;
/// Most buffer space reserved ahead of a frame's bytes arriving.
const RESERVE_CHUNK: usize = 64 * 1024;

/// Which end of a PUB/SUB connection a socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    fn to_byte(self) -> u8 {
        match self {
            Role::Publisher => 1,
            Role::Subscriber => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Role::Publisher),
            2 => Ok(Role::Subscriber),
            other => Err(TransportError::Protocol(format!("unknown role {}", other))),
        }
    }

    /// The role a valid peer must have.
    pub fn peer(self) -> Self {
        match self {
            Role::Publisher => Role::Subscriber,
            Role::Subscriber => Role::Publisher,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello { role: Role, version: u8 },
    Ready,
    Message(Message),
    Credit(u64),
}

/// Append the encoding of `frame` to `dst`.
///
/// Fails only for a MESSAGE whose body does not fit the length field; `dst`
/// is left untouched then.
pub fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    match frame {
        Frame::Hello { role, version } => {
            dst.reserve(LENGTH_LEN + 3);
            dst.put_u32(3);
            dst.put_u8(KIND_HELLO);
            dst.put_u8(role.to_byte());
            dst.put_u8(*version);
        }
        Frame::Ready => {
            dst.reserve(LENGTH_LEN + 1);
            dst.put_u32(1);
            dst.put_u8(KIND_READY);
        }
        Frame::Message(msg) => encode_message(msg, dst)?,
        Frame::Credit(count) => {
            dst.reserve(LENGTH_LEN + 9);
            dst.put_u32(9);
            dst.put_u8(KIND_CREDIT);
            dst.put_u64(*count);
        }
    }
    Ok(())
}

/// Append a MESSAGE frame without building a `Frame` first.
pub fn encode_message(msg: &Message, dst: &mut BytesMut) -> Result<()> {
    let body = msg.body();
    let len = message_frame_len(body.len())?;
    dst.reserve(LENGTH_LEN + len as usize);
    dst.put_u32(len);
    dst.put_u8(KIND_MESSAGE);
    dst.put_u8(msg.flags().bits());
    dst.extend_from_slice(body);
    Ok(())
}

/// Length field of a MESSAGE frame carrying `body_len` bytes.
fn message_frame_len(body_len: usize) -> Result<u32> {
    body_len
        .checked_add(MESSAGE_OVERHEAD)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or(TransportError::FrameTooLarge {
            size: body_len,
            max: MAX_MESSAGE_BODY,
        })
}

/// Largest length field accepted from a peer limited to `max_message_size`.
fn frame_limit(max_message_size: Option<usize>) -> Option<usize> {
    max_message_size.map(|max| max.saturating_add(MESSAGE_OVERHEAD).max(CONTROL_FRAME_MAX))
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a complete frame. The
/// message body is split off `src` without copying. `max_message_size`
/// bounds MESSAGE bodies; `None` means unlimited.
pub fn decode(src: &mut BytesMut, max_message_size: Option<usize>) -> Result<Option<Frame>> {
    decode_within(src, max_message_size, frame_limit(max_message_size))
}

/// Decode a greeting frame. Lengths beyond a control frame are rejected
/// before any buffer space is reserved for them.
pub fn decode_control(src: &mut BytesMut) -> Result<Option<Frame>> {
    decode_within(src, Some(0), Some(CONTROL_FRAME_MAX))
}

fn decode_within(
    src: &mut BytesMut,
    max_message_size: Option<usize>,
    limit: Option<usize>,
) -> Result<Option<Frame>> {
    if src.len() < LENGTH_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len == 0 {
        return Err(TransportError::Protocol("empty frame".to_string()));
    }

    // Reject oversized frames from the header alone.
    let kind = if src.len() > LENGTH_LEN {
        Some(src[LENGTH_LEN])
    } else {
        None
    };
    match kind {
        Some(KIND_MESSAGE) => {
            if let Some(max) = max_message_size {
                let body = len.saturating_sub(MESSAGE_OVERHEAD);
                if body > max {
                    return Err(TransportError::FrameTooLarge { size: body, max });
                }
            }
        }
        Some(_) if len > CONTROL_FRAME_MAX => {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: CONTROL_FRAME_MAX,
            });
        }
        _ => {}
    }
    // Kind not seen yet: the header alone must fit the limit.
    if let Some(limit) = limit {
        if len > limit {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: limit,
            });
        }
    }

    if src.len() < LENGTH_LEN + len {
        src.reserve((LENGTH_LEN + len - src.len()).min(RESERVE_CHUNK));
        return Ok(None);
    }

    src.advance(LENGTH_LEN);
    let mut frame = src.split_to(len);
    let kind = frame.get_u8();
    let parsed = match kind {
        KIND_HELLO => {
            expect_len(&frame, 2, "HELLO")?;
            let role = Role::from_byte(frame.get_u8())?;
            let version = frame.get_u8();
            Frame::Hello { role, version }
        }
        KIND_READY => {
            expect_len(&frame, 0, "READY")?;
            Frame::Ready
        }
        KIND_MESSAGE => {
            if frame.is_empty() {
                return Err(TransportError::Protocol("MESSAGE without flags".to_string()));
            }
            let flags = MessageFlags::from_bits_truncate(frame.get_u8());
            Frame::Message(Message::with_flags(frame.freeze(), flags))
        }
        KIND_CREDIT => {
            expect_len(&frame, 8, "CREDIT")?;
            Frame::Credit(frame.get_u64())
        }
        other => {
            return Err(TransportError::Protocol(format!(
                "unknown frame kind {}",
                other
            )))
        }
    };
    Ok(Some(parsed))
}

fn expect_len(payload: &BytesMut, expected: usize, what: &str) -> Result<()> {
    if payload.len() != expected {
        return Err(TransportError::Protocol(format!(
            "{} payload of {} bytes, expected {}",
            what,
            payload.len(),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        encode(&frame, &mut buf).unwrap();
        let decoded = decode(&mut buf, None).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_control_frames() {
        let hello = Frame::Hello {
            role: Role::Subscriber,
            version: PROTOCOL_VERSION,
        };
        assert_eq!(roundtrip(hello.clone()), hello);
        assert_eq!(roundtrip(Frame::Ready), Frame::Ready);
        assert_eq!(roundtrip(Frame::Credit(u64::MAX)), Frame::Credit(u64::MAX));
    }

    #[test]
    fn test_message_keeps_flags_and_body() {
        let msg = Message::with_flags("part one", MessageFlags::MORE);
        match roundtrip(Frame::Message(msg)) {
            Frame::Message(decoded) => {
                assert!(decoded.has_more());
                assert_eq!(decoded.body().as_ref(), b"part one");
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_message() {
        let mut buf = BytesMut::new();
        encode_message(&Message::empty(), &mut buf).unwrap();
        assert_eq!(buf.len(), 6);
        match decode(&mut buf, Some(0)).unwrap() {
            Some(Frame::Message(msg)) => assert!(msg.is_empty()),
            other => panic!("expected empty message, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        let mut full = BytesMut::new();
        encode(&Frame::Message(Message::from("abcdef")), &mut full).unwrap();
        encode(&Frame::Credit(3), &mut full).unwrap();

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in full.iter() {
            buf.put_u8(*byte);
            while let Some(frame) = decode(&mut buf, None).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(
            frames,
            vec![Frame::Message(Message::from("abcdef")), Frame::Credit(3)]
        );
    }

    #[test]
    fn test_oversized_message_rejected_from_header() {
        let mut buf = BytesMut::new();
        buf.put_u32(1002);
        buf.put_u8(KIND_MESSAGE);
        assert!(matches!(
            decode(&mut buf, Some(100)),
            Err(TransportError::FrameTooLarge { size: 1000, max: 100 })
        ));
    }

    #[test]
    fn test_bare_oversized_header_rejected() {
        let mut buf = BytesMut::from(&[0xFF; 4][..]);
        assert!(matches!(
            decode(&mut buf, Some(64)),
            Err(TransportError::FrameTooLarge { size, max: 66 }) if size == u32::MAX as usize
        ));
        assert!(buf.capacity() < RESERVE_CHUNK);
    }

    #[test]
    fn test_greeting_rejects_long_frames() {
        let mut buf = BytesMut::new();
        buf.put_u32(1000);
        assert!(matches!(
            decode_control(&mut buf),
            Err(TransportError::FrameTooLarge { size: 1000, max: CONTROL_FRAME_MAX })
        ));

        let mut buf = BytesMut::new();
        encode(&Frame::Ready, &mut buf).unwrap();
        assert_eq!(decode_control(&mut buf).unwrap(), Some(Frame::Ready));
    }

    #[test]
    fn test_unlimited_decode_reserves_in_chunks() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u8(KIND_MESSAGE);
        assert!(decode(&mut buf, None).unwrap().is_none());
        assert!(buf.capacity() <= LENGTH_LEN + 1 + RESERVE_CHUNK + 64);
    }

    #[test]
    fn test_message_length_field_overflow() {
        assert_eq!(message_frame_len(10).unwrap(), 12);
        assert_eq!(message_frame_len(MAX_MESSAGE_BODY).unwrap(), u32::MAX);
        assert!(matches!(
            message_frame_len(MAX_MESSAGE_BODY + 1),
            Err(TransportError::FrameTooLarge { max: MAX_MESSAGE_BODY, .. })
        ));
        assert!(message_frame_len(usize::MAX).is_err());
    }

    #[test]
    fn test_malformed_frames() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(matches!(
            decode(&mut buf, None),
            Err(TransportError::Protocol(_))
        ));

        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(matches!(
            decode(&mut buf, None),
            Err(TransportError::Protocol(_))
        ));

        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(KIND_HELLO);
        buf.put_u8(7);
        buf.put_u8(PROTOCOL_VERSION);
        assert!(matches!(
            decode(&mut buf, None),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_role_peer() {
        assert_eq!(Role::Publisher.peer(), Role::Subscriber);
        assert_eq!(Role::Subscriber.peer(), Role::Publisher);
    }
}
