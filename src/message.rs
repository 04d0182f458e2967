//! Message type moved through pipes.
//!
//! A message is an immutable byte payload plus a small set of flags. Once a
//! message is enqueued, nothing mutates it; fan-out clones the `Bytes` handle
//! so every peer sees the same immutable buffer.

use std::fmt;

use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Per-message flags carried alongside the payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        /// More parts of the same logical message follow.
        const MORE = 0b0000_0001;
    }
}

/// Opaque payload unit.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Message {
    body: Bytes,
    flags: MessageFlags,
}

impl Message {
    /// Create a message from anything convertible into `Bytes`.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            flags: MessageFlags::empty(),
        }
    }

    /// Create an empty (zero-length) message.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a message with explicit flags.
    pub fn with_flags(body: impl Into<Bytes>, flags: MessageFlags) -> Self {
        Self {
            body: body.into(),
            flags,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// True when more parts of the same logical message follow.
    pub fn has_more(&self) -> bool {
        self.flags.contains(MessageFlags::MORE)
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Consume the message, returning its payload.
    pub fn into_body(self) -> Bytes {
        self.body
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.body.len())
            .field("flags", &self.flags)
            .finish()
    }
}

impl From<&'static str> for Message {
    fn from(s: &'static str) -> Self {
        Self::new(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Self::new(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_flags() {
        let msg = Message::with_flags("part", MessageFlags::MORE);
        assert!(msg.has_more());
        assert_eq!(msg.len(), 4);

        let last = Message::from("last");
        assert!(!last.has_more());
    }

    #[test]
    fn test_clone_shares_payload() {
        let msg = Message::from(vec![1u8, 2, 3]);
        let copy = msg.clone();
        assert_eq!(msg.body().as_ptr(), copy.body().as_ptr());
    }

    #[test]
    fn test_empty_message() {
        let msg = Message::empty();
        assert!(msg.is_empty());
        assert_eq!(msg.flags(), MessageFlags::empty());
    }
}
