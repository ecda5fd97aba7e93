//! Application message set and its binary encoding.
//!
//! Payloads are encoded with [`postcard`] behind a one-byte protocol
//! version. Postcard writes the enum variant index as a varint before the
//! variant's fields, so the variant order of [`Message`] *is* the wire
//! discriminator table. Never reorder or remove variants; append new ones.
//!
//! | discriminator | kind             |
//! |---------------|------------------|
//! | 0             | `Content`        |
//! | 1             | `Authentication` |
//! | 2             | `EndOfStream`    |

use serde::{Deserialize, Serialize};

use crate::packet::ConnectionId;

/// Current wire-protocol version. Prepended to every encoded message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Top-level network message. The variant index is the wire discriminator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    /// Free-form application content.
    Content(Content),
    /// Credentials presented by a freshly connected client.
    Authentication(Authentication),
    /// Marks the end of a stream of test or benchmark traffic.
    EndOfStream(EndOfStream),
}

/// Generic string payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Content {
    pub content: String,
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Authentication {
    pub username: String,
    pub password: String,
}

/// End-of-stream sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndOfStream {
    pub content: String,
}

impl Default for EndOfStream {
    fn default() -> Self {
        Self {
            content: "end".to_string(),
        }
    }
}

impl Message {
    /// Shorthand for a [`Message::Content`].
    pub fn content(content: impl Into<String>) -> Self {
        Message::Content(Content {
            content: content.into(),
        })
    }

    /// Shorthand for a [`Message::Authentication`].
    pub fn authentication(username: impl Into<String>, password: impl Into<String>) -> Self {
        Message::Authentication(Authentication {
            username: username.into(),
            password: password.into(),
        })
    }

    /// Shorthand for a default [`Message::EndOfStream`].
    pub fn end_of_stream() -> Self {
        Message::EndOfStream(EndOfStream::default())
    }

    /// Runtime kind of this message, used as the dispatch key.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Content(_) => MessageKind::Content,
            Message::Authentication(_) => MessageKind::Authentication,
            Message::EndOfStream(_) => MessageKind::EndOfStream,
        }
    }
}

/// Fieldless mirror of [`Message`], used to key handler registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Content,
    Authentication,
    EndOfStream,
}

impl MessageKind {
    /// Every kind, in discriminator order.
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Content,
        MessageKind::Authentication,
        MessageKind::EndOfStream,
    ];

    /// Wire discriminator written by the codec for this kind.
    pub const fn discriminator(self) -> u8 {
        match self {
            MessageKind::Content => 0,
            MessageKind::Authentication => 1,
            MessageKind::EndOfStream => 2,
        }
    }

    /// Resolve a wire discriminator back to its kind.
    pub fn from_discriminator(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.discriminator() == value)
    }

    /// Whether a sender must be authenticated for this kind to pass the
    /// authentication filter.
    pub const fn requires_authentication(self) -> bool {
        match self {
            MessageKind::Authentication => false,
            MessageKind::Content | MessageKind::EndOfStream => true,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A decoded message tagged with the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Connection the message arrived on. Set by the receiver, never sent.
    pub connection_id: ConnectionId,
    pub message: Message,
}

impl IncomingMessage {
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

/// Errors that can occur while decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload was empty (no version byte).
    #[error("empty payload: no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard encoding or decoding failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Encode a [`Message`] into a versioned payload.
///
/// Wire format: `[version: u8] [discriminator: varint] [fields...]`
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let body = postcard::to_allocvec(msg)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a versioned payload into a [`Message`].
pub fn decode_message(data: &[u8]) -> Result<Message, CodecError> {
    let (&version, body) = data.split_first().ok_or(CodecError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Message> {
        vec![
            Message::content("hello, world"),
            Message::content(""),
            Message::authentication("alice", "pw"),
            Message::authentication("ünïcødé", "p\0ss"),
            Message::end_of_stream(),
            Message::EndOfStream(EndOfStream {
                content: "EOF".into(),
            }),
        ]
    }

    #[test]
    fn test_decode_inverts_encode_for_every_kind() {
        for msg in samples() {
            let bytes = encode_message(&msg).unwrap();
            let decoded = decode_message(&bytes).unwrap();
            assert_eq!(decoded.kind(), msg.kind());
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_discriminator_follows_version_byte() {
        for msg in samples() {
            let bytes = encode_message(&msg).unwrap();
            assert_eq!(bytes[0], PROTOCOL_VERSION);
            assert_eq!(bytes[1], msg.kind().discriminator());
        }
    }

    #[test]
    fn test_discriminator_table_is_stable() {
        assert_eq!(MessageKind::Content.discriminator(), 0);
        assert_eq!(MessageKind::Authentication.discriminator(), 1);
        assert_eq!(MessageKind::EndOfStream.discriminator(), 2);
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_discriminator(kind.discriminator()), Some(kind));
        }
        assert_eq!(MessageKind::from_discriminator(3), None);
    }

    #[test]
    fn test_authentication_fields_encoded_in_order() {
        let bytes = encode_message(&Message::authentication("ab", "c")).unwrap();
        // version, discriminator, len("ab"), "ab", len("c"), "c"
        assert_eq!(bytes, vec![PROTOCOL_VERSION, 1, 2, b'a', b'b', 1, b'c']);
    }

    #[test]
    fn test_only_authentication_skips_auth_requirement() {
        assert!(!MessageKind::Authentication.requires_authentication());
        assert!(MessageKind::Content.requires_authentication());
        assert!(MessageKind::EndOfStream.requires_authentication());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut bytes = encode_message(&Message::content("x")).unwrap();
        bytes[0] = 9;
        assert!(matches!(
            decode_message(&bytes),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(decode_message(&[]), Err(CodecError::EmptyPayload)));
    }

    #[test]
    fn test_unknown_discriminator_rejected() {
        let result = decode_message(&[PROTOCOL_VERSION, 7, 0]);
        assert!(matches!(result, Err(CodecError::Postcard(_))));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = encode_message(&Message::authentication("alice", "pw")).unwrap();
        assert!(decode_message(&bytes[..bytes.len() - 1]).is_err());
    }
}
