//! Length-prefixed framing for binary-vendor reply bodies.
//!
//! Text bodies (JSON command arguments) are wrapped as:
//!
//! ```text
//! ┌──────────────────────┬──────────────────┬──────┐
//! │ len: u32 LE (= N+1)  │ payload (N bytes)│ 0x00 │
//! └──────────────────────┴──────────────────┴──────┘
//! ```
//!
//! Opaque blobs (stored enrollment templates) already carry the firmware's own
//! framing and are sent byte-for-byte.

use crate::protocol::ProtocolError;

/// Size of the little-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// A reply body and how it must be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireBody {
    /// Plain text that gets the length prefix and NUL terminator.
    Text(String),
    /// Pre-framed binary shipped unwrapped.
    Blob(Vec<u8>),
}

impl WireBody {
    /// Bytes to send: framed for [`WireBody::Text`], verbatim for [`WireBody::Blob`].
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedFrame`] when a text body is too long for the
    /// 32-bit length field.
    pub fn into_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            WireBody::Text(text) => frame_text(&text),
            WireBody::Blob(bytes) => Ok(bytes),
        }
    }
}

/// Wraps `text` in a length prefix and NUL terminator.
///
/// # Errors
///
/// [`ProtocolError::MalformedFrame`] when `text` plus its NUL does not fit
/// the 32-bit length field.
pub fn frame_text(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let payload = text.as_bytes();
    let len = frame_length(payload.len())?;

    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len() + 1);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out.push(0);
    Ok(out)
}

/// Value of the length field for a payload of `payload_len` bytes.
fn frame_length(payload_len: usize) -> Result<u32, ProtocolError> {
    payload_len
        .checked_add(1)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or_else(|| {
            ProtocolError::MalformedFrame(format!(
                "payload of {payload_len} bytes does not fit a 32-bit length field"
            ))
        })
}

/// Strips a frame produced by [`frame_text`] and returns the payload.
///
/// # Errors
///
/// [`ProtocolError::MalformedFrame`] when the buffer is shorter than the
/// prefix, the length field disagrees with the buffer size, or the trailing
/// NUL is missing.
pub fn unframe(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    if frame.len() < LENGTH_PREFIX_LEN + 1 {
        return Err(ProtocolError::MalformedFrame(format!(
            "frame too short ({} bytes)",
            frame.len()
        )));
    }

    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&frame[..LENGTH_PREFIX_LEN]);
    let declared = u32::from_le_bytes(prefix) as usize;
    let body = &frame[LENGTH_PREFIX_LEN..];

    if declared != body.len() {
        return Err(ProtocolError::MalformedFrame(format!(
            "length field says {declared} bytes, frame carries {}",
            body.len()
        )));
    }

    match body.split_last() {
        Some((&0, payload)) => Ok(payload),
        _ => Err(ProtocolError::MalformedFrame(
            "missing NUL terminator".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_text_layout() {
        // Arrange / Act
        let framed = frame_text(r#"{"user_id":"00000042"}"#).unwrap();

        // Assert – 22 payload bytes, length field 23
        assert_eq!(&framed[..4], &23u32.to_le_bytes());
        assert_eq!(&framed[4..26], br#"{"user_id":"00000042"}"#);
        assert_eq!(framed[26], 0);
        assert_eq!(framed.len(), 27);
    }

    #[test]
    fn test_empty_text_frames_to_prefix_and_nul() {
        assert_eq!(frame_text("").unwrap(), vec![1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_length_field_limit_is_enforced() {
        // The largest payload whose length plus NUL still fits in u32.
        let max = u32::MAX as usize - 1;

        assert_eq!(frame_length(max).unwrap(), u32::MAX);
        assert!(matches!(
            frame_length(max + 1),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(frame_length(usize::MAX).is_err());
    }

    #[test]
    fn test_blob_is_sent_unwrapped() {
        let body = WireBody::Blob(vec![0x01, 0x02, 0x03, 0x04]);

        assert_eq!(body.into_bytes().unwrap(), vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_text_body_is_framed() {
        let body = WireBody::Text("ab".to_string());

        assert_eq!(body.into_bytes().unwrap(), vec![3, 0, 0, 0, b'a', b'b', 0]);
    }

    #[test]
    fn test_unframe_returns_payload() {
        let framed = frame_text("hello").unwrap();

        assert_eq!(unframe(&framed).unwrap(), b"hello");
    }

    #[test]
    fn test_unframe_rejects_truncated_frame() {
        let mut framed = frame_text("hello").unwrap();
        framed.truncate(framed.len() - 2);

        assert!(matches!(
            unframe(&framed),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_unframe_rejects_missing_nul() {
        let mut framed = frame_text("hi").unwrap();
        let last = framed.len() - 1;
        framed[last] = b'!';

        assert!(matches!(
            unframe(&framed),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_unframe_rejects_short_buffer() {
        assert!(unframe(&[1, 0, 0]).is_err());
    }
}
