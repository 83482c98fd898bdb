//! Hybrid JSON + binary payload codec.
//!
//! # Wire layout (for beginners)
//!
//! Once a binary-vendor upload has been reassembled it looks like this:
//!
//! ```text
//! ..{ "user_id": "42", "fp": "BIN_1", "face": "BIN_2" }<raw bytes><raw bytes>
//!   └──────────────────── envelope ─────────────────────┘└─── segments ───┘
//! ```
//!
//! Any bytes before the first `{` are ignored.  The envelope ends at the `}`
//! that balances the first `{`.  Every string value in the envelope that
//! starts with `BIN_` is a *placeholder* standing in for one binary segment,
//! and the segments follow the envelope in the same order the placeholders
//! appear in the JSON (depth-first, keys in document order).
//!
//! The wire does **not** carry a length for each segment.  The firmware's
//! convention is that the trailing bytes are split evenly: with `N`
//! placeholders and `L` trailing bytes, the first `N - 1` segments get
//! `L / N` bytes each and the last segment absorbs the remainder.
//!
//! [`inline_segments`] goes the other way: it swaps each placeholder for the
//! base64 text of its segment so the envelope can travel as plain JSON.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::protocol::ProtocolError;

/// Prefix that marks a JSON string value as a binary placeholder.
pub const PLACEHOLDER_PREFIX: &str = "BIN_";

/// One binary segment and the placeholder that referenced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub placeholder: String,
    pub bytes: Vec<u8>,
}

/// A decoded hybrid payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub envelope: Value,
    /// Segments in placeholder discovery order.  Empty when the envelope
    /// holds no placeholders.
    pub segments: Vec<Segment>,
}

impl DecodedPayload {
    /// Envelope with every placeholder replaced by base64 text.
    pub fn inlined(&self) -> Value {
        inline_segments(&self.envelope, &self.segments)
    }
}

/// Splits `raw` into its JSON envelope and binary segments.
///
/// # Errors
///
/// [`ProtocolError::MalformedEnvelope`] when there is no `{`, the braces
/// never balance, or the delimited text is not valid JSON.
pub fn decode_payload(raw: &[u8]) -> Result<DecodedPayload, ProtocolError> {
    let (start, end) = find_envelope(raw)?;
    let envelope: Value = serde_json::from_slice(&raw[start..=end])
        .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;

    let mut placeholders = Vec::new();
    collect_placeholders(&envelope, &mut placeholders);

    let segments = split_even(&raw[end + 1..], placeholders);
    Ok(DecodedPayload { envelope, segments })
}

/// Serialises `envelope` and appends `segments` back to back.
///
/// The inverse of [`decode_payload`] only when the segment lengths match the
/// even-split rule; otherwise decoding re-splits the trailing bytes evenly.
pub fn encode_payload(envelope: &Value, segments: &[&[u8]]) -> Vec<u8> {
    let mut out = envelope.to_string().into_bytes();
    for segment in segments {
        out.extend_from_slice(segment);
    }
    out
}

/// Returns a copy of `envelope` in which every placeholder string that names
/// one of `segments` is replaced by the standard base64 encoding of its bytes.
///
/// Strings that look like placeholders but have no segment are left as-is.
pub fn inline_segments(envelope: &Value, segments: &[Segment]) -> Value {
    match envelope {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), inline_segments(v, segments)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| inline_segments(v, segments))
                .collect(),
        ),
        Value::String(s) => match segments.iter().find(|seg| seg.placeholder == *s) {
            Some(seg) => Value::String(BASE64_STANDARD.encode(&seg.bytes)),
            None => envelope.clone(),
        },
        _ => envelope.clone(),
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

/// Returns the inclusive byte range of the first balanced `{ … }`.
///
/// Braces inside JSON string literals are skipped so a display name such as
/// `"a}b"` does not end the envelope early.
fn find_envelope(raw: &[u8]) -> Result<(usize, usize), ProtocolError> {
    let start = raw
        .iter()
        .position(|&b| b == b'{')
        .ok_or_else(|| ProtocolError::MalformedEnvelope("no opening brace".to_string()))?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &b) in raw.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((start, idx));
                }
            }
            _ => {}
        }
    }

    Err(ProtocolError::MalformedEnvelope(
        "unbalanced braces".to_string(),
    ))
}

fn collect_placeholders(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, out)),
        Value::String(s) if s.starts_with(PLACEHOLDER_PREFIX) => out.push(s.clone()),
        _ => {}
    }
}

fn split_even(trailing: &[u8], placeholders: Vec<String>) -> Vec<Segment> {
    let n = placeholders.len();
    if n == 0 {
        return Vec::new();
    }
    let size = trailing.len() / n;

    placeholders
        .into_iter()
        .enumerate()
        .map(|(i, placeholder)| {
            let from = i * size;
            let to = if i + 1 == n { trailing.len() } else { from + size };
            Segment {
                placeholder,
                bytes: trailing[from..to].to_vec(),
            }
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lengths(decoded: &DecodedPayload) -> Vec<usize> {
        decoded.segments.iter().map(|s| s.bytes.len()).collect()
    }

    #[test]
    fn test_zero_placeholders_returns_bare_envelope() {
        // Arrange
        let raw = encode_payload(&json!({"user_id": "7", "io_mode": 1}), &[]);

        // Act
        let decoded = decode_payload(&raw).unwrap();

        // Assert
        assert_eq!(decoded.envelope, json!({"user_id": "7", "io_mode": 1}));
        assert!(decoded.segments.is_empty());
    }

    #[test]
    fn test_zero_placeholders_ignores_trailing_bytes() {
        let mut raw = br#"{"a":1}"#.to_vec();
        raw.extend_from_slice(&[9, 9, 9]);

        let decoded = decode_payload(&raw).unwrap();

        assert!(decoded.segments.is_empty());
    }

    #[test]
    fn test_single_placeholder_takes_all_trailing_bytes() {
        let raw = encode_payload(&json!({"fp": "BIN_1"}), &[&[1, 2, 3, 4, 5]]);

        let decoded = decode_payload(&raw).unwrap();

        assert_eq!(decoded.segments.len(), 1);
        assert_eq!(decoded.segments[0].placeholder, "BIN_1");
        assert_eq!(decoded.segments[0].bytes, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_three_equal_segments_round_trip() {
        // Arrange
        let a = [1u8; 5];
        let b = [2u8; 5];
        let c = [3u8; 5];
        let env = json!({"a": "BIN_1", "b": "BIN_2", "c": "BIN_3"});
        let raw = encode_payload(&env, &[&a, &b, &c]);

        // Act
        let decoded = decode_payload(&raw).unwrap();

        // Assert
        assert_eq!(lengths(&decoded), vec![5, 5, 5]);
        assert_eq!(decoded.segments[0].bytes, a.to_vec());
        assert_eq!(decoded.segments[1].bytes, b.to_vec());
        assert_eq!(decoded.segments[2].bytes, c.to_vec());
    }

    #[test]
    fn test_uneven_segments_are_resplit_evenly() {
        // Arrange – 7 + 1 + 1 = 9 bytes over 3 placeholders
        let env = json!({"a": "BIN_1", "b": "BIN_2", "c": "BIN_3"});
        let raw = encode_payload(&env, &[&[0xAA; 7], &[0xBB], &[0xCC]]);

        // Act
        let decoded = decode_payload(&raw).unwrap();

        // Assert – boundaries follow the wire convention, not the encoder's
        assert_eq!(lengths(&decoded), vec![3, 3, 3]);
        assert_eq!(decoded.segments[0].bytes, vec![0xAA; 3]);
        assert_eq!(decoded.segments[1].bytes, vec![0xAA; 3]);
        assert_eq!(decoded.segments[2].bytes, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_non_divisible_length_gives_remainder_to_last_segment() {
        // Arrange – 11 bytes over 3 placeholders
        let env = json!({"a": "BIN_1", "b": "BIN_2", "c": "BIN_3"});
        let trailing: Vec<u8> = (0u8..11).collect();
        let raw = encode_payload(&env, &[trailing.as_slice()]);

        // Act
        let decoded = decode_payload(&raw).unwrap();

        // Assert
        assert_eq!(lengths(&decoded), vec![3, 3, 5]);
        assert_eq!(decoded.segments[2].bytes, vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_fewer_trailing_bytes_than_placeholders() {
        let env = json!({"a": "BIN_1", "b": "BIN_2", "c": "BIN_3"});
        let raw = encode_payload(&env, &[&[1, 2]]);

        let decoded = decode_payload(&raw).unwrap();

        assert_eq!(lengths(&decoded), vec![0, 0, 2]);
    }

    #[test]
    fn test_placeholders_are_collected_depth_first_in_document_order() {
        // Arrange – nested object and array; keys deliberately not sorted
        let raw = br#"{"z":"BIN_z","nested":{"y":"BIN_y","list":["BIN_x",1,"plain"]},"w":"BIN_w"}"#;
        let mut buf = raw.to_vec();
        buf.extend_from_slice(b"zzyyxxww");

        // Act
        let decoded = decode_payload(&buf).unwrap();

        // Assert
        let order: Vec<_> = decoded.segments.iter().map(|s| s.placeholder.as_str()).collect();
        assert_eq!(order, vec!["BIN_z", "BIN_y", "BIN_x", "BIN_w"]);
        assert_eq!(decoded.segments[2].bytes, b"xx".to_vec());
    }

    #[test]
    fn test_leading_garbage_before_envelope_is_skipped() {
        let mut raw = vec![0x00, 0x07, b'x'];
        raw.extend_from_slice(br#"{"k":"v"}"#);

        let decoded = decode_payload(&raw).unwrap();

        assert_eq!(decoded.envelope, json!({"k": "v"}));
    }

    #[test]
    fn test_braces_inside_strings_do_not_end_envelope() {
        let mut raw = br#"{"name":"a}b{","fp":"BIN_1"}"#.to_vec();
        raw.extend_from_slice(&[1, 2]);

        let decoded = decode_payload(&raw).unwrap();

        assert_eq!(decoded.envelope["name"], "a}b{");
        assert_eq!(decoded.segments[0].bytes, vec![1, 2]);
    }

    #[test]
    fn test_binary_braces_after_envelope_are_segment_bytes() {
        let mut raw = br#"{"fp":"BIN_1"}"#.to_vec();
        raw.extend_from_slice(b"}{}");

        let decoded = decode_payload(&raw).unwrap();

        assert_eq!(decoded.segments[0].bytes, b"}{}".to_vec());
    }

    #[test]
    fn test_missing_opening_brace_is_malformed() {
        let err = decode_payload(b"no json here").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_unbalanced_braces_are_malformed() {
        let err = decode_payload(br#"{"a":{"b":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_invalid_json_between_braces_is_malformed() {
        let err = decode_payload(b"{not json}").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_inline_replaces_placeholders_with_base64() {
        // Arrange
        let raw = encode_payload(
            &json!({"user_id": "5", "data": ["BIN_1", "BIN_2"]}),
            &[b"ab", b"cd"],
        );
        let decoded = decode_payload(&raw).unwrap();

        // Act
        let inlined = decoded.inlined();

        // Assert
        assert_eq!(inlined, json!({"user_id": "5", "data": ["YWI=", "Y2Q="]}));
    }

    #[test]
    fn test_inline_leaves_unknown_placeholders_untouched() {
        let env = json!({"fp": "BIN_9"});

        let inlined = inline_segments(&env, &[]);

        assert_eq!(inlined, env);
    }
}
