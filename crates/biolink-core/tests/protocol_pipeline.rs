//! Integration tests for the binary-vendor receive path.
//!
//! Each test pushes an upload through the public API the way the gateway
//! does: block reassembly, then hybrid decoding and base64 inlining, and on
//! the way back a built command through wire framing.

use std::sync::Arc;

use biolink_core::builders::ebkn::{GET_USER_INFO, SET_USER_INFO};
use biolink_core::protocol::framing::unframe;
use biolink_core::protocol::hybrid::encode_payload;
use biolink_core::protocol::reassembly::MemorySessionStore;
use biolink_core::{
    build_command, decode_payload, BlockReassembler, Command, CommandKind, DeviceUser,
    EnrollmentBlob, ProtocolError, Reassembly, Vendor, WireCommand,
};
use chrono::Utc;
use serde_json::json;
use tracing::Span;

fn make_reassembler() -> BlockReassembler {
    BlockReassembler::new(Arc::new(MemorySessionStore::new()), &Span::none())
}

/// Feeds `raw` as blocks of `size` bytes (1..N, then 0) and returns the result.
fn upload_in_blocks(r: &BlockReassembler, raw: &[u8], size: usize) -> Vec<u8> {
    let chunks: Vec<&[u8]> = raw.chunks(size).collect();
    let (last, middle) = chunks.split_last().expect("non-empty upload");
    for (i, chunk) in middle.iter().enumerate() {
        let out = r
            .accept("DEV1", "realtime_enroll_data", i as u32 + 1, chunk)
            .expect("in-order block");
        assert_eq!(out, Reassembly::Continue { block: i as u32 + 1 });
    }
    match r.accept("DEV1", "realtime_enroll_data", 0, last).expect("final block") {
        Reassembly::Complete(full) => full,
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn test_block_split_enroll_upload_decodes_to_original_segments() {
    // Arrange
    let envelope = json!({"user_id": "00000042", "fp": ["BIN_1", "BIN_2"]});
    let fp1 = vec![0x11u8; 40];
    let fp2 = vec![0x22u8; 40];
    let raw = encode_payload(&envelope, &[&fp1, &fp2]);
    let r = make_reassembler();

    // Act
    let full = upload_in_blocks(&r, &raw, 7);
    let decoded = decode_payload(&full).unwrap();

    // Assert
    assert_eq!(full, raw);
    assert_eq!(decoded.segments[0].bytes, fp1);
    assert_eq!(decoded.segments[1].bytes, fp2);
    let inlined = decoded.inlined();
    assert_eq!(inlined["user_id"], "00000042");
    assert_eq!(inlined["fp"][0].as_str().map(str::len), Some(56));
}

#[test]
fn test_restarted_upload_decodes_only_the_second_attempt() {
    // Arrange
    let r = make_reassembler();
    r.accept("DEV1", "realtime_glog", 1, br#"{"user_id":"1","#).unwrap();

    // Act – the device gives up and resends from block 1
    r.accept("DEV1", "realtime_glog", 1, br#"{"user_id":"2","#).unwrap();
    let full = match r
        .accept("DEV1", "realtime_glog", 0, br#""io_mode":1}"#)
        .unwrap()
    {
        Reassembly::Complete(full) => full,
        other => panic!("expected completion, got {other:?}"),
    };

    // Assert
    let decoded = decode_payload(&full).unwrap();
    assert_eq!(decoded.envelope, json!({"user_id": "2", "io_mode": 1}));
}

#[test]
fn test_gap_in_blocks_is_a_protocol_error() {
    let r = make_reassembler();
    r.accept("DEV1", "realtime_glog", 1, b"{").unwrap();

    let err = r.accept("DEV1", "realtime_glog", 3, b"}").unwrap_err();

    assert_eq!(
        err.to_string(),
        ProtocolError::BlockSequenceMismatch { last: Some(1), got: 3 }.to_string()
    );
}

#[test]
fn test_fetch_command_reply_is_framed_json() {
    // Arrange
    let cmd = Command::new("DEV1", "42", Vendor::Ebkn, CommandKind::FetchEnrollData, Utc::now());

    // Act
    let wire = build_command(&cmd, Some(&DeviceUser::new("42")), None).unwrap();

    // Assert
    let WireCommand::Binary { trans_id, cmd_code, body } = wire else {
        panic!("binary vendor builds binary commands");
    };
    assert_eq!(trans_id, cmd.id);
    assert_eq!(cmd_code, GET_USER_INFO);
    let bytes = body.into_bytes().unwrap();
    assert_eq!(unframe(&bytes).unwrap(), br#"{"user_id":"00000042"}"#);
}

#[test]
fn test_enroll_command_reply_is_raw_template() {
    // Arrange
    let cmd = Command::new("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser, Utc::now());
    let template = EnrollmentBlob::new(Vendor::Ebkn, vec![0x01, 0x02, 0x03, 0x04]);

    // Act
    let wire = build_command(&cmd, Some(&DeviceUser::new("42")), Some(&template)).unwrap();

    // Assert – not `\x05\x00\x00\x00\x01\x02\x03\x04\x00`
    let WireCommand::Binary { cmd_code, body, .. } = wire else {
        panic!("binary vendor builds binary commands");
    };
    assert_eq!(cmd_code, SET_USER_INFO);
    assert_eq!(body.into_bytes().unwrap(), vec![0x01, 0x02, 0x03, 0x04]);
}
