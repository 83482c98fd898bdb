//! Binary vendor adapter (EBKN-style terminals).
//!
//! # Request taxonomy (for beginners)
//!
//! Every request is an HTTP POST whose *headers* say what it is and whose
//! *body* is opaque bytes:
//!
//! | Header            | Meaning                                        |
//! |-------------------|------------------------------------------------|
//! | `request_code`    | which of the four operations below             |
//! | `dev_id`          | terminal serial                                |
//! | `blk_no`          | block number; absent means 0 (final / single)  |
//! | `trans_id`        | command id, on command results                 |
//! | `cmd_return_code` | device verdict on a command                    |
//!
//! | `request_code`         | What the device is doing                   |
//! |------------------------|--------------------------------------------|
//! | `realtime_glog`        | reporting an attendance punch              |
//! | `realtime_enroll_data` | announcing a freshly enrolled user         |
//! | `receive_cmd`          | asking whether there is work for it        |
//! | `send_cmd_result`      | reporting the outcome of a command         |
//!
//! Large bodies arrive split into blocks 1, 2, …, N followed by a final
//! block 0.  The [`BlockReassembler`] joins them; intermediate blocks get an
//! empty `response_code=OK`.  Once complete, the payload is decoded by the
//! hybrid codec and routed by request code.
//!
//! Every reply is `(status, headers, body)`.  Failures are always
//! `response_code=ERROR` with a JSON `{"error": ...}` body.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use biolink_core::domain::checkin::LogType;
use biolink_core::domain::user::normalize_pin;
use biolink_core::protocol::ReassemblyError;
use biolink_core::{
    decode_payload, BlockReassembler, CommandKind, CommandStatus, EnrollmentBlob, ProtocolError, Reassembly,
    Vendor, WireCommand,
};
use chrono::NaiveDateTime;
use serde_json::{json, Value};
use tracing::{error, info, info_span, warn, Span};

use crate::application::checkin::{CheckinOutcome, CheckinRecorder};
use crate::application::enrollment::EnrollmentSync;
use crate::application::error::GatewayError;
use crate::application::outbox::Outbox;

/// `io_time` layout in attendance events.
const IO_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

// ── Headers ───────────────────────────────────────────────────────────────────

/// The protocol headers of one request, already canonicalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EbknHeaders {
    pub request_code: Option<String>,
    pub dev_id: Option<String>,
    pub trans_id: Option<String>,
    pub blk_no: Option<String>,
    pub cmd_return_code: Option<String>,
}

impl EbknHeaders {
    /// Reads each header from its underscore form (`dev_id`), its dash form
    /// (`dev-id`) or the reverse-proxy form (`x-dev-id`), in that order.
    ///
    /// `lookup` receives lower-case names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| {
            let dashed = name.replace('_', "-");
            lookup(name)
                .or_else(|| lookup(&dashed))
                .or_else(|| lookup(&format!("x-{dashed}")))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            request_code: read("request_code"),
            dev_id: read("dev_id"),
            trans_id: read("trans_id"),
            blk_no: read("blk_no"),
            cmd_return_code: read("cmd_return_code"),
        }
    }
}

/// The four operations a binary-vendor device can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCode {
    RealtimeGlog,
    RealtimeEnrollData,
    ReceiveCmd,
    SendCmdResult,
}

impl RequestCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestCode::RealtimeGlog => "realtime_glog",
            RequestCode::RealtimeEnrollData => "realtime_enroll_data",
            RequestCode::ReceiveCmd => "receive_cmd",
            RequestCode::SendCmdResult => "send_cmd_result",
        }
    }
}

impl fmt::Display for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime_glog" => Ok(RequestCode::RealtimeGlog),
            "realtime_enroll_data" => Ok(RequestCode::RealtimeEnrollData),
            "receive_cmd" => Ok(RequestCode::ReceiveCmd),
            "send_cmd_result" => Ok(RequestCode::SendCmdResult),
            _ => Err(()),
        }
    }
}

// ── Reply ─────────────────────────────────────────────────────────────────────

/// Body, status and headers for one device reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EbknReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl EbknReply {
    /// Empty `response_code=OK` acknowledgement.
    pub fn ok(trans_id: &str) -> Self {
        Self {
            status: 200,
            headers: vec![
                ("response_code".to_string(), "OK".to_string()),
                ("trans_id".to_string(), trans_id.to_string()),
            ],
            body: Vec::new(),
        }
    }

    /// `response_code=ERROR` with a JSON `{"error": message}` body.
    pub fn fail(status: u16, message: &str) -> Self {
        Self {
            status,
            headers: vec![("response_code".to_string(), "ERROR".to_string())],
            body: json!({ "error": message }).to_string().into_bytes(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

pub struct EbknAdapter {
    reassembler: BlockReassembler,
    outbox: Arc<Outbox>,
    enrollment: Arc<EnrollmentSync>,
    checkins: Arc<CheckinRecorder>,
    span: Span,
}

impl EbknAdapter {
    pub fn new(
        reassembler: BlockReassembler,
        outbox: Arc<Outbox>,
        enrollment: Arc<EnrollmentSync>,
        checkins: Arc<CheckinRecorder>,
        parent: &Span,
    ) -> Self {
        Self {
            reassembler,
            outbox,
            enrollment,
            checkins,
            span: info_span!(parent: parent, "ebkn"),
        }
    }

    /// Handles one request.  Never fails: every error becomes an
    /// `response_code=ERROR` reply.
    pub fn handle(&self, headers: &EbknHeaders, body: &[u8]) -> EbknReply {
        let span = info_span!(
            parent: &self.span,
            "request",
            vendor = "ebkn",
            dev_id = headers.dev_id.as_deref().unwrap_or("-"),
            request_code = headers.request_code.as_deref().unwrap_or("-"),
        );
        let _guard = span.enter();

        match self.try_handle(headers, body) {
            Ok(reply) => reply,
            Err(e) => {
                match &e {
                    GatewayError::Storage(_) => error!(error = %e, "request failed"),
                    _ => warn!(error = %e, "request rejected"),
                }
                EbknReply::fail(e.http_status(), &e.to_string())
            }
        }
    }

    fn try_handle(&self, headers: &EbknHeaders, body: &[u8]) -> Result<EbknReply, GatewayError> {
        let (Some(code), Some(dev_id)) = (headers.request_code.as_deref(), headers.dev_id.as_deref())
        else {
            return Ok(EbknReply::fail(400, "Missing request_code or dev_id"));
        };
        let Ok(code) = code.parse::<RequestCode>() else {
            return Ok(EbknReply::fail(400, "Unsupported request_code"));
        };
        let block = match headers.blk_no.as_deref() {
            None => 0,
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) => n,
                Err(_) => return Ok(EbknReply::fail(400, &format!("Invalid blk_no '{raw}'"))),
            },
        };
        let trans_id = headers.trans_id.as_deref().unwrap_or("0");
        self.enrollment.ensure_device(dev_id, Vendor::Ebkn)?;

        let payload = match self.reassembler.accept(dev_id, code.as_str(), block, body) {
            Ok(Reassembly::Continue { block }) => {
                if code == RequestCode::SendCmdResult {
                    self.record_chunk_ack(headers, block);
                }
                return Ok(EbknReply::ok(trans_id));
            }
            Ok(Reassembly::Complete(payload)) => payload,
            Err(ReassemblyError::Protocol(ProtocolError::BlockSequenceMismatch { .. })) => {
                return Ok(EbknReply::fail(400, "Block sequence mismatch"));
            }
            Err(e) => return Err(e.into()),
        };

        match code {
            RequestCode::RealtimeGlog => self.realtime_glog(dev_id, trans_id, &payload),
            RequestCode::RealtimeEnrollData => self.realtime_enroll_data(dev_id, trans_id, &payload),
            RequestCode::ReceiveCmd => self.receive_cmd(dev_id, trans_id),
            RequestCode::SendCmdResult => self.send_cmd_result(dev_id, headers, payload),
        }
    }

    /// Decodes the envelope, re-inlines binary segments as base64 and adds
    /// `device_id`.
    fn event(dev_id: &str, payload: &[u8]) -> Result<Value, ProtocolError> {
        let mut event = decode_payload(payload)?.inlined();
        if let Value::Object(map) = &mut event {
            map.insert("device_id".to_string(), Value::String(dev_id.to_string()));
        }
        Ok(event)
    }

    fn realtime_glog(
        &self,
        dev_id: &str,
        trans_id: &str,
        payload: &[u8],
    ) -> Result<EbknReply, GatewayError> {
        let event = Self::event(dev_id, payload)?;

        let Some(user_id) = scalar_text(&event["user_id"]) else {
            return Ok(EbknReply::fail(400, "user_id missing"));
        };
        let Some(time) = event["io_time"]
            .as_str()
            .and_then(|s| NaiveDateTime::parse_from_str(s, IO_TIME_FORMAT).ok())
        else {
            return Ok(EbknReply::fail(400, "Invalid io_time"));
        };
        // Only the JSON number 1 means IN; a quoted "1" is OUT.
        let log_type = if event["io_mode"].as_f64() == Some(1.0) {
            LogType::In
        } else {
            LogType::Out
        };

        match self.checkins.record(dev_id, &user_id, time, log_type)? {
            CheckinOutcome::Recorded | CheckinOutcome::Duplicate => Ok(EbknReply::ok(trans_id)),
            CheckinOutcome::SkippedUnknownEmployee => Ok(EbknReply::fail(400, "check-in failed")),
        }
    }

    fn realtime_enroll_data(
        &self,
        dev_id: &str,
        trans_id: &str,
        payload: &[u8],
    ) -> Result<EbknReply, GatewayError> {
        let event = Self::event(dev_id, payload)?;
        let Some(raw) = scalar_text(&event["user_id"]) else {
            return Ok(EbknReply::fail(400, "user_id missing"));
        };
        let user_id = normalize_pin(&raw);

        self.enrollment
            .register_device_user(&user_id, dev_id, Vendor::Ebkn, None)?;
        self.outbox.queue().enqueue(
            dev_id,
            &user_id,
            Vendor::Ebkn,
            CommandKind::FetchEnrollData,
        )?;
        info!(user_id = %user_id, "enrollment announced, template requested");
        Ok(EbknReply::ok(trans_id))
    }

    /// The poll body carries nothing the server needs, so it is not decoded.
    fn receive_cmd(&self, dev_id: &str, trans_id: &str) -> Result<EbknReply, GatewayError> {
        let Some(out) = self.outbox.next_for(dev_id)? else {
            return Ok(EbknReply::ok(trans_id));
        };
        match out.wire {
            WireCommand::Binary {
                trans_id,
                cmd_code,
                body,
            } => match body.into_bytes() {
                Ok(bytes) => {
                    let mut reply = EbknReply::ok(&trans_id);
                    reply
                        .headers
                        .push(("cmd_code".to_string(), cmd_code.to_string()));
                    reply.body = bytes;
                    Ok(reply)
                }
                Err(e) => {
                    warn!(id = %out.command.id, error = %e, "command body cannot be framed");
                    self.outbox
                        .queue()
                        .record_attempt_failure(&out.command.id, &format!("Build Failed: {e}"))?;
                    Ok(EbknReply::ok(&trans_id))
                }
            },
            WireCommand::Text { .. } | WireCommand::Json { .. } => {
                warn!(id = %out.command.id, vendor = %out.command.vendor, "command for another vendor queued on binary device");
                self.outbox.queue().record_attempt_failure(
                    &out.command.id,
                    "Build Failed: device does not speak this vendor's protocol",
                )?;
                Ok(EbknReply::ok(trans_id))
            }
        }
    }

    fn send_cmd_result(
        &self,
        dev_id: &str,
        headers: &EbknHeaders,
        payload: Vec<u8>,
    ) -> Result<EbknReply, GatewayError> {
        let trans_id = headers.trans_id.as_deref().unwrap_or("0");
        let return_code = headers
            .cmd_return_code
            .as_deref()
            .unwrap_or_default()
            .to_uppercase();
        let queue = self.outbox.queue();

        let Some(cmd) = queue.get(trans_id)? else {
            warn!(trans_id, return_code = %return_code, "result for unknown command");
            return Ok(EbknReply::ok(trans_id));
        };
        let cmd = match queue.record_acknowledgement(&cmd.id, &return_code, None) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(trans_id, error = %e, "result not applied");
                return Ok(EbknReply::ok(trans_id));
            }
        };

        // The raw payload of a successful fetch is the template itself.
        if cmd.kind == CommandKind::FetchEnrollData && cmd.status == CommandStatus::Success {
            self.enrollment.store_template(
                &cmd.user_id,
                dev_id,
                EnrollmentBlob::new(Vendor::Ebkn, payload),
            )?;
        }
        Ok(EbknReply::ok(trans_id))
    }

    fn record_chunk_ack(&self, headers: &EbknHeaders, block: u32) {
        let Some(trans_id) = headers.trans_id.as_deref() else {
            return;
        };
        let return_code = headers
            .cmd_return_code
            .as_deref()
            .unwrap_or("OK")
            .to_uppercase();
        let queue = self.outbox.queue();
        match queue.get(trans_id) {
            Ok(Some(_)) => {
                if let Err(e) = queue.record_acknowledgement(trans_id, &return_code, Some(block)) {
                    warn!(trans_id, block, error = %e, "chunk acknowledgement not applied");
                }
            }
            Ok(None) => warn!(trans_id, block, "chunk for unknown command"),
            Err(e) => error!(trans_id, error = %e, "command lookup failed"),
        }
    }
}

/// A JSON number or string as text.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
