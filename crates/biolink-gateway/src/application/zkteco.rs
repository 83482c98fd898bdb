//! Text vendor adapter (ZKTeco ADMS-style "push" terminals).
//!
//! # Conversation (for beginners)
//!
//! The terminal drives everything over plain-text HTTP, identifying itself
//! with the `SN` query parameter:
//!
//! ```text
//! Device                                   Gateway
//!   │  GET  /iclock/cdata?SN=..                │  handshake: option block
//!   │─────────────────────────────────────────►│
//!   │  POST /iclock/cdata?SN=..&table=ATTLOG   │  punches, one per line
//!   │─────────────────────────────────────────►│  → "OK: <count>"
//!   │  GET  /iclock/getrequest?SN=..           │  poll: command lines or "OK"
//!   │─────────────────────────────────────────►│
//!   │  POST /iclock/devicecmd?SN=..            │  ID=..&Return=.. per line
//!   │─────────────────────────────────────────►│  → "OK"
//! ```
//!
//! Every handler answers `text/plain`; failures are `ERROR: <reason>`.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use biolink_core::builders::zkteco::split_line_id;
use biolink_core::domain::checkin::LogType;
use biolink_core::domain::user::normalize_pin;
use biolink_core::{EnrollmentBlob, Vendor, WireCommand};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Span};

use crate::application::checkin::{CheckinOutcome, CheckinRecorder};
use crate::application::command_queue::QueueError;
use crate::application::enrollment::EnrollmentSync;
use crate::application::error::GatewayError;
use crate::application::outbox::Outbox;
use crate::application::store::RecordStore;

/// Timestamp layout of ATTLOG lines.
const ATTLOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ── Handshake options ─────────────────────────────────────────────────────────

/// Values echoed to the device in the handshake option block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeOptions {
    /// Seconds the device waits after a failed request.
    #[serde(default = "default_error_delay")]
    pub error_delay: u32,
    /// Seconds between polls.
    #[serde(default = "default_delay")]
    pub delay: u32,
    /// Times of day at which the device pushes buffered data.
    #[serde(default = "default_trans_times")]
    pub trans_times: String,
    /// Minutes between data checks.
    #[serde(default = "default_trans_interval")]
    pub trans_interval: u32,
    #[serde(default = "default_time_zone")]
    pub time_zone: i32,
    /// Push punches as they happen.
    #[serde(default = "default_realtime")]
    pub realtime: bool,
}

fn default_error_delay() -> u32 {
    30
}
fn default_delay() -> u32 {
    10
}
fn default_trans_times() -> String {
    "00:00;14:05".to_string()
}
fn default_trans_interval() -> u32 {
    1
}
fn default_time_zone() -> i32 {
    7
}
fn default_realtime() -> bool {
    true
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            error_delay: default_error_delay(),
            delay: default_delay(),
            trans_times: default_trans_times(),
            trans_interval: default_trans_interval(),
            time_zone: default_time_zone(),
            realtime: default_realtime(),
        }
    }
}

// ── Reply ─────────────────────────────────────────────────────────────────────

/// A `text/plain` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextReply {
    pub status: u16,
    pub body: String,
}

impl TextReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn error(status: u16, reason: &str) -> Self {
        Self {
            status,
            body: format!("ERROR: {reason}"),
        }
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

pub struct ZkTecoAdapter {
    outbox: Arc<Outbox>,
    enrollment: Arc<EnrollmentSync>,
    checkins: Arc<CheckinRecorder>,
    records: Arc<dyn RecordStore>,
    options: HandshakeOptions,
    span: Span,
}

impl ZkTecoAdapter {
    pub fn new(
        outbox: Arc<Outbox>,
        enrollment: Arc<EnrollmentSync>,
        checkins: Arc<CheckinRecorder>,
        records: Arc<dyn RecordStore>,
        options: HandshakeOptions,
        parent: &Span,
    ) -> Self {
        Self {
            outbox,
            enrollment,
            checkins,
            records,
            options,
            span: info_span!(parent: parent, "zkteco"),
        }
    }

    /// `GET /iclock/cdata`: the option block.  `ATTLOGStamp` tells the
    /// device which punches it already delivered.
    pub fn handshake(&self, sn: Option<&str>) -> TextReply {
        self.guarded(sn, "handshake", |sn| {
            let stamp = self
                .records
                .get_device(sn)?
                .and_then(|d| d.last_sync_on)
                .unwrap_or_else(|| "0".to_string());
            let o = &self.options;
            Ok(TextReply::ok(format!(
                "GET OPTION FROM: {sn}\n\
                 ATTLOGStamp={stamp}\n\
                 OPERLOGStamp=9999\n\
                 ATTPHOTOStamp=None\n\
                 ErrorDelay={}\n\
                 Delay={}\n\
                 TransTimes={}\n\
                 TransInterval={}\n\
                 TransFlag=TransData AttLog OpLog AttPhoto EnrollUser ChgUser EnrollFP ChgFP UserPic\n\
                 TimeZone={}\n\
                 Realtime={}\n\
                 Encrypt=None\n",
                o.error_delay,
                o.delay,
                o.trans_times,
                o.trans_interval,
                o.time_zone,
                u8::from(o.realtime),
            )))
        })
    }

    /// `POST /iclock/cdata`: a batch of `table` rows.
    pub fn upload(&self, sn: Option<&str>, table: Option<&str>, body: &[u8]) -> TextReply {
        self.guarded(sn, "upload", |sn| {
            let text = String::from_utf8_lossy(body);
            match table {
                Some("ATTLOG") => self.attendance_log(sn, &text),
                Some("OPERLOG") => self.operation_log(sn, &text),
                other => {
                    debug!(table = ?other, "upload table ignored");
                    Ok(TextReply::ok("OK"))
                }
            }
        })
    }

    /// `GET /iclock/getrequest`: the next command's lines, or `OK`.
    pub fn poll(&self, sn: Option<&str>) -> TextReply {
        self.guarded(sn, "poll", |sn| {
            let Some(out) = self.outbox.next_for(sn)? else {
                return Ok(TextReply::ok("OK"));
            };
            match out.wire {
                WireCommand::Text { lines } => {
                    if lines.len() > 1 {
                        let parts = u32::try_from(lines.len()).unwrap_or(u32::MAX);
                        self.outbox.queue().begin_exchange(&out.command.id, parts)?;
                    }
                    Ok(TextReply::ok(lines.join("\n")))
                }
                WireCommand::Binary { .. } | WireCommand::Json { .. } => {
                    warn!(id = %out.command.id, vendor = %out.command.vendor, "command for another vendor queued on text device");
                    self.outbox.queue().record_attempt_failure(
                        &out.command.id,
                        "Build Failed: device does not speak this vendor's protocol",
                    )?;
                    Ok(TextReply::ok("OK"))
                }
            }
        })
    }

    /// `POST /iclock/devicecmd`: one `ID=..&Return=..&CMD=..` line per
    /// executed command line.
    pub fn command_results(&self, sn: Option<&str>, body: &[u8]) -> TextReply {
        self.guarded(sn, "command_results", |_sn| {
            let text = String::from_utf8_lossy(body);
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let params = parse_query_line(line);
                let (Some(id), Some(code)) = (params.get("ID"), params.get("Return")) else {
                    warn!(line, "command result without ID or Return");
                    continue;
                };
                let queue = self.outbox.queue();
                let (id, part) = split_line_id(id);
                let applied = match part {
                    Some(part) => queue.record_part_acknowledgement(id, part, code),
                    None => queue.record_acknowledgement(id, code, None),
                };
                match applied {
                    Ok(cmd) => debug!(id = %cmd.id, ?part, status = ?cmd.status, "command result applied"),
                    Err(QueueError::AlreadyClosed(_)) => debug!(id = %id, "result for closed command"),
                    Err(QueueError::NotFound(_)) => warn!(id = %id, "result for unknown command"),
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(TextReply::ok("OK"))
        })
    }

    // ── Tables ───────────────────────────────────────────────────────────────

    fn attendance_log(&self, sn: &str, text: &str) -> Result<TextReply, GatewayError> {
        let mut processed = 0usize;
        let mut latest: Option<NaiveDateTime> = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let cols: Vec<&str> = line.split('\t').collect();
            let (Some(pin), Some(raw_time)) = (cols.first(), cols.get(1)) else {
                warn!(line, "ATTLOG line has too few columns");
                continue;
            };
            let Ok(time) = NaiveDateTime::parse_from_str(raw_time.trim(), ATTLOG_TIME_FORMAT) else {
                warn!(line, "ATTLOG line has an unreadable timestamp");
                continue;
            };
            let log_type = match cols.get(2).map(|s| s.trim()) {
                Some("1") => LogType::Out,
                _ => LogType::In,
            };

            match self.checkins.record(sn, pin, time, log_type)? {
                CheckinOutcome::Recorded | CheckinOutcome::Duplicate => {
                    processed += 1;
                    latest = latest.max(Some(time));
                }
                CheckinOutcome::SkippedUnknownEmployee => {}
            }
        }

        if let Some(latest) = latest {
            self.advance_sync_stamp(sn, latest)?;
        }
        info!(processed, "attendance log processed");
        Ok(TextReply::ok(format!("OK: {processed}")))
    }

    fn operation_log(&self, sn: &str, text: &str) -> Result<TextReply, GatewayError> {
        let mut processed = 0usize;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((tag, rest)) = line.split_once(' ') else {
                continue;
            };
            let fields = parse_tab_fields(rest);
            let Some(pin) = fields.get("PIN").map(|p| normalize_pin(p)) else {
                warn!(line, "OPERLOG line without PIN");
                continue;
            };

            match tag {
                "USER" => {
                    let name = fields.get("Name").filter(|n| !n.is_empty()).cloned();
                    self.enrollment
                        .register_device_user(&pin, sn, Vendor::ZkTeco, name)?;
                    processed += 1;
                }
                "FP" => {
                    let Some(bytes) = fields
                        .get("TMP")
                        .and_then(|t| BASE64_STANDARD.decode(t.as_bytes()).ok())
                    else {
                        warn!(line, "FP line with missing or invalid TMP");
                        continue;
                    };
                    let slot = fields.get("FID").and_then(|f| f.parse().ok()).unwrap_or(0);
                    let blob = EnrollmentBlob {
                        vendor: Vendor::ZkTeco,
                        bytes,
                        slot,
                    };
                    self.enrollment.store_template(&pin, sn, blob)?;
                    processed += 1;
                }
                other => debug!(tag = other, "OPERLOG entry ignored"),
            }
        }

        info!(processed, "operation log processed");
        Ok(TextReply::ok(format!("OK: {processed}")))
    }

    fn advance_sync_stamp(&self, sn: &str, latest: NaiveDateTime) -> Result<(), GatewayError> {
        let Some(mut device) = self.records.get_device(sn)? else {
            debug!("unregistered device, sync stamp not kept");
            return Ok(());
        };
        let stamp = latest.format(ATTLOG_TIME_FORMAT).to_string();
        // Stamps share one layout, so string order is time order.
        if device.last_sync_on.as_deref() < Some(stamp.as_str()) {
            device.last_sync_on = Some(stamp);
            self.records.upsert_device(device)?;
        }
        Ok(())
    }

    /// Runs `f` inside a request span, rejecting a missing `SN` and turning
    /// errors into `ERROR:` replies.
    fn guarded(
        &self,
        sn: Option<&str>,
        op: &'static str,
        f: impl FnOnce(&str) -> Result<TextReply, GatewayError>,
    ) -> TextReply {
        let sn = sn.map(str::trim).filter(|s| !s.is_empty());
        let span = info_span!(parent: &self.span, "request", vendor = "zk_teco", dev_id = sn.unwrap_or("-"), op);
        let _guard = span.enter();

        let Some(sn) = sn else {
            return TextReply::error(400, "Missing SN");
        };
        let result = self
            .enrollment
            .ensure_device(sn, Vendor::ZkTeco)
            .map_err(GatewayError::from)
            .and_then(|_| f(sn));
        match result {
            Ok(reply) => reply,
            Err(e) => {
                match &e {
                    GatewayError::Storage(_) => error!(error = %e, "request failed"),
                    _ => warn!(error = %e, "request rejected"),
                }
                TextReply::error(e.http_status(), &e.to_string())
            }
        }
    }
}

/// `ID=7&Return=0&CMD=DATA` → map.  Values are taken verbatim; the device
/// does not percent-encode them.
fn parse_query_line(line: &str) -> HashMap<String, String> {
    line.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// `PIN=1\tName=Ada` → map.
fn parse_tab_fields(text: &str) -> HashMap<String, String> {
    text.split('\t')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
