//! REST-polling vendor service (Hikvision ISAPI-style terminals).
//!
//! # How it differs from the other vendors (for beginners)
//!
//! The binary and text terminals *call us*.  These devices expose their own
//! REST API instead, so the gateway is the client:
//!
//! - **Attendance** is pulled: [`HikvisionService::sync`] pages through the
//!   device's access-control event search for a time window and records
//!   each `checkIn` / `checkOut` event.
//! - **Commands** are pushed: [`HikvisionService::push_pending`] builds each
//!   pending command's JSON body and POSTs it to the device.
//!
//! All device I/O goes through the [`HikvisionApi`] trait so the service is
//! testable with a mock.  Store calls run on Tokio's blocking pool, since the
//! file-backed stores do their I/O under a lock.

use std::sync::Arc;

use async_trait::async_trait;
use biolink_core::domain::checkin::LogType;
use biolink_core::{Device, Vendor, WireCommand};
use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::application::checkin::{CheckinOutcome, CheckinRecorder};
use crate::application::command_queue::QueueError;
use crate::application::outbox::Outbox;
use crate::application::store::{Clock, RecordStore, StorageError};

/// Layout of `start_time` / `end_time` in sync requests.
pub const REQUEST_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Layout of event timestamps (offset suffix ignored).
const EVENT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Search id sent with every page of one sync.
const SEARCH_ID: &str = "123456789";

// ── Device API ────────────────────────────────────────────────────────────────

/// A failed call to a device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HikvisionError {
    /// Connection, TLS or timeout failure.
    #[error("device unreachable: {0}")]
    Transport(String),

    #[error("device answered HTTP {0}")]
    Status(u16),

    #[error("unreadable device response: {0}")]
    Decode(String),

    /// The device record lacks the address or credentials needed to call it.
    #[error("device {0} has no address configured")]
    NotConfigured(String),

    /// The device's authentication challenge could not be answered.
    #[error("cannot answer auth challenge: {0}")]
    Auth(String),
}

/// Event search condition, sent as `{"AcsEventCond": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcsEventCond {
    #[serde(rename = "searchID")]
    pub search_id: String,
    pub search_result_position: u64,
    pub max_results: u64,
    pub major: u32,
    pub minor: u32,
    pub start_time: String,
    pub end_time: String,
}

/// One page of search results (the `AcsEvent` object of the response).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcsEventPage {
    #[serde(rename = "totalMatches", default)]
    pub total_matches: u64,
    #[serde(rename = "InfoList", default)]
    pub events: Vec<AcsEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcsEvent {
    #[serde(rename = "employeeNoString", default)]
    pub employee_no: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(rename = "attendanceStatus", default)]
    pub attendance_status: Option<String>,
}

/// Outbound calls to one REST-polling device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HikvisionApi: Send + Sync {
    /// Runs one page of the access-control event search.
    async fn search_events(
        &self,
        device: &Device,
        cond: &AcsEventCond,
    ) -> Result<AcsEventPage, HikvisionError>;

    /// POSTs `body` to `path` on the device.  Returns the device's status
    /// code text (`"1"` / `"OK"` on success).
    async fn push_command(
        &self,
        device: &Device,
        path: &str,
        body: &Value,
    ) -> Result<String, HikvisionError>;
}

// ── Options & results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Events requested per page.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// A window with more matches than this is refused.
    #[serde(default = "default_max_records")]
    pub max_records: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Offset appended to search times, e.g. `+03:00`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    /// Seconds between scheduled syncs of every device; 0 disables them.
    #[serde(default)]
    pub scheduled_sync_interval_secs: u64,
}

fn default_batch_size() -> u64 {
    10
}
fn default_max_records() -> u64 {
    1500
}
fn default_request_timeout_secs() -> u64 {
    600
}
fn default_utc_offset() -> String {
    "+03:00".to_string()
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_records: default_max_records(),
            request_timeout_secs: default_request_timeout_secs(),
            utc_offset: default_utc_offset(),
            scheduled_sync_interval_secs: 0,
        }
    }
}

/// Body of `POST /hikvision/sync`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub device_serial: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub message: String,
    pub synced: usize,
    pub skipped: usize,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Device serial is required")]
    MissingSerial,

    #[error("Device {0} not found")]
    DeviceNotFound(String),

    #[error("Device is not a Hikvision device")]
    WrongVendor,

    #[error("Device is disabled")]
    Disabled,

    #[error("Invalid time '{0}', expected YYYY-MM-DD HH:MM:SS")]
    InvalidTime(String),

    #[error("Too many records to process ({total} > {max}). Please reduce the date range and try again.")]
    TooManyRecords { total: u64, max: u64 },

    #[error("Failed to fetch attendance logs: {0}")]
    Device(#[from] HikvisionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn http_status(&self) -> u16 {
        match self {
            SyncError::MissingSerial | SyncError::WrongVendor | SyncError::Disabled => 400,
            SyncError::InvalidTime(_) | SyncError::TooManyRecords { .. } => 400,
            SyncError::DeviceNotFound(_) => 404,
            SyncError::Device(_) => 502,
            SyncError::Storage(_) => 500,
        }
    }
}

/// Outcome of one [`HikvisionService::push_pending`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub sent: usize,
    pub failed: usize,
}

/// Totals of a [`HikvisionService::sync_all`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncTotals {
    pub synced: usize,
    pub skipped: usize,
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct HikvisionService {
    api: Arc<dyn HikvisionApi>,
    records: Arc<dyn RecordStore>,
    checkins: Arc<CheckinRecorder>,
    outbox: Arc<Outbox>,
    clock: Arc<dyn Clock>,
    options: SyncOptions,
    span: Span,
}

impl HikvisionService {
    pub fn new(
        api: Arc<dyn HikvisionApi>,
        records: Arc<dyn RecordStore>,
        checkins: Arc<CheckinRecorder>,
        outbox: Arc<Outbox>,
        clock: Arc<dyn Clock>,
        options: SyncOptions,
        parent: &Span,
    ) -> Self {
        Self {
            api,
            records,
            checkins,
            outbox,
            clock,
            options,
            span: info_span!(parent: parent, "hikvision"),
        }
    }

    /// Pulls attendance for one device over the requested window.
    ///
    /// The window defaults to the device's configured sync window, else
    /// today from midnight until now.
    ///
    /// # Errors
    ///
    /// [`SyncError`] for validation failures, an oversized window, a failed
    /// first page or a storage failure.
    pub async fn sync(&self, req: &SyncRequest) -> Result<SyncReport, SyncError> {
        let serial = req
            .device_serial
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SyncError::MissingSerial)?;
        let span = info_span!(parent: &self.span, "request", vendor = "hikvision", dev_id = serial);
        self.sync_device(serial, req).instrument(span).await
    }

    /// Syncs every enabled REST-polling device over today's window.  Device
    /// failures are logged and do not stop the run.  Returns the totals.
    ///
    /// # Errors
    ///
    /// [`StorageError`] if the device list cannot be read.
    pub async fn sync_all(&self) -> Result<SyncTotals, StorageError> {
        let devices = self.active_devices().await?;
        if devices.is_empty() {
            debug!(parent: &self.span, "no active REST-polling devices to sync");
            return Ok(SyncTotals::default());
        }

        let today = self.clock.local_now().date().and_time(NaiveTime::MIN);
        let now = self.clock.local_now();
        let mut totals = SyncTotals::default();
        for device in devices {
            let req = SyncRequest {
                device_serial: Some(device.id.clone()),
                start_time: Some(today.format(REQUEST_TIME_FORMAT).to_string()),
                end_time: Some(now.format(REQUEST_TIME_FORMAT).to_string()),
            };
            match self.sync(&req).await {
                Ok(report) => {
                    totals.synced += report.synced;
                    totals.skipped += report.skipped;
                }
                Err(e) => error!(parent: &self.span, device_id = %device.id, error = %e, "scheduled sync failed"),
            }
        }
        info!(parent: &self.span, synced = totals.synced, skipped = totals.skipped, "scheduled sync completed");
        Ok(totals)
    }

    /// Pushes the device's pending commands, oldest first.  Stops at the
    /// first transport failure.
    ///
    /// # Errors
    ///
    /// [`QueueError`] if the queue's store fails.
    pub async fn push_pending(&self, device: &Device) -> Result<PushReport, QueueError> {
        let span = info_span!(parent: &self.span, "push", vendor = "hikvision", dev_id = %device.id);
        self.push_device(device).instrument(span).await
    }

    /// Runs [`Self::push_pending`] for every enabled REST-polling device.
    ///
    /// # Errors
    ///
    /// [`StorageError`] if the device list cannot be read.
    pub async fn push_all(&self) -> Result<PushReport, StorageError> {
        let mut totals = PushReport::default();
        for device in self.active_devices().await? {
            match self.push_pending(&device).await {
                Ok(report) => {
                    totals.sent += report.sent;
                    totals.failed += report.failed;
                }
                Err(e) => error!(parent: &self.span, device_id = %device.id, error = %e, "command push failed"),
            }
        }
        Ok(totals)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn active_devices(&self) -> Result<Vec<Device>, StorageError> {
        let records = self.records.clone();
        blocking(move || {
            Ok(records
                .devices()?
                .into_iter()
                .filter(|d| d.vendor == Vendor::Hikvision && d.is_active())
                .collect())
        })
        .await
    }

    async fn sync_device(&self, serial: &str, req: &SyncRequest) -> Result<SyncReport, SyncError> {
        let records = self.records.clone();
        let id = serial.to_string();
        let mut device = blocking(move || records.get_device(&id))
            .await?
            .ok_or_else(|| SyncError::DeviceNotFound(serial.to_string()))?;
        if device.vendor != Vendor::Hikvision {
            return Err(SyncError::WrongVendor);
        }
        if device.disabled {
            return Err(SyncError::Disabled);
        }

        let (start, end) = self.window(&device, req)?;
        let report = self.pull(&device, start, end).await?;

        device.last_synced_at = Some(self.clock.now());
        let records = self.records.clone();
        blocking(move || records.upsert_device(device)).await?;
        info!(synced = report.synced, skipped = report.skipped, "{}", report.message);
        Ok(report)
    }

    async fn push_device(&self, device: &Device) -> Result<PushReport, QueueError> {
        let mut report = PushReport::default();
        let records = self.records.clone();
        let id = device.id.clone();
        let budget = blocking(move || records.pending_commands(&id)).await?.len();

        for _ in 0..budget {
            let outbox = self.outbox.clone();
            let id = device.id.clone();
            let Some(out) = blocking(move || outbox.next_for(&id)).await? else {
                break;
            };
            let WireCommand::Json { path, body } = &out.wire else {
                warn!(id = %out.command.id, vendor = %out.command.vendor, "command for another vendor queued on REST device");
                self.record_failure(
                    &out.command.id,
                    "Build Failed: device does not speak this vendor's protocol",
                )
                .await?;
                report.failed += 1;
                continue;
            };

            match self.api.push_command(device, path, body).await {
                Ok(code) => {
                    let outbox = self.outbox.clone();
                    let id = out.command.id.clone();
                    let cmd =
                        blocking(move || outbox.queue().record_acknowledgement(&id, &code, None))
                            .await?;
                    info!(id = %cmd.id, status = ?cmd.status, "command pushed");
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(id = %out.command.id, error = %e, "command push failed");
                    self.record_failure(&out.command.id, &e.to_string()).await?;
                    report.failed += 1;
                    if matches!(
                        e,
                        HikvisionError::Transport(_)
                            | HikvisionError::NotConfigured(_)
                            | HikvisionError::Auth(_)
                    ) {
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn record_failure(&self, id: &str, reason: &str) -> Result<(), QueueError> {
        let outbox = self.outbox.clone();
        let (id, reason) = (id.to_string(), reason.to_string());
        blocking(move || outbox.queue().record_attempt_failure(&id, &reason))
            .await
            .map(|_| ())
    }

    fn window(
        &self,
        device: &Device,
        req: &SyncRequest,
    ) -> Result<(NaiveDateTime, NaiveDateTime), SyncError> {
        let parse = |raw: &str| {
            NaiveDateTime::parse_from_str(raw.trim(), REQUEST_TIME_FORMAT)
                .map_err(|_| SyncError::InvalidTime(raw.to_string()))
        };
        let now = self.clock.local_now();
        let start = match req.start_time.as_deref() {
            Some(raw) => parse(raw)?,
            None => device
                .sync_start
                .unwrap_or_else(|| now.date().and_time(NaiveTime::MIN)),
        };
        let end = match req.end_time.as_deref() {
            Some(raw) => parse(raw)?,
            None => device.sync_end.unwrap_or(now),
        };
        Ok((start, end))
    }

    /// Pages through the event search.  Stops on a short page, a failed
    /// later page, or once the cursor has covered `totalMatches` (capped at
    /// `max_records`), whichever comes first.
    async fn pull(
        &self,
        device: &Device,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<SyncReport, SyncError> {
        let offset = &self.options.utc_offset;
        let batch = self.options.batch_size.max(1);
        let mut cond = AcsEventCond {
            search_id: SEARCH_ID.to_string(),
            search_result_position: 0,
            max_results: batch,
            major: 0,
            minor: 0,
            start_time: format!("{}{offset}", start.format(EVENT_TIME_FORMAT)),
            end_time: format!("{}{offset}", end.format(EVENT_TIME_FORMAT)),
        };

        let mut page = self.api.search_events(device, &cond).await?;
        let total = page.total_matches;
        if total == 0 {
            return Ok(SyncReport {
                message: "No attendance records found for the given time period".to_string(),
                synced: 0,
                skipped: 0,
            });
        }
        if total > self.options.max_records {
            warn!(total, max = self.options.max_records, "sync window too large");
            return Err(SyncError::TooManyRecords {
                total,
                max: self.options.max_records,
            });
        }
        debug!(total, "event search started");
        let end_position = total.min(self.options.max_records);

        let (mut synced, mut skipped) = (0usize, 0usize);
        loop {
            let fetched = page.events.len() as u64;
            let (recorded, duplicates) = self.record_page(&device.id, page.events).await?;
            synced += recorded;
            skipped += duplicates;

            cond.search_result_position += batch;
            if fetched < batch || cond.search_result_position >= end_position {
                break;
            }

            page = match self.api.search_events(device, &cond).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(position = cond.search_result_position, error = %e, "page fetch failed, keeping partial result");
                    break;
                }
            };
        }

        Ok(SyncReport {
            message: format!(
                "Synced {synced} attendance records successfully. {skipped} duplicate records skipped."
            ),
            synced,
            skipped,
        })
    }

    /// Records one page of events.  Returns `(recorded, duplicates)`.
    async fn record_page(
        &self,
        device_id: &str,
        events: Vec<AcsEvent>,
    ) -> Result<(usize, usize), StorageError> {
        let checkins = self.checkins.clone();
        let device_id = device_id.to_string();
        let span = Span::current();
        blocking(move || {
            let _guard = span.enter();
            let (mut recorded, mut duplicates) = (0usize, 0usize);
            for event in &events {
                match record_event(&checkins, &device_id, event)? {
                    Some(CheckinOutcome::Recorded) => recorded += 1,
                    Some(CheckinOutcome::Duplicate) => duplicates += 1,
                    Some(CheckinOutcome::SkippedUnknownEmployee) | None => {}
                }
            }
            Ok((recorded, duplicates))
        })
        .await
    }
}

/// `None` when the event is not an attendance punch.
fn record_event(
    checkins: &CheckinRecorder,
    device_id: &str,
    event: &AcsEvent,
) -> Result<Option<CheckinOutcome>, StorageError> {
    let (Some(employee_no), Some(raw_time)) = (
        event.employee_no.as_deref().filter(|s| !s.is_empty()),
        event.time.as_deref().filter(|s| !s.is_empty()),
    ) else {
        return Ok(None);
    };
    let log_type = match event.attendance_status.as_deref() {
        Some("checkIn") => LogType::In,
        Some("checkOut") => LogType::Out,
        _ => return Ok(None),
    };
    let Some(time) = raw_time
        .get(..19)
        .and_then(|t| NaiveDateTime::parse_from_str(t, EVENT_TIME_FORMAT).ok())
    else {
        warn!(raw_time, "event with unreadable timestamp");
        return Ok(None);
    };

    checkins
        .record(device_id, employee_no, time, log_type)
        .map(Some)
}

/// Runs a store call on Tokio's blocking pool.  The stores do file I/O under
/// a lock and must not run on a runtime worker.
async fn blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, E>
where
    T: Send + 'static,
    E: From<StorageError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(StorageError::TaskFailed(e.to_string()).into()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
