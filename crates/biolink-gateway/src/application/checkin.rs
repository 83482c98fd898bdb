//! Attendance recording shared by all three vendor adapters.

use std::sync::Arc;

use biolink_core::domain::checkin::{Checkin, LogType};
use biolink_core::domain::user::normalize_pin;
use chrono::NaiveDateTime;
use tracing::{debug, info_span, Span};

use crate::application::store::{RecordStore, StorageError};

/// What happened to one punch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    Recorded,
    /// An identical punch is already stored.
    Duplicate,
    /// The device user is not linked to an employee and unknown punches are
    /// not being kept.
    SkippedUnknownEmployee,
}

pub struct CheckinRecorder {
    records: Arc<dyn RecordStore>,
    record_unknown_employee: bool,
    span: Span,
}

impl CheckinRecorder {
    pub fn new(records: Arc<dyn RecordStore>, record_unknown_employee: bool, parent: &Span) -> Self {
        Self {
            records,
            record_unknown_employee,
            span: info_span!(parent: parent, "checkin"),
        }
    }

    /// Records a punch of device user `pin` on `device_id`.
    ///
    /// # Errors
    ///
    /// [`StorageError`] if the record store fails.
    pub fn record(
        &self,
        device_id: &str,
        pin: &str,
        time: NaiveDateTime,
        log_type: LogType,
    ) -> Result<CheckinOutcome, StorageError> {
        let _guard = self.span.enter();
        let pin = normalize_pin(pin);
        let employee = self
            .records
            .get_user(&pin)?
            .and_then(|user| user.employee);

        if employee.is_none() && !self.record_unknown_employee {
            debug!(device_id, pin = %pin, "punch from unlinked user skipped");
            return Ok(CheckinOutcome::SkippedUnknownEmployee);
        }

        let checkin = Checkin {
            employee,
            device_user_id: pin,
            time,
            device_id: device_id.to_string(),
            log_type,
        };
        if self.records.insert_checkin_if_new(checkin)? {
            debug!(device_id, %time, ?log_type, "check-in recorded");
            Ok(CheckinOutcome::Recorded)
        } else {
            Ok(CheckinOutcome::Duplicate)
        }
    }
}
