//! Attendance records.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Direction of an attendance punch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogType {
    In,
    Out,
}

/// One attendance punch reported by a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkin {
    /// Linked employee; `None` when the device user is not linked and unknown
    /// punches are being recorded anyway.
    pub employee: Option<String>,
    /// PIN as reported by the device.
    pub device_user_id: String,
    /// Device local time.
    pub time: NaiveDateTime,
    pub device_id: String,
    pub log_type: LogType,
}

impl Checkin {
    /// Two punches are the same event when employee, time, direction and
    /// device match.  Unlinked punches compare by device PIN instead.
    pub fn is_duplicate_of(&self, other: &Checkin) -> bool {
        let same_person = match (&self.employee, &other.employee) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.device_user_id == other.device_user_id,
            _ => false,
        };
        same_person
            && self.time == other.time
            && self.log_type == other.log_type
            && self.device_id == other.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn make(employee: Option<&str>, pin: &str, log_type: LogType) -> Checkin {
        Checkin {
            employee: employee.map(str::to_string),
            device_user_id: pin.to_string(),
            time: NaiveDate::from_ymd_opt(2024, 5, 2)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
            device_id: "DEV1".to_string(),
            log_type,
        }
    }

    #[test]
    fn test_same_employee_time_direction_device_is_duplicate() {
        let a = make(Some("EMP-1"), "42", LogType::In);
        let b = make(Some("EMP-1"), "0042", LogType::In);

        assert!(a.is_duplicate_of(&b));
    }

    #[test]
    fn test_different_direction_is_not_duplicate() {
        let a = make(Some("EMP-1"), "42", LogType::In);
        let b = make(Some("EMP-1"), "42", LogType::Out);

        assert!(!a.is_duplicate_of(&b));
    }

    #[test]
    fn test_unlinked_punches_compare_by_pin() {
        let a = make(None, "42", LogType::In);

        assert!(a.is_duplicate_of(&make(None, "42", LogType::In)));
        assert!(!a.is_duplicate_of(&make(None, "43", LogType::In)));
        assert!(!a.is_duplicate_of(&make(Some("EMP-1"), "42", LogType::In)));
    }
}
