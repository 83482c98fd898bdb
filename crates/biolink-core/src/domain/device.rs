//! Registered terminals.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::vendor::Vendor;

/// A physical terminal, identified by its vendor-assigned serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Serial / `dev_id` / `SN` as the terminal reports it.
    pub id: String,
    pub vendor: Vendor,
    #[serde(default)]
    pub disabled: bool,
    /// Text vendor: timestamp of the newest attendance line accepted, echoed
    /// back as `ATTLOGStamp` so the device does not resend older lines.
    #[serde(default)]
    pub last_sync_on: Option<String>,
    /// REST vendor: when the last pull finished.
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// REST vendor: device address (`host` or `host:port`).
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// REST vendor: default pull window in device local time.
    #[serde(default)]
    pub sync_start: Option<NaiveDateTime>,
    #[serde(default)]
    pub sync_end: Option<NaiveDateTime>,
}

impl Device {
    pub fn new(id: impl Into<String>, vendor: Vendor) -> Self {
        Self {
            id: id.into(),
            vendor,
            disabled: false,
            last_sync_on: None,
            last_synced_at: None,
            ip: None,
            username: None,
            password: None,
            sync_start: None,
            sync_end: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.disabled
    }
}
