//! Device users, their device memberships and enrollment templates.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::vendor::Vendor;

/// One row of a user's device list: the user is explicitly placed on
/// `device_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMembership {
    pub device_id: String,
    pub vendor: Vendor,
    /// Set on the device that most recently uploaded this user's template for
    /// `vendor`, so the template is not echoed back to where it came from.
    #[serde(default)]
    pub enroll_data_source: bool,
}

/// A vendor-specific biometric template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentBlob {
    pub vendor: Vendor,
    /// Opaque template bytes exactly as the vendor produced them.
    pub bytes: Vec<u8>,
    /// Finger / credential slot on the device (text vendor `FID`).
    #[serde(default)]
    pub slot: u32,
}

impl EnrollmentBlob {
    pub fn new(vendor: Vendor, bytes: Vec<u8>) -> Self {
        Self {
            vendor,
            bytes,
            slot: 0,
        }
    }
}

/// A person as the terminals know them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUser {
    /// Device PIN, without leading zeros.
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Linked employee record, if any.
    #[serde(default)]
    pub employee: Option<String>,
    /// Place this user on every enabled device of each vendor.
    #[serde(default)]
    pub allow_in_all_devices: bool,
    #[serde(default)]
    pub devices: Vec<DeviceMembership>,
    /// Revision of the stored template per vendor.  Absent means no template
    /// is on file for that vendor.  Bumped on every template write.
    #[serde(default)]
    pub template_revisions: BTreeMap<Vendor, u64>,
}

impl DeviceUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            employee: None,
            allow_in_all_devices: false,
            devices: Vec::new(),
            template_revisions: BTreeMap::new(),
        }
    }

    pub fn has_template(&self, vendor: Vendor) -> bool {
        self.template_revisions.contains_key(&vendor)
    }

    /// Records that a new template for `vendor` was stored.
    pub fn bump_template(&mut self, vendor: Vendor) -> u64 {
        let rev = self.template_revisions.entry(vendor).or_insert(0);
        *rev += 1;
        *rev
    }

    /// Devices of `vendor` this user is explicitly listed on.
    pub fn listed_devices(&self, vendor: Vendor) -> BTreeSet<String> {
        self.devices
            .iter()
            .filter(|m| m.vendor == vendor)
            .map(|m| m.device_id.clone())
            .collect()
    }

    /// The device that supplied the current `vendor` template, if known.
    pub fn source_device(&self, vendor: Vendor) -> Option<&str> {
        self.devices
            .iter()
            .find(|m| m.vendor == vendor && m.enroll_data_source)
            .map(|m| m.device_id.as_str())
    }

    /// Adds a membership row for `device_id` unless one exists.  Returns
    /// `true` if a row was added.
    pub fn ensure_membership(&mut self, device_id: &str, vendor: Vendor) -> bool {
        if self.devices.iter().any(|m| m.device_id == device_id) {
            return false;
        }
        self.devices.push(DeviceMembership {
            device_id: device_id.to_string(),
            vendor,
            enroll_data_source: false,
        });
        true
    }

    /// Marks `device_id` as the template source for `vendor`, clearing the
    /// flag on every other row of that vendor.
    pub fn mark_source(&mut self, device_id: &str, vendor: Vendor) {
        self.ensure_membership(device_id, vendor);
        for m in self.devices.iter_mut().filter(|m| m.vendor == vendor) {
            m.enroll_data_source = m.device_id == device_id;
        }
    }
}

/// Strips leading zeros from a device PIN (`"00042"` → `"42"`).  A PIN made
/// only of zeros is returned unchanged.
pub fn normalize_pin(raw: &str) -> String {
    let raw = raw.trim();
    match raw.trim_start_matches('0') {
        "" => raw.to_string(),
        stripped => stripped.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_pin_strips_leading_zeros() {
        assert_eq!(normalize_pin("00000042"), "42");
        assert_eq!(normalize_pin("42"), "42");
        assert_eq!(normalize_pin("000"), "000");
        assert_eq!(normalize_pin(" 0007 "), "7");
    }

    #[test]
    fn test_ensure_membership_is_idempotent() {
        let mut user = DeviceUser::new("42");

        assert!(user.ensure_membership("DEV1", Vendor::Ebkn));
        assert!(!user.ensure_membership("DEV1", Vendor::Ebkn));
        assert_eq!(user.devices.len(), 1);
        assert!(!user.devices[0].enroll_data_source);
    }

    #[test]
    fn test_mark_source_moves_flag_within_vendor_only() {
        // Arrange
        let mut user = DeviceUser::new("42");
        user.ensure_membership("DEV1", Vendor::Ebkn);
        user.ensure_membership("ZK1", Vendor::ZkTeco);
        user.mark_source("ZK1", Vendor::ZkTeco);

        // Act
        user.mark_source("DEV1", Vendor::Ebkn);
        user.mark_source("DEV2", Vendor::Ebkn);

        // Assert
        assert_eq!(user.source_device(Vendor::Ebkn), Some("DEV2"));
        assert_eq!(user.source_device(Vendor::ZkTeco), Some("ZK1"));
        assert_eq!(user.listed_devices(Vendor::Ebkn).len(), 2);
    }

    #[test]
    fn test_bump_template_increments_revision() {
        let mut user = DeviceUser::new("42");
        assert!(!user.has_template(Vendor::Ebkn));

        assert_eq!(user.bump_template(Vendor::Ebkn), 1);
        assert_eq!(user.bump_template(Vendor::Ebkn), 2);
        assert!(user.has_template(Vendor::Ebkn));
        assert!(!user.has_template(Vendor::ZkTeco));
    }

    #[test]
    fn test_user_serde_tolerates_missing_optional_fields() {
        let user: DeviceUser = serde_json::from_str(r#"{"user_id":"7"}"#).unwrap();

        assert_eq!(user, DeviceUser::new("7"));
    }
}
