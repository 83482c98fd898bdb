//! Change detection for device users and the commands it implies.
//!
//! # How a user edit becomes device commands (for beginners)
//!
//! When someone edits a device user (adds them to a device, uploads a new
//! fingerprint, ticks "allow on all devices") the terminals have to be told.
//! Rather than relying on a persistence framework's change tracking, the
//! caller takes a [`UserSnapshot`] before and after the edit and hands both to
//! [`diff`].  The resulting [`UserDiff`] is plain data, and [`plan_commands`]
//! turns it into a list of [`CommandRequest`]s for the command queue.
//!
//! Both functions are pure: the set of currently active devices is passed in
//! by the caller.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::command::CommandKind;
use crate::domain::device::Device;
use crate::domain::user::DeviceUser;
use crate::domain::vendor::Vendor;

/// Active (not disabled) device ids, grouped by vendor.
pub type ActiveDevices = BTreeMap<Vendor, BTreeSet<String>>;

/// A (vendor, device) membership row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MembershipKey {
    pub vendor: Vendor,
    pub device_id: String,
}

/// The parts of a [`DeviceUser`] that drive device commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSnapshot {
    pub user_id: String,
    pub allow_in_all_devices: bool,
    pub memberships: BTreeSet<MembershipKey>,
    pub template_revisions: BTreeMap<Vendor, u64>,
    pub source_devices: BTreeMap<Vendor, String>,
}

impl UserSnapshot {
    /// Snapshot of a user that does not exist yet.
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    fn listed(&self, vendor: Vendor) -> BTreeSet<String> {
        self.memberships
            .iter()
            .filter(|m| m.vendor == vendor)
            .map(|m| m.device_id.clone())
            .collect()
    }

    /// Devices of `vendor` this user should be on.
    fn allowed(&self, vendor: Vendor, active: &ActiveDevices) -> BTreeSet<String> {
        if self.allow_in_all_devices {
            active.get(&vendor).cloned().unwrap_or_default()
        } else {
            self.listed(vendor)
        }
    }
}

impl From<&DeviceUser> for UserSnapshot {
    fn from(user: &DeviceUser) -> Self {
        Self {
            user_id: user.user_id.clone(),
            allow_in_all_devices: user.allow_in_all_devices,
            memberships: user
                .devices
                .iter()
                .map(|m| MembershipKey {
                    vendor: m.vendor,
                    device_id: m.device_id.clone(),
                })
                .collect(),
            template_revisions: user.template_revisions.clone(),
            source_devices: user
                .devices
                .iter()
                .filter(|m| m.enroll_data_source)
                .map(|m| (m.vendor, m.device_id.clone()))
                .collect(),
        }
    }
}

/// A scalar field that differs between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldChange {
    /// The "allow in all devices" flag now has this value.
    AllowInAllDevices(bool),
    /// A new template was stored for this vendor.
    Template(Vendor),
}

/// Result of [`diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDiff {
    pub added: BTreeSet<MembershipKey>,
    pub removed: BTreeSet<MembershipKey>,
    pub changed: Vec<FieldChange>,
}

impl UserDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// One command the queue should hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandRequest {
    pub device_id: String,
    pub user_id: String,
    pub vendor: Vendor,
    pub kind: CommandKind,
}

impl CommandRequest {
    fn new(device_id: &str, user_id: &str, vendor: Vendor, kind: CommandKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            vendor,
            kind,
        }
    }
}

/// Compares two snapshots of the same user.
pub fn diff(before: &UserSnapshot, after: &UserSnapshot) -> UserDiff {
    let mut changed = Vec::new();

    if before.allow_in_all_devices != after.allow_in_all_devices {
        changed.push(FieldChange::AllowInAllDevices(after.allow_in_all_devices));
    }
    for vendor in Vendor::ALL {
        let now = after.template_revisions.get(&vendor);
        if now.is_some() && now != before.template_revisions.get(&vendor) {
            changed.push(FieldChange::Template(vendor));
        }
    }

    UserDiff {
        added: after
            .memberships
            .difference(&before.memberships)
            .cloned()
            .collect(),
        removed: before
            .memberships
            .difference(&after.memberships)
            .cloned()
            .collect(),
        changed,
    }
}

/// Turns a diff into command requests.
///
/// - new template: enroll on every allowed device of that vendor except the
///   device that supplied it
/// - flag on: enroll on every active device
/// - flag off: delete from active devices the user is not listed on
/// - added membership: enroll if a template exists for that vendor
/// - removed membership: delete
///
/// A device that just supplied a template is never asked to enroll it.
pub fn plan_commands(
    changes: &UserDiff,
    after: &UserSnapshot,
    active: &ActiveDevices,
) -> Vec<CommandRequest> {
    let user = after.user_id.as_str();
    let mut out = BTreeSet::new();

    for change in &changes.changed {
        match *change {
            FieldChange::Template(vendor) => {
                let source = after.source_devices.get(&vendor);
                for dev in after.allowed(vendor, active) {
                    if Some(&dev) != source {
                        out.insert(CommandRequest::new(&dev, user, vendor, CommandKind::EnrollUser));
                    }
                }
            }
            FieldChange::AllowInAllDevices(true) => {
                for vendor in Vendor::ALL {
                    for dev in after.allowed(vendor, active) {
                        out.insert(CommandRequest::new(&dev, user, vendor, CommandKind::EnrollUser));
                    }
                }
            }
            FieldChange::AllowInAllDevices(false) => {
                for vendor in Vendor::ALL {
                    let keep = after.listed(vendor);
                    let all = active.get(&vendor).cloned().unwrap_or_default();
                    for dev in all.difference(&keep) {
                        out.insert(CommandRequest::new(dev, user, vendor, CommandKind::DeleteUser));
                    }
                }
            }
        }
    }

    for m in &changes.added {
        if after.template_revisions.contains_key(&m.vendor) {
            out.insert(CommandRequest::new(&m.device_id, user, m.vendor, CommandKind::EnrollUser));
        }
    }
    for m in &changes.removed {
        out.insert(CommandRequest::new(&m.device_id, user, m.vendor, CommandKind::DeleteUser));
    }

    // Never echo a fresh template back to the device that uploaded it.
    out.into_iter()
        .filter(|r| {
            let fresh = changes.changed.contains(&FieldChange::Template(r.vendor));
            !(fresh
                && r.kind == CommandKind::EnrollUser
                && after.source_devices.get(&r.vendor) == Some(&r.device_id))
        })
        .collect()
}

/// Commands for a device that was just registered or re-enabled: every
/// "all devices" user with a template for the device's vendor is enrolled.
pub fn plan_device_activation(device: &Device, users: &[DeviceUser]) -> Vec<CommandRequest> {
    if !device.is_active() {
        return Vec::new();
    }
    users
        .iter()
        .filter(|u| u.allow_in_all_devices && u.has_template(device.vendor))
        .map(|u| CommandRequest::new(&device.id, &u.user_id, device.vendor, CommandKind::EnrollUser))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> ActiveDevices {
        let mut map = ActiveDevices::new();
        map.insert(
            Vendor::Ebkn,
            ["E1", "E2", "E3"].iter().map(|s| s.to_string()).collect(),
        );
        map.insert(Vendor::ZkTeco, ["Z1"].iter().map(|s| s.to_string()).collect());
        map
    }

    fn req(dev: &str, vendor: Vendor, kind: CommandKind) -> CommandRequest {
        CommandRequest::new(dev, "42", vendor, kind)
    }

    #[test]
    fn test_identical_snapshots_produce_empty_diff() {
        let mut user = DeviceUser::new("42");
        user.ensure_membership("E1", Vendor::Ebkn);
        let snap = UserSnapshot::from(&user);

        assert!(diff(&snap, &snap).is_empty());
    }

    #[test]
    fn test_new_template_enrolls_everywhere_except_source() {
        // Arrange
        let mut user = DeviceUser::new("42");
        user.ensure_membership("E1", Vendor::Ebkn);
        user.ensure_membership("E2", Vendor::Ebkn);
        let before = UserSnapshot::from(&user);
        user.bump_template(Vendor::Ebkn);
        user.mark_source("E1", Vendor::Ebkn);
        let after = UserSnapshot::from(&user);

        // Act
        let changes = diff(&before, &after);
        let plan = plan_commands(&changes, &after, &active());

        // Assert
        assert_eq!(changes.changed, vec![FieldChange::Template(Vendor::Ebkn)]);
        assert_eq!(plan, vec![req("E2", Vendor::Ebkn, CommandKind::EnrollUser)]);
    }

    #[test]
    fn test_template_from_newly_listed_device_is_not_echoed_back() {
        // Arrange – the upload itself adds the membership row
        let mut user = DeviceUser::new("42");
        user.ensure_membership("Z1", Vendor::ZkTeco);
        let before = UserSnapshot::from(&user);
        user.bump_template(Vendor::ZkTeco);
        user.mark_source("Z2", Vendor::ZkTeco);
        let after = UserSnapshot::from(&user);

        // Act
        let plan = plan_commands(&diff(&before, &after), &after, &active());

        // Assert
        assert_eq!(plan, vec![req("Z1", Vendor::ZkTeco, CommandKind::EnrollUser)]);
    }

    #[test]
    fn test_flag_on_enrolls_on_all_active_devices() {
        let before = UserSnapshot::empty("42");
        let after = UserSnapshot {
            allow_in_all_devices: true,
            ..before.clone()
        };

        let plan = plan_commands(&diff(&before, &after), &after, &active());

        assert_eq!(plan.len(), 4);
        assert!(plan.iter().all(|r| r.kind == CommandKind::EnrollUser));
        assert!(plan.contains(&req("Z1", Vendor::ZkTeco, CommandKind::EnrollUser)));
    }

    #[test]
    fn test_flag_off_deletes_from_devices_not_listed() {
        // Arrange
        let mut user = DeviceUser::new("42");
        user.allow_in_all_devices = true;
        user.ensure_membership("E2", Vendor::Ebkn);
        let before = UserSnapshot::from(&user);
        user.allow_in_all_devices = false;
        let after = UserSnapshot::from(&user);

        // Act
        let plan = plan_commands(&diff(&before, &after), &after, &active());

        // Assert
        assert_eq!(
            plan,
            vec![
                req("E1", Vendor::Ebkn, CommandKind::DeleteUser),
                req("E3", Vendor::Ebkn, CommandKind::DeleteUser),
                req("Z1", Vendor::ZkTeco, CommandKind::DeleteUser),
            ]
        );
    }

    #[test]
    fn test_added_membership_enrolls_only_with_template() {
        // Arrange
        let mut user = DeviceUser::new("42");
        user.bump_template(Vendor::Ebkn);
        let before = UserSnapshot::from(&user);
        user.ensure_membership("E3", Vendor::Ebkn);
        user.ensure_membership("Z1", Vendor::ZkTeco);
        let after = UserSnapshot::from(&user);

        // Act
        let changes = diff(&before, &after);
        let plan = plan_commands(&changes, &after, &active());

        // Assert
        assert_eq!(changes.added.len(), 2);
        assert_eq!(plan, vec![req("E3", Vendor::Ebkn, CommandKind::EnrollUser)]);
    }

    #[test]
    fn test_removed_membership_deletes() {
        let mut user = DeviceUser::new("42");
        user.ensure_membership("E1", Vendor::Ebkn);
        let before = UserSnapshot::from(&user);
        user.devices.clear();
        let after = UserSnapshot::from(&user);

        let changes = diff(&before, &after);
        let plan = plan_commands(&changes, &after, &active());

        assert_eq!(changes.removed.len(), 1);
        assert_eq!(plan, vec![req("E1", Vendor::Ebkn, CommandKind::DeleteUser)]);
    }

    #[test]
    fn test_device_activation_enrolls_all_devices_users_with_template() {
        // Arrange
        let mut everywhere = DeviceUser::new("42");
        everywhere.allow_in_all_devices = true;
        everywhere.bump_template(Vendor::Ebkn);
        let mut no_template = DeviceUser::new("43");
        no_template.allow_in_all_devices = true;
        let mut listed_only = DeviceUser::new("44");
        listed_only.bump_template(Vendor::Ebkn);
        let users = vec![everywhere, no_template, listed_only];

        // Act
        let plan = plan_device_activation(&Device::new("E9", Vendor::Ebkn), &users);

        // Assert
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].user_id, "42");
        assert_eq!(plan[0].device_id, "E9");
    }

    #[test]
    fn test_disabled_device_activation_plans_nothing() {
        let mut user = DeviceUser::new("42");
        user.allow_in_all_devices = true;
        user.bump_template(Vendor::Ebkn);
        let mut device = Device::new("E9", Vendor::Ebkn);
        device.disabled = true;

        assert!(plan_device_activation(&device, &[user]).is_empty());
    }
}
