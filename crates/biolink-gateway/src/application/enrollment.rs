//! EnrollmentSync: saves device users and devices, then fans the change out
//! to the command queue.
//!
//! # How the fan-out works (for beginners)
//!
//! Every save follows the same three steps:
//!
//! 1. Take a [`UserSnapshot`] of the stored user *before* the write.
//! 2. Write the new user.
//! 3. Hand both snapshots to the pure [`diff`] / [`plan_commands`] functions
//!    from `biolink-core` and enqueue whatever they return.
//!
//! Because the queue dedups on enqueue, saving the same user twice never
//! produces duplicate pending commands.

use std::sync::Arc;

use biolink_core::domain::sync::{
    diff, plan_commands, plan_device_activation, ActiveDevices, CommandRequest, UserSnapshot,
};
use biolink_core::{Command, Device, DeviceUser, EnrollmentBlob, Vendor};
use tracing::{debug, info, info_span, Span};

use crate::application::command_queue::{CommandQueue, QueueError};
use crate::application::store::{BlobStore, InsertOutcome, RecordStore};

pub struct EnrollmentSync {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<CommandQueue>,
    span: Span,
}

impl EnrollmentSync {
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<CommandQueue>,
        parent: &Span,
    ) -> Self {
        Self {
            records,
            blobs,
            queue,
            span: info_span!(parent: parent, "enrollment"),
        }
    }

    /// Stores `after` and queues the commands its changes imply.  Returns
    /// the newly created commands.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn save_user(&self, after: DeviceUser) -> Result<Vec<Command>, QueueError> {
        let _guard = self.span.enter();
        let before = self
            .records
            .get_user(&after.user_id)?
            .map(|u| UserSnapshot::from(&u))
            .unwrap_or_else(|| UserSnapshot::empty(after.user_id.clone()));
        let after_snapshot = UserSnapshot::from(&after);
        self.records.upsert_user(after)?;

        let changes = diff(&before, &after_snapshot);
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        debug!(user_id = %after_snapshot.user_id, ?changes, "device user changed");

        let requests = plan_commands(&changes, &after_snapshot, &self.active_devices()?);
        self.enqueue_all(requests.iter())
    }

    /// Adds `device_id` to the user's device list (creating the user if
    /// needed) and applies `display_name` when given.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn register_device_user(
        &self,
        user_id: &str,
        device_id: &str,
        vendor: Vendor,
        display_name: Option<String>,
    ) -> Result<Vec<Command>, QueueError> {
        let mut user = self
            .records
            .get_user(user_id)?
            .unwrap_or_else(|| DeviceUser::new(user_id));
        user.ensure_membership(device_id, vendor);
        if display_name.is_some() {
            user.display_name = display_name;
        }
        self.save_user(user)
    }

    /// Stores a template uploaded by `source_device` and enrolls it on the
    /// user's other allowed devices.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if either store fails.
    pub fn store_template(
        &self,
        user_id: &str,
        source_device: &str,
        blob: EnrollmentBlob,
    ) -> Result<Vec<Command>, QueueError> {
        let mut user = self
            .records
            .get_user(user_id)?
            .unwrap_or_else(|| DeviceUser::new(user_id));
        self.blobs.put_template(user_id, &blob)?;

        let revision = user.bump_template(blob.vendor);
        user.mark_source(source_device, blob.vendor);
        {
            let _guard = self.span.enter();
            info!(user_id, source_device, vendor = %blob.vendor, revision, len = blob.bytes.len(), "template stored");
        }
        self.save_user(user)
    }

    /// Stores `device`.  A device that is new or was just re-enabled gets
    /// every "all devices" user that has a template for its vendor.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn upsert_device(&self, device: Device) -> Result<Vec<Command>, QueueError> {
        let was_active = self
            .records
            .get_device(&device.id)?
            .map(|d| d.is_active())
            .unwrap_or(false);
        self.records.upsert_device(device.clone())?;

        if was_active || !device.is_active() {
            return Ok(Vec::new());
        }
        let _guard = self.span.enter();
        info!(device_id = %device.id, vendor = %device.vendor, "device activated");
        let requests = plan_device_activation(&device, &self.records.users()?);
        self.enqueue_all(requests.iter())
    }

    /// Registers `device_id` on first contact.  Known devices are left as
    /// they are, including disabled ones.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn ensure_device(&self, device_id: &str, vendor: Vendor) -> Result<Vec<Command>, QueueError> {
        if self.records.get_device(device_id)?.is_some() {
            return Ok(Vec::new());
        }
        self.upsert_device(Device::new(device_id, vendor))
    }

    fn active_devices(&self) -> Result<ActiveDevices, QueueError> {
        let mut active = ActiveDevices::new();
        for device in self.records.devices()?.into_iter().filter(Device::is_active) {
            active.entry(device.vendor).or_default().insert(device.id);
        }
        Ok(active)
    }

    fn enqueue_all<'a>(
        &self,
        requests: impl Iterator<Item = &'a CommandRequest>,
    ) -> Result<Vec<Command>, QueueError> {
        let mut created = Vec::new();
        for req in requests {
            if let InsertOutcome::Inserted(cmd) = self.queue.enqueue_request(req)? {
                created.push(cmd);
            }
        }
        Ok(created)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
