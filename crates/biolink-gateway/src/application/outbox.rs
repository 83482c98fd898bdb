//! Outbox: answers "what should this device do next?".
//!
//! On each poll the outbox sweeps expired commands, takes the device's
//! oldest pending command, loads the user (and template, for enrollment)
//! and runs the vendor builder.  A build failure is recorded as a failed
//! attempt and the device is told there is nothing to do, so a bad command
//! never blocks the connection.

use std::sync::Arc;

use biolink_core::{build_command, BuildError, Command, CommandKind, WireCommand};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Span};

use crate::application::command_queue::{CommandQueue, QueueError};
use crate::application::store::{BlobStore, RecordStore, StorageError};

/// What to do when an `EnrollUser` command has no template on file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTemplatePolicy {
    /// Count a failed attempt; the command fails once out of attempts.
    #[default]
    Fail,
    /// Count a failed attempt and ask the device for the template instead.
    FetchEnrollData,
}

/// A command together with its built wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub command: Command,
    pub wire: WireCommand,
}

pub struct Outbox {
    queue: Arc<CommandQueue>,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    missing_template: MissingTemplatePolicy,
    span: Span,
}

impl Outbox {
    pub fn new(
        queue: Arc<CommandQueue>,
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        missing_template: MissingTemplatePolicy,
        parent: &Span,
    ) -> Self {
        Self {
            queue,
            records,
            blobs,
            missing_template,
            span: info_span!(parent: parent, "outbox"),
        }
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// The next command for `device_id`, built and ready to send.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if a store fails.  Build failures are not
    /// errors here; they are recorded on the command.
    pub fn next_for(&self, device_id: &str) -> Result<Option<Outgoing>, QueueError> {
        let _guard = self.span.enter();
        self.queue.sweep_expired()?;

        let Some(cmd) = self.queue.next(device_id)? else {
            return Ok(None);
        };

        match self.build(&cmd)? {
            Ok(wire) => {
                info!(id = %cmd.id, device_id, kind = ?cmd.kind, "dispatching command");
                Ok(Some(Outgoing { command: cmd, wire }))
            }
            Err(BuildError::TemplateMissing { .. })
                if cmd.kind == CommandKind::EnrollUser
                    && self.missing_template == MissingTemplatePolicy::FetchEnrollData =>
            {
                self.queue.record_attempt_failure(
                    &cmd.id,
                    "Build Failed: template missing, requesting it from the device",
                )?;
                let fetch = self
                    .queue
                    .enqueue(&cmd.device_id, &cmd.user_id, cmd.vendor, CommandKind::FetchEnrollData)?
                    .into_command();
                match self.build(&fetch)? {
                    Ok(wire) => {
                        info!(id = %fetch.id, device_id, "dispatching template fetch in place of enroll");
                        Ok(Some(Outgoing {
                            command: fetch,
                            wire,
                        }))
                    }
                    Err(e) => {
                        self.fail_build(&fetch, &e)?;
                        Ok(None)
                    }
                }
            }
            Err(e) => {
                self.fail_build(&cmd, &e)?;
                Ok(None)
            }
        }
    }

    fn build(&self, cmd: &Command) -> Result<Result<WireCommand, BuildError>, StorageError> {
        let user = self.records.get_user(&cmd.user_id)?;
        let template = match cmd.kind {
            CommandKind::EnrollUser => self.blobs.get_template(&cmd.user_id, cmd.vendor)?,
            CommandKind::DeleteUser | CommandKind::FetchEnrollData => None,
        };
        Ok(build_command(cmd, user.as_ref(), template.as_ref()))
    }

    fn fail_build(&self, cmd: &Command, err: &BuildError) -> Result<(), QueueError> {
        warn!(id = %cmd.id, error = %err, "command could not be built");
        self.queue
            .record_attempt_failure(&cmd.id, &format!("Build Failed: {err}"))?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::store::{MemoryBlobStore, MemoryRecordStore, SystemClock};
    use biolink_core::protocol::WireBody;
    use biolink_core::{CommandPolicy, CommandStatus, DeviceUser, EnrollmentBlob, Vendor};

    struct Fixture {
        outbox: Outbox,
        queue: Arc<CommandQueue>,
        records: Arc<MemoryRecordStore>,
        blobs: Arc<MemoryBlobStore>,
    }

    fn fixture(policy: MissingTemplatePolicy) -> Fixture {
        let records = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(CommandQueue::new(
            records.clone(),
            Arc::new(SystemClock),
            CommandPolicy::default(),
            &Span::none(),
        ));
        let outbox = Outbox::new(queue.clone(), records.clone(), blobs.clone(), policy, &Span::none());
        records.upsert_user(DeviceUser::new("42")).unwrap();
        Fixture {
            outbox,
            queue,
            records,
            blobs,
        }
    }

    #[test]
    fn test_empty_queue_yields_nothing() {
        let f = fixture(MissingTemplatePolicy::Fail);

        assert!(f.outbox.next_for("DEV1").unwrap().is_none());
    }

    #[test]
    fn test_enroll_with_template_ships_blob() {
        // Arrange
        let f = fixture(MissingTemplatePolicy::Fail);
        f.blobs
            .put_template("42", &EnrollmentBlob::new(Vendor::Ebkn, vec![1, 2, 3, 4]))
            .unwrap();
        let cmd = f
            .queue
            .enqueue("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser)
            .unwrap()
            .into_command();

        // Act
        let out = f.outbox.next_for("DEV1").unwrap().unwrap();

        // Assert
        assert_eq!(out.command.id, cmd.id);
        assert_eq!(
            out.wire,
            WireCommand::Binary {
                trans_id: cmd.id.clone(),
                cmd_code: "SET_USER_INFO",
                body: WireBody::Blob(vec![1, 2, 3, 4]),
            }
        );
        // Shipping does not count an attempt.
        assert_eq!(f.queue.get(&cmd.id).unwrap().unwrap().attempts, 0);
    }

    #[test]
    fn test_missing_template_fail_policy_records_attempt() {
        // Arrange
        let f = fixture(MissingTemplatePolicy::Fail);
        let cmd = f
            .queue
            .enqueue("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser)
            .unwrap()
            .into_command();

        // Act
        let out = f.outbox.next_for("DEV1").unwrap();

        // Assert
        assert!(out.is_none());
        let after = f.queue.get(&cmd.id).unwrap().unwrap();
        assert_eq!(after.attempts, 1);
        assert!(after.response_log.contains("Build Failed"));
    }

    #[test]
    fn test_missing_template_fail_policy_eventually_fails_command() {
        let f = fixture(MissingTemplatePolicy::Fail);
        let cmd = f
            .queue
            .enqueue("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser)
            .unwrap()
            .into_command();

        for _ in 0..3 {
            f.outbox.next_for("DEV1").unwrap();
        }

        assert_eq!(f.queue.get(&cmd.id).unwrap().unwrap().status, CommandStatus::Failed);
        assert!(f.outbox.next_for("DEV1").unwrap().is_none());
    }

    #[test]
    fn test_missing_template_fetch_policy_ships_fetch_instead() {
        // Arrange
        let f = fixture(MissingTemplatePolicy::FetchEnrollData);
        let enroll = f
            .queue
            .enqueue("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser)
            .unwrap()
            .into_command();

        // Act
        let out = f.outbox.next_for("DEV1").unwrap().unwrap();

        // Assert
        assert_eq!(out.command.kind, CommandKind::FetchEnrollData);
        assert!(matches!(out.wire, WireCommand::Binary { cmd_code: "GET_USER_INFO", .. }));
        assert_eq!(f.queue.get(&enroll.id).unwrap().unwrap().attempts, 1);
        assert_eq!(f.records.pending_commands("DEV1").unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_user_is_build_failure() {
        // Arrange
        let f = fixture(MissingTemplatePolicy::Fail);
        let cmd = f
            .queue
            .enqueue("DEV1", "99", Vendor::ZkTeco, CommandKind::DeleteUser)
            .unwrap()
            .into_command();

        // Act
        let out = f.outbox.next_for("DEV1").unwrap();

        // Assert
        assert!(out.is_none());
        let after = f.queue.get(&cmd.id).unwrap().unwrap();
        assert!(after.response_log.contains("Build Failed: user '99' not found"));
        assert_eq!(after.attempts, 1);
    }
}
