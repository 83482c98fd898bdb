//! CommandQueue: the per-device outbound command queue.
//!
//! Commands are created by enrollment triggers, picked up when the device
//! polls, and closed by the device's acknowledgement, by running out of
//! attempts, or by outliving the force-close window.
//!
//! # Architecture
//!
//! The queue owns no state of its own.  Every operation is one call into the
//! injected [`RecordStore`], whose methods are atomic, plus the lifecycle
//! rules on [`Command`] from `biolink-core`.  Time comes from the injected
//! [`Clock`] so expiry is testable without sleeping.

use std::sync::Arc;

use biolink_core::domain::command::LifecycleError;
use biolink_core::domain::sync::CommandRequest;
use biolink_core::{Command, CommandKind, CommandPolicy, CommandStatus, Vendor};
use thiserror::Error;
use tracing::{info, info_span, warn, Span};

use crate::application::store::{Clock, InsertOutcome, RecordStore, StorageError};

/// Error type for command queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No command with this id exists.
    #[error("command {0} not found")]
    NotFound(String),

    /// The command is already `Success` or `Failed`.
    #[error(transparent)]
    AlreadyClosed(#[from] LifecycleError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outbound command queue shared by all vendor adapters.
pub struct CommandQueue {
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    policy: CommandPolicy,
    span: Span,
}

impl CommandQueue {
    pub fn new(
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        policy: CommandPolicy,
        parent: &Span,
    ) -> Self {
        Self {
            records,
            clock,
            policy,
            span: info_span!(parent: parent, "command_queue"),
        }
    }

    /// Queues a command unless an equivalent pending one exists, in which
    /// case that one is returned as [`InsertOutcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn enqueue(
        &self,
        device_id: &str,
        user_id: &str,
        vendor: Vendor,
        kind: CommandKind,
    ) -> Result<InsertOutcome, QueueError> {
        let _guard = self.span.enter();
        let cmd = Command::new(device_id, user_id, vendor, kind, self.clock.now());
        let outcome = self.records.insert_command_if_absent(cmd)?;
        match &outcome {
            InsertOutcome::Inserted(cmd) => {
                info!(id = %cmd.id, device_id, user_id, %vendor, ?kind, "command queued")
            }
            InsertOutcome::Duplicate(cmd) => {
                info!(id = %cmd.id, device_id, user_id, ?kind, "equivalent command already pending")
            }
        }
        Ok(outcome)
    }

    /// [`CommandQueue::enqueue`] for a planned request.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn enqueue_request(&self, req: &CommandRequest) -> Result<InsertOutcome, QueueError> {
        self.enqueue(&req.device_id, &req.user_id, req.vendor, req.kind)
    }

    /// Oldest pending command for `device_id` by creation time.  Ties keep
    /// insertion order.  Does not modify anything.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn next(&self, device_id: &str) -> Result<Option<Command>, QueueError> {
        Ok(self
            .records
            .pending_commands(device_id)?
            .into_iter()
            .min_by_key(|c| c.created_at))
    }

    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn get(&self, id: &str) -> Result<Option<Command>, QueueError> {
        Ok(self.records.get_command(id)?)
    }

    /// Counts one failed attempt and logs `error`.  The command becomes
    /// `Failed` once it reaches the attempt limit.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`], [`QueueError::AlreadyClosed`] or
    /// [`QueueError::Storage`].
    pub fn record_attempt_failure(&self, id: &str, error: &str) -> Result<Command, QueueError> {
        let _guard = self.span.enter();
        let now = self.clock.now();
        let policy = self.policy;
        let cmd = self.apply(id, |cmd| cmd.record_failure(error, &policy, now))?;
        if cmd.status == CommandStatus::Failed {
            warn!(id, attempts = cmd.attempts, error, "command failed");
        } else {
            info!(id, attempts = cmd.attempts, error, "command attempt failed, will retry");
        }
        Ok(cmd)
    }

    /// Records the device's reply to a command.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`], [`QueueError::AlreadyClosed`] or
    /// [`QueueError::Storage`].
    pub fn record_acknowledgement(
        &self,
        id: &str,
        return_code: &str,
        block: Option<u32>,
    ) -> Result<Command, QueueError> {
        let _guard = self.span.enter();
        let now = self.clock.now();
        let policy = self.policy;
        let cmd = self.apply(id, |cmd| cmd.record_ack(return_code, block, &policy, now))?;
        info!(id, return_code, ?block, status = ?cmd.status, "command acknowledged");
        Ok(cmd)
    }

    /// Marks `id` as just shipped in `parts` separately acknowledged parts.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`], [`QueueError::AlreadyClosed`] or
    /// [`QueueError::Storage`].
    pub fn begin_exchange(&self, id: &str, parts: u32) -> Result<Command, QueueError> {
        self.apply(id, |cmd| cmd.begin_exchange(parts).map(|()| cmd.status))
    }

    /// Records the device's reply to one part of a multi-part command.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`], [`QueueError::AlreadyClosed`] or
    /// [`QueueError::Storage`].
    pub fn record_part_acknowledgement(
        &self,
        id: &str,
        part: u32,
        return_code: &str,
    ) -> Result<Command, QueueError> {
        let _guard = self.span.enter();
        let now = self.clock.now();
        let policy = self.policy;
        let cmd = self.apply(id, |cmd| cmd.record_part_ack(part, return_code, &policy, now))?;
        info!(id, part, return_code, status = ?cmd.status, "command part acknowledged");
        Ok(cmd)
    }

    /// Force-closes every pending command that is past the age window or out
    /// of attempts.  Returns how many were closed.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn sweep_expired(&self) -> Result<usize, QueueError> {
        let _guard = self.span.enter();
        let now = self.clock.now();
        let policy = self.policy;

        let stale: Vec<String> = self
            .records
            .commands()?
            .into_iter()
            .filter(|c| c.is_pending() && (c.is_expired(&policy, now) || c.attempts >= policy.max_attempts))
            .map(|c| c.id)
            .collect();

        let mut closed = 0;
        for id in stale {
            let mut did_close = false;
            self.records
                .modify_command(&id, &mut |c| did_close = c.enforce_limits(&policy, now))?;
            if did_close {
                info!(id = %id, "command force-closed");
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Moves commands that closed more than one force-close window ago out
    /// of the live set.  Returns how many went.
    ///
    /// # Errors
    ///
    /// [`QueueError::Storage`] if the record store fails.
    pub fn prune_closed(&self) -> Result<usize, QueueError> {
        let _guard = self.span.enter();
        let cutoff = self.clock.now() - self.policy.force_close_after;
        let pruned = self.records.prune_closed_commands(cutoff)?;
        if pruned > 0 {
            info!(pruned, "closed commands archived");
        }
        Ok(pruned)
    }

    fn apply(
        &self,
        id: &str,
        mut op: impl FnMut(&mut Command) -> Result<CommandStatus, LifecycleError>,
    ) -> Result<Command, QueueError> {
        let mut outcome = None;
        let updated = self
            .records
            .modify_command(id, &mut |cmd| outcome = Some(op(cmd)))?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        match outcome {
            Some(Err(e)) => Err(e.into()),
            _ => Ok(updated),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
