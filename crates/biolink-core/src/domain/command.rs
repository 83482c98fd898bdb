//! Outbound command entity.
//!
//! A [`Command`] is one instruction queued for a single device: enroll a user,
//! delete a user, or ask the device to upload a user's template.  The device
//! picks it up on its next poll.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!            ┌──────── ack OK (unchunked) ───────► Success
//!  Pending ──┤
//!     ▲  │   └── attempts ≥ max  or  age ≥ window ─► Failed
//!     └──┘
//!  failure below max / chunked ack
//! ```
//!
//! `Success` and `Failed` are terminal.  A terminal command is never
//! reopened: every mutating method returns [`LifecycleError::AlreadyClosed`]
//! instead, and callers create a fresh command when the work must be redone.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::vendor::Vendor;

/// Timestamp layout used in the response log.
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What the device is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    EnrollUser,
    DeleteUser,
    FetchEnrollData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Success,
    Failed,
}

/// Retry and expiry limits applied to every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPolicy {
    /// A command fails once its attempt count reaches this value.
    pub max_attempts: u32,
    /// A pending command older than this is force-closed as failed.
    pub force_close_after: Duration,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            force_close_after: Duration::days(3),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("command {0} is already closed")]
    AlreadyClosed(String),
}

/// One queued instruction for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Stable identifier; doubles as the wire transaction id.
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub vendor: Vendor,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Last block the device acknowledged during a chunked exchange.
    pub last_block: Option<u32>,
    /// Free-text log, one timestamped line per device response or failure.
    pub response_log: String,
    /// Parts shipped in the current multi-part exchange (one per text line),
    /// 0 when the command has never been shipped in parts.
    #[serde(default)]
    pub parts: u32,
    /// Parts of the current exchange the device confirmed with success.
    #[serde(default)]
    pub acked_parts: Vec<u32>,
    /// The current exchange has already counted its failed attempt.
    #[serde(default)]
    pub exchange_failed: bool,
}

impl Command {
    /// Creates a new pending command.
    pub fn new(
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        vendor: Vendor,
        kind: CommandKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            device_id: device_id.into(),
            user_id: user_id.into(),
            vendor,
            kind,
            status: CommandStatus::Pending,
            attempts: 0,
            created_at: now,
            closed_at: None,
            last_block: None,
            response_log: String::new(),
            parts: 0,
            acked_parts: Vec::new(),
            exchange_failed: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == CommandStatus::Pending
    }

    /// Returns `true` if this is a pending command for the same
    /// (device, user, vendor, kind) tuple, i.e. a duplicate of a new request.
    pub fn is_pending_duplicate_of(
        &self,
        device_id: &str,
        user_id: &str,
        vendor: Vendor,
        kind: CommandKind,
    ) -> bool {
        self.is_pending()
            && self.device_id == device_id
            && self.user_id == user_id
            && self.vendor == vendor
            && self.kind == kind
    }

    /// A pending command is expired at or after `created_at + force_close_after`.
    pub fn is_expired(&self, policy: &CommandPolicy, now: DateTime<Utc>) -> bool {
        self.is_pending() && now - self.created_at >= policy.force_close_after
    }

    /// Counts one failed attempt.  Closes the command as `Failed` once the
    /// attempt count reaches `policy.max_attempts`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::AlreadyClosed`] if the command is terminal.
    pub fn record_failure(
        &mut self,
        reason: &str,
        policy: &CommandPolicy,
        now: DateTime<Utc>,
    ) -> Result<CommandStatus, LifecycleError> {
        self.ensure_open()?;
        self.attempts += 1;
        self.append_log(now, &format!("Failed: {reason}"));
        if self.attempts >= policy.max_attempts {
            self.close(CommandStatus::Failed, now);
        }
        Ok(self.status)
    }

    /// Records a device reply.
    ///
    /// A success code with a block index keeps the command pending (more
    /// chunks follow); a success code without one closes it as `Success`.
    /// Any other code counts as a failed attempt.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::AlreadyClosed`] if the command is terminal.
    pub fn record_ack(
        &mut self,
        return_code: &str,
        block: Option<u32>,
        policy: &CommandPolicy,
        now: DateTime<Utc>,
    ) -> Result<CommandStatus, LifecycleError> {
        self.ensure_open()?;
        self.append_log(now, return_code);

        if !self.vendor.is_success_code(return_code) {
            return self.record_failure(
                &format!("device returned '{return_code}'"),
                policy,
                now,
            );
        }

        match block {
            Some(blk) => self.last_block = Some(blk),
            None => self.close(CommandStatus::Success, now),
        }
        Ok(self.status)
    }

    /// Starts a new multi-part exchange: the command was just shipped as
    /// `parts` separately acknowledged parts.  Results of any earlier
    /// exchange are forgotten.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::AlreadyClosed`] if the command is terminal.
    pub fn begin_exchange(&mut self, parts: u32) -> Result<(), LifecycleError> {
        self.ensure_open()?;
        self.parts = parts;
        self.acked_parts.clear();
        self.exchange_failed = false;
        Ok(())
    }

    /// Records the device's reply to part `part` of the current exchange.
    ///
    /// The command closes as `Success` only once every part has answered
    /// with a success code and none failed.  The first failing part counts
    /// one failed attempt; further failures in the same exchange are logged
    /// only.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::AlreadyClosed`] if the command is terminal.
    pub fn record_part_ack(
        &mut self,
        part: u32,
        return_code: &str,
        policy: &CommandPolicy,
        now: DateTime<Utc>,
    ) -> Result<CommandStatus, LifecycleError> {
        self.ensure_open()?;
        self.append_log(now, &format!("part {part}/{}: {return_code}", self.parts));

        if !self.vendor.is_success_code(return_code) {
            if self.exchange_failed {
                return Ok(self.status);
            }
            self.exchange_failed = true;
            return self.record_failure(
                &format!("part {part} returned '{return_code}'"),
                policy,
                now,
            );
        }

        if (1..=self.parts).contains(&part) && !self.acked_parts.contains(&part) {
            self.acked_parts.push(part);
        }
        if !self.exchange_failed && self.parts > 0 && self.acked_parts.len() as u32 == self.parts {
            self.close(CommandStatus::Success, now);
        }
        Ok(self.status)
    }

    /// Closes the command as `Failed` if it has outlived the force-close
    /// window or already used up its attempts.  Returns `true` if it closed.
    pub fn enforce_limits(&mut self, policy: &CommandPolicy, now: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        if self.is_expired(policy, now) {
            self.append_log(
                now,
                &format!(
                    "Force closed after {} day(s) pending",
                    policy.force_close_after.num_days()
                ),
            );
            self.close(CommandStatus::Failed, now);
            return true;
        }
        if self.attempts >= policy.max_attempts {
            self.close(CommandStatus::Failed, now);
            return true;
        }
        false
    }

    fn ensure_open(&self) -> Result<(), LifecycleError> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(LifecycleError::AlreadyClosed(self.id.clone()))
        }
    }

    fn close(&mut self, status: CommandStatus, now: DateTime<Utc>) {
        self.status = status;
        self.closed_at = Some(now);
    }

    fn append_log(&mut self, now: DateTime<Utc>, line: &str) {
        if !self.response_log.is_empty() {
            self.response_log.push('\n');
        }
        self.response_log
            .push_str(&format!("[{}] {}", now.format(LOG_TIME_FORMAT), line));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn make_command() -> Command {
        Command::new("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser, t0())
    }

    #[test]
    fn test_new_command_is_pending_with_no_attempts() {
        let cmd = make_command();

        assert_eq!(cmd.status, CommandStatus::Pending);
        assert_eq!(cmd.attempts, 0);
        assert!(cmd.closed_at.is_none());
        assert_eq!(cmd.id.len(), 32);
    }

    #[test]
    fn test_failure_below_max_stays_pending() {
        // Arrange
        let policy = CommandPolicy::default();
        let mut cmd = make_command();

        // Act – max is 3; two failures leave it pending
        cmd.record_failure("boom", &policy, t0()).unwrap();
        let status = cmd.record_failure("boom", &policy, t0()).unwrap();

        // Assert
        assert_eq!(status, CommandStatus::Pending);
        assert_eq!(cmd.attempts, 2);
        assert!(cmd.closed_at.is_none());
    }

    #[test]
    fn test_failure_reaching_max_closes_as_failed() {
        // Arrange
        let policy = CommandPolicy::default();
        let mut cmd = make_command();
        cmd.attempts = policy.max_attempts - 1;

        // Act
        let status = cmd.record_failure("Build Failed: no template", &policy, t0()).unwrap();

        // Assert
        assert_eq!(status, CommandStatus::Failed);
        assert_eq!(cmd.closed_at, Some(t0()));
        assert!(cmd.response_log.contains("Build Failed: no template"));
    }

    fn make_text_command(parts: u32) -> Command {
        let mut cmd = Command::new("ZK1", "42", Vendor::ZkTeco, CommandKind::EnrollUser, t0());
        cmd.begin_exchange(parts).unwrap();
        cmd
    }

    #[test]
    fn test_all_parts_ok_closes_as_success() {
        // Arrange
        let policy = CommandPolicy::default();
        let mut cmd = make_text_command(2);

        // Act
        let first = cmd.record_part_ack(1, "0", &policy, t0()).unwrap();
        let second = cmd.record_part_ack(2, "0", &policy, t0()).unwrap();

        // Assert
        assert_eq!(first, CommandStatus::Pending);
        assert_eq!(second, CommandStatus::Success);
        assert_eq!(cmd.attempts, 0);
    }

    #[test]
    fn test_ok_then_failed_part_is_a_failed_attempt() {
        // Arrange
        let policy = CommandPolicy::default();
        let mut cmd = make_text_command(2);

        // Act
        cmd.record_part_ack(1, "0", &policy, t0()).unwrap();
        let status = cmd.record_part_ack(2, "-1002", &policy, t0()).unwrap();

        // Assert
        assert_eq!(status, CommandStatus::Pending);
        assert_eq!(cmd.attempts, 1);
        assert!(cmd.response_log.contains("part 2/2: -1002"));
    }

    #[test]
    fn test_failed_then_ok_part_does_not_close_as_success() {
        // Arrange
        let policy = CommandPolicy::default();
        let mut cmd = make_text_command(2);

        // Act
        cmd.record_part_ack(1, "-1", &policy, t0()).unwrap();
        let status = cmd.record_part_ack(2, "0", &policy, t0()).unwrap();

        // Assert
        assert_eq!(status, CommandStatus::Pending);
        assert_eq!(cmd.attempts, 1);
    }

    #[test]
    fn test_exchange_counts_at_most_one_failed_attempt() {
        let policy = CommandPolicy::default();
        let mut cmd = make_text_command(2);

        cmd.record_part_ack(1, "-1", &policy, t0()).unwrap();
        cmd.record_part_ack(2, "-1", &policy, t0()).unwrap();

        assert_eq!(cmd.attempts, 1);
        assert_eq!(cmd.response_log.lines().count(), 3);
    }

    #[test]
    fn test_new_exchange_forgets_earlier_results() {
        // Arrange – first exchange: part 1 fails, part 2 succeeds
        let policy = CommandPolicy::default();
        let mut cmd = make_text_command(2);
        cmd.record_part_ack(1, "-1", &policy, t0()).unwrap();
        cmd.record_part_ack(2, "0", &policy, t0()).unwrap();

        // Act – reshipped; both parts succeed
        cmd.begin_exchange(2).unwrap();
        cmd.record_part_ack(1, "0", &policy, t0()).unwrap();
        let status = cmd.record_part_ack(2, "0", &policy, t0()).unwrap();

        // Assert
        assert_eq!(status, CommandStatus::Success);
        assert_eq!(cmd.attempts, 1);
    }

    #[test]
    fn test_unchunked_success_ack_closes_as_success() {
        let policy = CommandPolicy::default();
        let mut cmd = make_command();

        let status = cmd.record_ack("OK", None, &policy, t0()).unwrap();

        assert_eq!(status, CommandStatus::Success);
        assert_eq!(cmd.closed_at, Some(t0()));
        assert_eq!(cmd.response_log, "[2024-03-01 08:00:00] OK");
    }

    #[test]
    fn test_chunked_success_ack_records_block_and_stays_pending() {
        let policy = CommandPolicy::default();
        let mut cmd = make_command();

        let status = cmd.record_ack("OK", Some(2), &policy, t0()).unwrap();

        assert_eq!(status, CommandStatus::Pending);
        assert_eq!(cmd.last_block, Some(2));
        assert_eq!(cmd.attempts, 0);
    }

    #[test]
    fn test_error_ack_counts_as_failure() {
        let policy = CommandPolicy::default();
        let mut cmd = make_command();

        let status = cmd.record_ack("ERROR", None, &policy, t0()).unwrap();

        assert_eq!(status, CommandStatus::Pending);
        assert_eq!(cmd.attempts, 1);
        assert_eq!(cmd.response_log.lines().count(), 2);
    }

    #[test]
    fn test_closed_command_is_never_reopened() {
        // Arrange
        let policy = CommandPolicy::default();
        let mut cmd = make_command();
        cmd.record_ack("OK", None, &policy, t0()).unwrap();

        // Act
        let ack = cmd.record_ack("OK", Some(3), &policy, t0());
        let fail = cmd.record_failure("late", &policy, t0());

        // Assert
        assert_eq!(ack, Err(LifecycleError::AlreadyClosed(cmd.id.clone())));
        assert!(fail.is_err());
        assert_eq!(cmd.status, CommandStatus::Success);
        assert_eq!(cmd.last_block, None);
    }

    #[test]
    fn test_expiry_at_window_boundary_even_with_zero_attempts() {
        // Arrange
        let policy = CommandPolicy::default();
        let mut cmd = make_command();
        let just_before = t0() + Duration::days(3) - Duration::seconds(1);
        let at_window = t0() + Duration::days(3);

        // Act / Assert
        assert!(!cmd.enforce_limits(&policy, just_before));
        assert_eq!(cmd.status, CommandStatus::Pending);

        assert!(cmd.enforce_limits(&policy, at_window));
        assert_eq!(cmd.status, CommandStatus::Failed);
        assert_eq!(cmd.closed_at, Some(at_window));
        assert_eq!(cmd.attempts, 0);
    }

    #[test]
    fn test_enforce_limits_closes_exhausted_command() {
        let policy = CommandPolicy {
            max_attempts: 2,
            ..CommandPolicy::default()
        };
        let mut cmd = make_command();
        cmd.attempts = 2;

        assert!(cmd.enforce_limits(&policy, t0()));
        assert_eq!(cmd.status, CommandStatus::Failed);
    }

    #[test]
    fn test_pending_duplicate_matches_all_four_fields() {
        let cmd = make_command();

        assert!(cmd.is_pending_duplicate_of("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser));
        assert!(!cmd.is_pending_duplicate_of("DEV2", "42", Vendor::Ebkn, CommandKind::EnrollUser));
        assert!(!cmd.is_pending_duplicate_of("DEV1", "42", Vendor::ZkTeco, CommandKind::EnrollUser));
        assert!(!cmd.is_pending_duplicate_of("DEV1", "42", Vendor::Ebkn, CommandKind::DeleteUser));
    }
}
