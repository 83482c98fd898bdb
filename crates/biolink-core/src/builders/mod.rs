//! Per-vendor command builders.
//!
//! A builder is a pure function from a queued [`Command`], the user it
//! targets and (optionally) that user's stored template to the exact payload
//! the vendor's firmware expects.  Nothing here touches storage; the caller
//! loads the user and template first.
//!
//! [`build_command`] picks the builder with an exhaustive `match` on
//! [`Vendor`].

pub mod ebkn;
pub mod hikvision;
pub mod zkteco;

use serde_json::Value;
use thiserror::Error;

use crate::domain::command::{Command, CommandKind};
use crate::domain::user::{DeviceUser, EnrollmentBlob};
use crate::domain::vendor::Vendor;
use crate::protocol::framing::WireBody;

/// Why a command payload could not be built.
///
/// Build errors count as a failed attempt against the command; they never
/// reach the device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("user '{0}' not found")]
    UserNotFound(String),

    /// No template for `vendor` is on file.  The caller decides whether to
    /// fail the command or ask a device for the template first.
    #[error("no {vendor} template on file for user '{user_id}'")]
    TemplateMissing { user_id: String, vendor: Vendor },

    #[error("{kind:?} is not supported for {vendor} devices")]
    UnsupportedCommandKind { vendor: Vendor, kind: CommandKind },

    /// The binary vendor needs a numeric PIN.
    #[error("user id '{0}' is not numeric")]
    InvalidUserId(String),
}

/// A fully built command, ready to hand to the vendor transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireCommand {
    /// Binary vendor: reply body plus `trans_id` / `cmd_code` headers.
    Binary {
        trans_id: String,
        cmd_code: &'static str,
        body: WireBody,
    },
    /// Text vendor: one or more `C:<id>:…` lines.
    Text { lines: Vec<String> },
    /// REST vendor: JSON body POSTed to `path` on the device.
    Json { path: &'static str, body: Value },
}

/// Builds the payload for `cmd`.
///
/// # Errors
///
/// [`BuildError::UserNotFound`] when `user` is `None`; otherwise whatever
/// the vendor builder reports.
pub fn build_command(
    cmd: &Command,
    user: Option<&DeviceUser>,
    template: Option<&EnrollmentBlob>,
) -> Result<WireCommand, BuildError> {
    let user = user.ok_or_else(|| BuildError::UserNotFound(cmd.user_id.clone()))?;
    // A template stored for another vendor is useless here.
    let template = template.filter(|t| t.vendor == cmd.vendor);

    match cmd.vendor {
        Vendor::Ebkn => ebkn::build(cmd, user, template),
        Vendor::ZkTeco => zkteco::build(cmd, user, template),
        Vendor::Hikvision => hikvision::build(cmd, user, template),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_missing_user_is_reported_for_every_vendor() {
        for vendor in Vendor::ALL {
            let cmd = Command::new("DEV1", "42", vendor, CommandKind::DeleteUser, Utc::now());

            let err = build_command(&cmd, None, None).unwrap_err();

            assert_eq!(err, BuildError::UserNotFound("42".to_string()));
        }
    }

    #[test]
    fn test_template_for_other_vendor_is_ignored() {
        // Arrange
        let cmd = Command::new("DEV1", "42", Vendor::Ebkn, CommandKind::EnrollUser, Utc::now());
        let user = DeviceUser::new("42");
        let zk_template = EnrollmentBlob::new(Vendor::ZkTeco, vec![1, 2, 3]);

        // Act
        let err = build_command(&cmd, Some(&user), Some(&zk_template)).unwrap_err();

        // Assert
        assert!(matches!(err, BuildError::TemplateMissing { vendor: Vendor::Ebkn, .. }));
    }
}
