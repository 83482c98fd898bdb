//! Binary vendor commands.
//!
//! | kind            | `cmd_code`      | body                               |
//! |-----------------|-----------------|------------------------------------|
//! | DeleteUser      | `DELETE_USER`   | framed `{"user_id":"<8 digits>"}`  |
//! | FetchEnrollData | `GET_USER_INFO` | framed `{"user_id":"<8 digits>"}`  |
//! | EnrollUser      | `SET_USER_INFO` | stored template, unwrapped         |

use serde_json::json;

use crate::builders::{BuildError, WireCommand};
use crate::domain::command::{Command, CommandKind};
use crate::domain::user::{DeviceUser, EnrollmentBlob};
use crate::protocol::framing::WireBody;

pub const DELETE_USER: &str = "DELETE_USER";
pub const GET_USER_INFO: &str = "GET_USER_INFO";
pub const SET_USER_INFO: &str = "SET_USER_INFO";

pub fn build(
    cmd: &Command,
    user: &DeviceUser,
    template: Option<&EnrollmentBlob>,
) -> Result<WireCommand, BuildError> {
    let (cmd_code, body) = match cmd.kind {
        CommandKind::DeleteUser => (DELETE_USER, user_id_body(&user.user_id)?),
        CommandKind::FetchEnrollData => (GET_USER_INFO, user_id_body(&user.user_id)?),
        CommandKind::EnrollUser => {
            let blob = template.ok_or_else(|| BuildError::TemplateMissing {
                user_id: user.user_id.clone(),
                vendor: cmd.vendor,
            })?;
            (SET_USER_INFO, WireBody::Blob(blob.bytes.clone()))
        }
    };

    Ok(WireCommand::Binary {
        trans_id: cmd.id.clone(),
        cmd_code,
        body,
    })
}

/// `{"user_id":"00000042"}` as a text body.
fn user_id_body(user_id: &str) -> Result<WireBody, BuildError> {
    let pin: u64 = user_id
        .trim()
        .parse()
        .map_err(|_| BuildError::InvalidUserId(user_id.to_string()))?;
    Ok(WireBody::Text(
        json!({ "user_id": format!("{pin:08}") }).to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::vendor::Vendor;
    use chrono::Utc;

    fn make(kind: CommandKind) -> Command {
        Command::new("DEV1", "42", Vendor::Ebkn, kind, Utc::now())
    }

    #[test]
    fn test_delete_user_pads_pin_to_eight_digits() {
        // Arrange
        let cmd = make(CommandKind::DeleteUser);

        // Act
        let wire = build(&cmd, &DeviceUser::new("42"), None).unwrap();

        // Assert
        assert_eq!(
            wire,
            WireCommand::Binary {
                trans_id: cmd.id.clone(),
                cmd_code: DELETE_USER,
                body: WireBody::Text(r#"{"user_id":"00000042"}"#.to_string()),
            }
        );
    }

    #[test]
    fn test_fetch_enroll_data_uses_get_user_info() {
        let cmd = make(CommandKind::FetchEnrollData);

        let wire = build(&cmd, &DeviceUser::new("0007"), None).unwrap();

        match wire {
            WireCommand::Binary { cmd_code, body, .. } => {
                assert_eq!(cmd_code, GET_USER_INFO);
                assert_eq!(body, WireBody::Text(r#"{"user_id":"00000007"}"#.to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_enroll_ships_template_verbatim() {
        let cmd = make(CommandKind::EnrollUser);
        let blob = EnrollmentBlob::new(Vendor::Ebkn, vec![0x01, 0x02, 0x03, 0x04]);

        let wire = build(&cmd, &DeviceUser::new("42"), Some(&blob)).unwrap();

        match wire {
            WireCommand::Binary { cmd_code, body, .. } => {
                assert_eq!(cmd_code, SET_USER_INFO);
                assert_eq!(body.into_bytes().unwrap(), vec![0x01, 0x02, 0x03, 0x04]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_enroll_without_template_is_template_missing() {
        let cmd = make(CommandKind::EnrollUser);

        let err = build(&cmd, &DeviceUser::new("42"), None).unwrap_err();

        assert_eq!(
            err,
            BuildError::TemplateMissing {
                user_id: "42".to_string(),
                vendor: Vendor::Ebkn
            }
        );
    }

    #[test]
    fn test_non_numeric_pin_is_rejected() {
        let cmd = make(CommandKind::DeleteUser);

        let err = build(&cmd, &DeviceUser::new("abc"), None).unwrap_err();

        assert_eq!(err, BuildError::InvalidUserId("abc".to_string()));
    }
}
