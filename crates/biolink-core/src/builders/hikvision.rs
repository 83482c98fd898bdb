//! REST vendor command bodies.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};

use crate::builders::{BuildError, WireCommand};
use crate::domain::command::{Command, CommandKind};
use crate::domain::user::{DeviceUser, EnrollmentBlob};

pub const ENROLL_PATH: &str = "/ISAPI/AccessControl/UserInfo/SetUp?format=json";
pub const DELETE_PATH: &str = "/ISAPI/AccessControl/UserInfoDetail/Delete?format=json";

/// Attendance is pulled by the server, and templates never travel back from
/// these devices, so `FetchEnrollData` has no REST counterpart.
pub fn build(
    cmd: &Command,
    user: &DeviceUser,
    template: Option<&EnrollmentBlob>,
) -> Result<WireCommand, BuildError> {
    match cmd.kind {
        CommandKind::EnrollUser => {
            let mut body = Map::new();
            body.insert("operation".into(), json!("enrollUser"));
            body.insert("employeeNo".into(), json!(user.user_id));
            body.insert(
                "name".into(),
                json!(user.display_name.as_deref().unwrap_or(&user.user_id)),
            );
            if let Some(blob) = template {
                body.insert("template".into(), json!(BASE64_STANDARD.encode(&blob.bytes)));
            }
            Ok(WireCommand::Json {
                path: ENROLL_PATH,
                body: Value::Object(body),
            })
        }
        CommandKind::DeleteUser => Ok(WireCommand::Json {
            path: DELETE_PATH,
            body: json!({ "operation": "deleteUser", "employeeNo": user.user_id }),
        }),
        CommandKind::FetchEnrollData => Err(BuildError::UnsupportedCommandKind {
            vendor: cmd.vendor,
            kind: cmd.kind,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::vendor::Vendor;
    use chrono::Utc;

    fn make(kind: CommandKind) -> Command {
        Command::new("HK1", "42", Vendor::Hikvision, kind, Utc::now())
    }

    #[test]
    fn test_enroll_carries_name_and_base64_template() {
        // Arrange
        let mut user = DeviceUser::new("42");
        user.display_name = Some("Ada".to_string());
        let blob = EnrollmentBlob::new(Vendor::Hikvision, vec![0xde, 0xad]);

        // Act
        let wire = build(&make(CommandKind::EnrollUser), &user, Some(&blob)).unwrap();

        // Assert
        assert_eq!(
            wire,
            WireCommand::Json {
                path: ENROLL_PATH,
                body: json!({
                    "operation": "enrollUser",
                    "employeeNo": "42",
                    "name": "Ada",
                    "template": "3q0="
                }),
            }
        );
    }

    #[test]
    fn test_delete_body_names_operation_and_employee() {
        let wire = build(&make(CommandKind::DeleteUser), &DeviceUser::new("42"), None).unwrap();

        assert_eq!(
            wire,
            WireCommand::Json {
                path: DELETE_PATH,
                body: json!({"operation": "deleteUser", "employeeNo": "42"}),
            }
        );
    }

    #[test]
    fn test_fetch_enroll_data_is_unsupported() {
        let err = build(&make(CommandKind::FetchEnrollData), &DeviceUser::new("42"), None)
            .unwrap_err();

        assert_eq!(
            err,
            BuildError::UnsupportedCommandKind {
                vendor: Vendor::Hikvision,
                kind: CommandKind::FetchEnrollData
            }
        );
    }
}
