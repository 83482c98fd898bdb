//! Text vendor command lines.
//!
//! Each line is `C:<line id>:<verb> <table> <tab-separated key=value pairs>`.
//! Enrolling writes the user row and, when a template is on file, the
//! fingerprint row with its base64 text, size and slot.
//!
//! The device answers every line on its own (`ID=<line id>&Return=<code>`).
//! A single-line command uses the command id as its line id; a multi-line
//! command numbers its lines `<command id>-1`, `<command id>-2`, ... so each
//! reply can be matched to its line.  [`split_line_id`] undoes the numbering.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::builders::{BuildError, WireCommand};
use crate::domain::command::{Command, CommandKind};
use crate::domain::user::{DeviceUser, EnrollmentBlob};

pub fn build(
    cmd: &Command,
    user: &DeviceUser,
    template: Option<&EnrollmentBlob>,
) -> Result<WireCommand, BuildError> {
    let id = &cmd.id;
    let pin = &user.user_id;

    let bodies = match cmd.kind {
        CommandKind::EnrollUser => {
            let name = sanitize(user.display_name.as_deref().unwrap_or(pin));
            let mut bodies = vec![format!("DATA UPDATE USERINFO PIN={pin}\tName={name}\tPri=0")];
            if let Some(blob) = template {
                let tmp = BASE64_STANDARD.encode(&blob.bytes);
                bodies.push(format!(
                    "DATA UPDATE FINGERTMP PIN={pin}\tFID={}\tSize={}\tValid=1\tTMP={tmp}",
                    blob.slot,
                    tmp.len()
                ));
            }
            bodies
        }
        CommandKind::DeleteUser => vec![format!("DATA DELETE USERINFO PIN={pin}")],
        CommandKind::FetchEnrollData => vec![format!("DATA QUERY FINGERTMP PIN={pin}")],
    };

    let lines = if bodies.len() == 1 {
        bodies.into_iter().map(|body| format!("C:{id}:{body}")).collect()
    } else {
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, body)| format!("C:{id}-{}:{body}", i + 1))
            .collect()
    };

    Ok(WireCommand::Text { lines })
}

/// Splits a reply's line id into the command id and the 1-based line
/// number, if the id carries one.
///
/// ```
/// use biolink_core::builders::zkteco::split_line_id;
///
/// assert_eq!(split_line_id("abc-2"), ("abc", Some(2)));
/// assert_eq!(split_line_id("abc"), ("abc", None));
/// ```
pub fn split_line_id(raw: &str) -> (&str, Option<u32>) {
    match raw.rsplit_once('-') {
        Some((id, part)) if !id.is_empty() => match part.parse::<u32>() {
            Ok(n) if n > 0 => (id, Some(n)),
            _ => (raw, None),
        },
        _ => (raw, None),
    }
}

/// Tabs and line breaks would split the record on the device.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, '\t' | '\r' | '\n') { ' ' } else { c })
        .collect()
}
