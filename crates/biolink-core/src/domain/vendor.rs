//! Terminal vendor families.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The three wire dialects biolink speaks.
///
/// Every vendor-specific decision (success codes, command builders, request
/// handling) is an exhaustive `match` on this enum, so adding a vendor fails
/// to compile until every site handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    /// Binary block-chunked JSON + blob protocol.
    Ebkn,
    /// Line-oriented text protocol polled by the device.
    ZkTeco,
    /// REST endpoints on the device, polled by the server.
    Hikvision,
}

impl Vendor {
    pub const ALL: [Vendor; 3] = [Vendor::Ebkn, Vendor::ZkTeco, Vendor::Hikvision];

    /// Returns `true` when `code` is this vendor's "command succeeded" reply.
    pub fn is_success_code(self, code: &str) -> bool {
        let code = code.trim();
        match self {
            Vendor::Ebkn => code.eq_ignore_ascii_case("OK"),
            Vendor::ZkTeco => code == "0",
            Vendor::Hikvision => code.eq_ignore_ascii_case("OK") || code == "1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::Ebkn => "ebkn",
            Vendor::ZkTeco => "zk_teco",
            Vendor::Hikvision => "hikvision",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ebkn" => Ok(Vendor::Ebkn),
            "zk_teco" | "zkteco" => Ok(Vendor::ZkTeco),
            "hikvision" => Ok(Vendor::Hikvision),
            other => Err(format!("unknown vendor '{other}'")),
        }
    }
}
