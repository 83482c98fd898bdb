//! Request dispatcher: method + path → [`Route`].
//!
//! | Method     | Path                  | Route              |
//! |------------|-----------------------|--------------------|
//! | POST       | `/ebkn`               | `Ebkn`             |
//! | GET        | `/iclock/cdata`       | `ZkHandshake`      |
//! | POST       | `/iclock/cdata`       | `ZkUpload`         |
//! | GET / POST | `/iclock/getrequest`  | `ZkPoll`           |
//! | GET / POST | `/iclock/devicecmd`   | `ZkCommandResult`  |
//! | POST       | `/hikvision/sync`     | `HikvisionSync`    |
//!
//! Any other method on `/ebkn` is 405; anything else is 404.

/// Every endpoint the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Ebkn,
    ZkHandshake,
    ZkUpload,
    ZkPoll,
    ZkCommandResult,
    HikvisionSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Route(Route),
    MethodNotAllowed,
    NotFound,
}

/// Resolves a request.  `path` may be an absolute URI and may carry a query
/// string; `method` is matched case-insensitively.
pub fn resolve(method: &str, path: &str) -> Resolution {
    let method = method.to_ascii_uppercase();
    let path = normalize_path(path);

    match (method.as_str(), path.as_str()) {
        ("POST", "/ebkn") => Resolution::Route(Route::Ebkn),
        (_, "/ebkn") => Resolution::MethodNotAllowed,
        ("GET", "/iclock/cdata") => Resolution::Route(Route::ZkHandshake),
        ("POST", "/iclock/cdata") => Resolution::Route(Route::ZkUpload),
        ("GET" | "POST", "/iclock/getrequest") => Resolution::Route(Route::ZkPoll),
        ("GET" | "POST", "/iclock/devicecmd") => Resolution::Route(Route::ZkCommandResult),
        ("POST", "/hikvision/sync") => Resolution::Route(Route::HikvisionSync),
        _ => Resolution::NotFound,
    }
}

/// `http://host:8998/iclock/cdata/?SN=1` → `/iclock/cdata`.
pub fn normalize_path(raw: &str) -> String {
    let raw = raw.trim();
    let without_scheme = match raw.find("://") {
        Some(i) => {
            let rest = &raw[i + 3..];
            rest.find('/').map(|j| &rest[j..]).unwrap_or("/")
        }
        None => raw,
    };
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// First value of query parameter `name` in `raw` (a path or absolute
/// URI).  `+` and `%XX` escapes are decoded.
pub fn query_param(raw: &str, name: &str) -> Option<String> {
    let query = raw.split('#').next()?.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| match pair.split_once('=') {
            Some((k, v)) => Some((k, v)),
            None if !pair.is_empty() => Some((pair, "")),
            None => None,
        })
        .find(|(k, _)| percent_decode(k) == name)
        .map(|(_, v)| percent_decode(v))
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
