//! `reqwest`-backed [`HikvisionApi`].
//!
//! Every call is first sent without credentials.  A `401` answer names the
//! scheme the device wants in `WWW-Authenticate`: a `Digest` challenge is
//! answered with an MD5 digest response, anything else falls back to HTTP
//! basic auth.  Either way the request is resent once with the device
//! record's credentials.  Devices answer ISAPI JSON:
//!
//! ```text
//! POST http://<ip>/ISAPI/AccessControl/AcsEvent?format=json
//!   {"AcsEventCond": {...}}
//! ← {"AcsEvent": {"totalMatches": 3, "InfoList": [...]}}
//!
//! POST http://<ip><command path>
//!   {...command body...}
//! ← {"statusCode": 1, "statusString": "OK"}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use biolink_core::Device;
use digest_auth::AuthContext;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::application::hikvision::{AcsEventCond, AcsEventPage, HikvisionApi, HikvisionError};

const EVENT_SEARCH_PATH: &str = "/ISAPI/AccessControl/AcsEvent?format=json";

#[derive(Debug, Deserialize)]
struct EventSearchResponse {
    #[serde(rename = "AcsEvent", default)]
    acs_event: AcsEventPage,
}

pub struct ReqwestHikvisionClient {
    client: Client,
}

impl ReqwestHikvisionClient {
    /// Builds a client whose every request gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    fn request(&self, url: &str, body: &[u8]) -> RequestBuilder {
        self.client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
    }

    /// POSTs `body` as JSON, answering one auth challenge if the device
    /// sends one.  Fails on any non-2xx final status.
    async fn post_json(
        &self,
        device: &Device,
        path: &str,
        body: &Value,
    ) -> Result<Response, HikvisionError> {
        let url = device_url(device, path)?;
        let body = serde_json::to_vec(body).map_err(|e| HikvisionError::Decode(e.to_string()))?;
        debug!(device_id = %device.id, %url, "calling device");

        let mut response = self.request(&url, &body).send().await.map_err(transport)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let username = device.username.as_deref().unwrap_or_default();
            let password = device.password.as_deref().unwrap_or_default();
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let retry = match challenge {
                Some(challenge) if is_digest(&challenge) => {
                    debug!(device_id = %device.id, "answering digest challenge");
                    let authorization =
                        digest_authorization(&challenge, username, password, path, &body)?;
                    self.request(&url, &body).header(AUTHORIZATION, authorization)
                }
                _ => self
                    .request(&url, &body)
                    .basic_auth(username, Some(password)),
            };
            response = retry.send().await.map_err(transport)?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(HikvisionError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl HikvisionApi for ReqwestHikvisionClient {
    async fn search_events(
        &self,
        device: &Device,
        cond: &AcsEventCond,
    ) -> Result<AcsEventPage, HikvisionError> {
        let response = self
            .post_json(device, EVENT_SEARCH_PATH, &json!({ "AcsEventCond": cond }))
            .await?;
        let body: EventSearchResponse = response
            .json()
            .await
            .map_err(|e| HikvisionError::Decode(e.to_string()))?;
        Ok(body.acs_event)
    }

    async fn push_command(
        &self,
        device: &Device,
        path: &str,
        body: &Value,
    ) -> Result<String, HikvisionError> {
        let response = self.post_json(device, path, body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| HikvisionError::Decode(e.to_string()))?;
        Ok(status_code_text(&text))
    }
}

fn transport(e: reqwest::Error) -> HikvisionError {
    HikvisionError::Transport(e.to_string())
}

fn is_digest(challenge: &str) -> bool {
    challenge
        .trim_start()
        .get(..6)
        .map_or(false, |scheme| scheme.eq_ignore_ascii_case("digest"))
}

/// The `Authorization` value answering a `Digest` challenge for a POST of
/// `body` to `uri`.
fn digest_authorization(
    challenge: &str,
    username: &str,
    password: &str,
    uri: &str,
    body: &[u8],
) -> Result<String, HikvisionError> {
    let mut prompt =
        digest_auth::parse(challenge).map_err(|e| HikvisionError::Auth(e.to_string()))?;
    let context = AuthContext::new_post(username, password, uri, Some(body));
    let answer = prompt
        .respond(&context)
        .map_err(|e| HikvisionError::Auth(e.to_string()))?;
    Ok(answer.to_header_string())
}

/// `http://<ip><path>`; an `ip` that already names a scheme is used as is.
fn device_url(device: &Device, path: &str) -> Result<String, HikvisionError> {
    let host = device
        .ip
        .as_deref()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| HikvisionError::NotConfigured(device.id.clone()))?;
    let base = if host.contains("://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", host.trim_end_matches('/'))
    };
    Ok(format!("{base}{path}"))
}

/// Pulls the device's status out of a 2xx reply.  An empty or non-JSON body
/// counts as `OK`.
fn status_code_text(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return "OK".to_string();
    };
    match (value.get("statusCode"), value.get("statusString")) {
        (Some(Value::Number(n)), _) => n.to_string(),
        (Some(Value::String(s)), _) => s.clone(),
        (_, Some(Value::String(s))) => s.clone(),
        _ => "OK".to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
