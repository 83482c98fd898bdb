//! HTTP listener: one catch-all handler in front of the vendor adapters.
//!
//! This module is responsible for:
//!
//! 1. Wiring the file-backed stores and use cases into an [`AppState`].
//! 2. Binding the listener and serving every request through
//!    [`dispatch::resolve`], so routing rules live in one tested place.
//! 3. Running the synchronous adapters on Tokio's blocking pool, since the
//!    stores do file I/O under a mutex.
//! 4. Running the housekeeping timer: expired-command sweeps, plus the
//!    scheduled attendance pull and command push for REST-polled devices.
//! 5. Shutting down gracefully when the `running` flag is cleared.
//!
//! # Proxies
//!
//! A reverse proxy that rewrites paths can pass the device's original URI in
//! `X-Original-Request-URI`; routing and query parsing then use that value.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use biolink_core::BlockReassembler;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::application::checkin::CheckinRecorder;
use crate::application::command_queue::{CommandQueue, QueueError};
use crate::application::dispatch::{self, query_param, Resolution, Route};
use crate::application::ebkn::{EbknAdapter, EbknHeaders, EbknReply};
use crate::application::enrollment::EnrollmentSync;
use crate::application::hikvision::{HikvisionApi, HikvisionService, SyncRequest};
use crate::application::outbox::Outbox;
use crate::application::store::{RecordStore, SystemClock};
use crate::application::zkteco::{TextReply, ZkTecoAdapter};
use crate::infrastructure::http::hikvision_client::ReqwestHikvisionClient;
use crate::infrastructure::storage::blobs::FileBlobStore;
use crate::infrastructure::storage::config::{AppConfig, DeviceConfig};
use crate::infrastructure::storage::records::JsonRecordStore;
use crate::infrastructure::storage::sessions::FileSessionStore;

/// Header a rewriting proxy uses to pass the device's original URI.
const ORIGINAL_URI_HEADER: &str = "x-original-request-uri";

/// Housekeeping period when scheduled sync is off.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

// ── Application state ─────────────────────────────────────────────────────────

/// Everything a request handler needs, built once at startup.
pub struct AppState {
    pub ebkn: EbknAdapter,
    pub zkteco: ZkTecoAdapter,
    pub hikvision: HikvisionService,
    pub enrollment: Arc<EnrollmentSync>,
    pub queue: Arc<CommandQueue>,
    pub records: Arc<dyn RecordStore>,
}

impl AppState {
    /// Wires the file-backed stores under `config.storage.data_dir` into the
    /// use cases.  `api` is the outbound client for REST-polled devices.
    pub fn new(config: &AppConfig, api: Arc<dyn HikvisionApi>, parent: &Span) -> Self {
        let data_dir = &config.storage.data_dir;
        let records: Arc<dyn RecordStore> = Arc::new(JsonRecordStore::new(data_dir));
        let blobs = Arc::new(FileBlobStore::new(data_dir));
        let sessions = Arc::new(FileSessionStore::new(data_dir));
        let clock = Arc::new(SystemClock);

        let queue = Arc::new(CommandQueue::new(
            records.clone(),
            clock.clone(),
            config.commands.policy(),
            parent,
        ));
        let outbox = Arc::new(Outbox::new(
            queue.clone(),
            records.clone(),
            blobs.clone(),
            config.commands.missing_template_policy,
            parent,
        ));
        let enrollment = Arc::new(EnrollmentSync::new(
            records.clone(),
            blobs,
            queue.clone(),
            parent,
        ));
        let checkins = Arc::new(CheckinRecorder::new(
            records.clone(),
            config.checkin.record_unknown_employee,
            parent,
        ));

        Self {
            ebkn: EbknAdapter::new(
                BlockReassembler::new(sessions, parent),
                outbox.clone(),
                enrollment.clone(),
                checkins.clone(),
                parent,
            ),
            zkteco: ZkTecoAdapter::new(
                outbox.clone(),
                enrollment.clone(),
                checkins.clone(),
                records.clone(),
                config.text_vendor.clone(),
                parent,
            ),
            hikvision: HikvisionService::new(
                api,
                records.clone(),
                checkins,
                outbox,
                clock,
                config.rest_vendor.clone(),
                parent,
            ),
            enrollment,
            queue,
            records,
        }
    }

    /// Applies the `[[devices]]` entries.  Returns how many were stored.
    ///
    /// # Errors
    ///
    /// [`QueueError`] if a device cannot be stored or its activation
    /// commands cannot be queued.
    pub fn register_devices(&self, devices: &[DeviceConfig]) -> Result<usize, QueueError> {
        for entry in devices {
            let existing = self.records.get_device(&entry.id)?;
            self.enrollment.upsert_device(entry.apply(existing))?;
        }
        Ok(devices.len())
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// The device-facing router: every request goes to one dispatching handler.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

/// Serves `state` on `listener` until `running` is set to `false`.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_for_shutdown(running))
        .await
        .context("HTTP server failed")
}

/// Builds the gateway from `config` and serves it until `running` is set to
/// `false`.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built, a configured device
/// cannot be stored, or the listener cannot be bound.
pub async fn run_server(config: AppConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let root = info_span!("gateway");
    let client = ReqwestHikvisionClient::new(Duration::from_secs(
        config.rest_vendor.request_timeout_secs.max(1),
    ))
    .context("failed to build HTTP client for REST-polled devices")?;
    let state = Arc::new(AppState::new(&config, Arc::new(client), &root));

    let registered = state
        .register_devices(&config.devices)
        .context("failed to register configured devices")?;
    if registered > 0 {
        info!("registered {registered} configured device(s)");
    }

    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!(
        "biolink gateway listening on {addr} (data in {})",
        config.storage.data_dir.display()
    );

    spawn_housekeeping(
        state.clone(),
        config.rest_vendor.scheduled_sync_interval_secs,
        running.clone(),
    );
    serve(listener, state, running).await
}

// ── Handler ───────────────────────────────────────────────────────────────────

async fn handle(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = headers
        .get(ORIGINAL_URI_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uri.to_string());
    debug!(%method, %target, len = body.len(), "request");

    let route = match dispatch::resolve(method.as_str(), &target) {
        Resolution::Route(route) => route,
        Resolution::MethodNotAllowed => {
            return error_json(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }
        Resolution::NotFound => return error_json(StatusCode::NOT_FOUND, "Not found"),
    };

    match route {
        Route::Ebkn => {
            let ebkn_headers = EbknHeaders::from_lookup(|name| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
            blocking(move || ebkn_response(state.ebkn.handle(&ebkn_headers, &body))).await
        }
        Route::ZkHandshake | Route::ZkUpload | Route::ZkPoll | Route::ZkCommandResult => {
            let sn = query_param(&target, "SN");
            let table = query_param(&target, "table");
            blocking(move || {
                let zk = &state.zkteco;
                let sn = sn.as_deref();
                let reply = match route {
                    Route::ZkHandshake => zk.handshake(sn),
                    Route::ZkUpload => zk.upload(sn, table.as_deref(), &body),
                    Route::ZkPoll => zk.poll(sn),
                    _ => zk.command_results(sn, &body),
                };
                text_response(reply)
            })
            .await
        }
        Route::HikvisionSync => hikvision_sync(&state, &body).await,
    }
}

async fn hikvision_sync(state: &AppState, body: &[u8]) -> Response {
    let req: SyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        match serde_json::from_slice(body) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "sync request body is not valid JSON");
                return error_json(StatusCode::BAD_REQUEST, "Invalid JSON body");
            }
        }
    };
    match state.hikvision.sync(&req).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_json(status(e.http_status()), &e.to_string()),
    }
}

/// Runs `f` on the blocking pool.  A panicked handler becomes a 500.
async fn blocking(f: impl FnOnce() -> Response + Send + 'static) -> Response {
    match tokio::task::spawn_blocking(f).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "request handler panicked");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

// ── Response helpers ──────────────────────────────────────────────────────────

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_json(code: StatusCode, message: &str) -> Response {
    (code, Json(json!({ "error": message }))).into_response()
}

fn text_response(reply: TextReply) -> Response {
    (
        status(reply.status),
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        reply.body,
    )
        .into_response()
}

fn ebkn_response(reply: EbknReply) -> Response {
    let content_type = if reply.status == 200 {
        "application/octet-stream"
    } else {
        "application/json"
    };
    let mut response = (status(reply.status), reply.body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    for (name, value) in reply.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "reply header is not valid HTTP; dropped"),
        }
    }
    response
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn wait_for_shutdown(running: Arc<AtomicBool>) {
    let mut tick = tokio::time::interval(Duration::from_millis(200));
    while running.load(Ordering::Relaxed) {
        tick.tick().await;
    }
    info!("shutdown flag set; stopping HTTP server");
}

/// Sweeps expired commands every period.  With `sync_interval_secs > 0` the
/// period is that interval and each tick also pulls attendance from, and
/// pushes pending commands to, every REST-polled device.
fn spawn_housekeeping(state: Arc<AppState>, sync_interval_secs: u64, running: Arc<AtomicBool>) {
    let scheduled_sync = sync_interval_secs > 0;
    let period = if scheduled_sync {
        Duration::from_secs(sync_interval_secs)
    } else {
        SWEEP_INTERVAL
    };
    if scheduled_sync {
        info!("scheduled sync every {sync_interval_secs}s");
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if !running.load(Ordering::Relaxed) {
                break;
            }

            let sweep_state = state.clone();
            let swept = tokio::task::spawn_blocking(move || {
                let closed = sweep_state.queue.sweep_expired()?;
                sweep_state.queue.prune_closed()?;
                Ok::<_, QueueError>(closed)
            })
            .await;
            match swept {
                Ok(Ok(0)) => {}
                Ok(Ok(closed)) => info!("force-closed {closed} expired command(s)"),
                Ok(Err(e)) => error!(error = %e, "command sweep failed"),
                Err(e) => error!(error = %e, "command sweep panicked"),
            }

            if scheduled_sync {
                if let Err(e) = state.hikvision.sync_all().await {
                    error!(error = %e, "scheduled sync failed");
                }
                match state.hikvision.push_all().await {
                    Ok(report) if report.sent + report.failed > 0 => {
                        info!(sent = report.sent, failed = report.failed, "pending commands pushed");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "command push failed"),
                }
            }
        }
        debug!("housekeeping stopped");
    });
}

// ── Tests ─────────────────────────────────────────────────────────────────────
