//! Integration tests for state that must survive a gateway restart.
//!
//! Each test builds an [`AppState`] over a temp data directory, drops it,
//! and builds a second one over the same directory, the way a restarted
//! process would.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use biolink_core::{CommandKind, CommandStatus, Device, DeviceUser, Vendor};
use biolink_gateway::application::ebkn::EbknHeaders;
use biolink_gateway::application::hikvision::{
    AcsEventCond, AcsEventPage, HikvisionApi, HikvisionError,
};
use biolink_gateway::application::store::RecordStore;
use biolink_gateway::infrastructure::http::AppState;
use biolink_gateway::infrastructure::storage::config::AppConfig;
use serde_json::Value;
use tracing::Span;
use uuid::Uuid;

/// A REST device that is never reachable.
struct Offline;

#[async_trait]
impl HikvisionApi for Offline {
    async fn search_events(
        &self,
        device: &Device,
        _cond: &AcsEventCond,
    ) -> Result<AcsEventPage, HikvisionError> {
        Err(HikvisionError::NotConfigured(device.id.clone()))
    }

    async fn push_command(
        &self,
        device: &Device,
        _path: &str,
        _body: &Value,
    ) -> Result<String, HikvisionError> {
        Err(HikvisionError::NotConfigured(device.id.clone()))
    }
}

fn config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.data_dir = dir.to_path_buf();
    config
}

fn boot(config: &AppConfig) -> AppState {
    AppState::new(config, Arc::new(Offline), &Span::none())
}

fn headers(pairs: &[(&str, &str)]) -> EbknHeaders {
    EbknHeaders::from_lookup(|name| {
        pairs
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    })
}

#[test]
fn test_block_upload_resumes_after_restart() {
    // Arrange
    let dir = std::env::temp_dir().join(format!("biolink_restart_{}", Uuid::new_v4()));
    let config = config(&dir);
    let mut user = DeviceUser::new("42");
    user.employee = Some("EMP-42".to_string());
    let body = r#"{"user_id":"42","io_time":"20240501081500","io_mode":1}"#.as_bytes();
    let (first, rest) = body.split_at(12);

    // Act
    {
        let state = boot(&config);
        state.records.upsert_user(user).unwrap();
        let reply = state.ebkn.handle(
            &headers(&[("request_code", "realtime_glog"), ("dev_id", "DEV1"), ("blk_no", "1")]),
            first,
        );
        assert_eq!(reply.status, 200);
    }
    let state = boot(&config);
    let reply = state.ebkn.handle(
        &headers(&[("request_code", "realtime_glog"), ("dev_id", "DEV1"), ("blk_no", "0")]),
        rest,
    );

    // Assert
    assert_eq!(reply.status, 200);
    let checkins = state.records.checkins().unwrap();
    assert_eq!(checkins.len(), 1);
    assert_eq!(checkins[0].employee.as_deref(), Some("EMP-42"));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_pending_commands_and_dedup_survive_restart() {
    // Arrange
    let dir = std::env::temp_dir().join(format!("biolink_restart_{}", Uuid::new_v4()));
    let config = config(&dir);
    let id = {
        let state = boot(&config);
        state.records.upsert_user(DeviceUser::new("7")).unwrap();
        state
            .queue
            .enqueue("ZK1", "7", Vendor::ZkTeco, CommandKind::DeleteUser)
            .unwrap()
            .into_command()
            .id
    };

    // Act
    let state = boot(&config);
    let again = state
        .queue
        .enqueue("ZK1", "7", Vendor::ZkTeco, CommandKind::DeleteUser)
        .unwrap();
    let polled = state.zkteco.poll(Some("ZK1"));

    // Assert
    assert!(!again.is_inserted());
    assert_eq!(again.into_command().id, id);
    assert_eq!(polled.body, format!("C:{id}:DATA DELETE USERINFO PIN=7"));
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_unreachable_rest_device_keeps_command_pending() {
    // Arrange
    let dir = std::env::temp_dir().join(format!("biolink_restart_{}", Uuid::new_v4()));
    let state = boot(&config(&dir));
    state.records.upsert_user(DeviceUser::new("9")).unwrap();
    state
        .records
        .upsert_device(Device::new("HK1", Vendor::Hikvision))
        .unwrap();
    let cmd = state
        .queue
        .enqueue("HK1", "9", Vendor::Hikvision, CommandKind::DeleteUser)
        .unwrap()
        .into_command();

    // Act
    let report = state.hikvision.push_all().await.unwrap();

    // Assert
    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 1);
    let after = state.queue.get(&cmd.id).unwrap().unwrap();
    assert_eq!(after.status, CommandStatus::Pending);
    assert_eq!(after.attempts, 1);
    std::fs::remove_dir_all(&dir).ok();
}
