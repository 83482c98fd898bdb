//! Gateway-wide error taxonomy.
//!
//! | Variant     | Cause                                   | Device sees |
//! |-------------|-----------------------------------------|-------------|
//! | `Protocol`  | malformed or out-of-sequence input      | 400         |
//! | `Build`     | command payload could not be built      | 422         |
//! | `Storage`   | a durable store is unavailable          | 500         |
//! | `NotFound`  | referenced user/command/device missing  | 404         |
//!
//! Adapters convert every failure into one of these at their boundary and
//! then into a vendor-specific negative acknowledgement, so nothing escapes
//! to the HTTP layer as a panic or a dropped connection.

use biolink_core::protocol::ReassemblyError;
use biolink_core::{BuildError, ProtocolError};
use thiserror::Error;

use crate::application::command_queue::QueueError;
use crate::application::store::StorageError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0} not found")]
    NotFound(String),
}

impl GatewayError {
    /// HTTP status used when this error reaches a device.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Protocol(_) => 400,
            GatewayError::Build(_) => 422,
            GatewayError::Storage(_) => 500,
            GatewayError::NotFound(_) => 404,
        }
    }
}

impl From<QueueError> for GatewayError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => GatewayError::NotFound(format!("command {id}")),
            QueueError::AlreadyClosed(e) => GatewayError::NotFound(format!("open {e}")),
            QueueError::Storage(e) => GatewayError::Storage(e),
        }
    }
}

impl From<ReassemblyError> for GatewayError {
    fn from(err: ReassemblyError) -> Self {
        match err {
            ReassemblyError::Protocol(e) => GatewayError::Protocol(e),
            ReassemblyError::Storage(e) => GatewayError::Storage(e.into()),
        }
    }
}
