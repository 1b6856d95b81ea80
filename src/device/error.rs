use thiserror::Error;

use super::transport::TransportError;
use crate::wrp::WrpError;

/// Errors surfaced by the device hub.
///
/// Cloneable so the same failure can be handed to a waiting caller and
/// attached to the event that reports it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("missing device name in request context")]
    MissingDeviceName,

    #[error("invalid device name: {0:?}")]
    InvalidDeviceName(String),

    #[error("device limit reached ({limit})")]
    CapacityExceeded { limit: usize },

    #[error("duplicate device id: {0}")]
    DuplicateId(String),

    #[error("device not found")]
    DeviceNotFound,

    #[error("device closed")]
    DeviceClosed,

    #[error("device busy: outbound queue is full")]
    DeviceBusy,

    #[error("transaction already registered: {0}")]
    TransactionAlreadyRegistered(String),

    #[error("no such transaction key: {0}")]
    NoSuchTransactionKey(String),

    #[error("transactions closed")]
    TransactionsClosed,

    #[error("transaction cancelled")]
    TransactionCancelled,

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),

    #[error("unable to create pinger: {0}")]
    Pinger(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wrp(#[from] WrpError),
}
