//! Driver boundaries for the two BLE roles
//!
//! The relay core never touches radio hardware directly. It talks to two
//! trait objects:
//!
//! - **CentralDriver**: the central-role link to the real target. Connecting
//!   yields an event stream carrying target-originated notifications and the
//!   link-loss signal.
//! - **PeripheralDriver**: the local peripheral-role publication toward the
//!   victim. Publishing yields a request queue: the driver posts each incoming
//!   read/write as a [`PeripheralRequest`] carrying a oneshot completion
//!   channel, decoupling driver-thread execution from relay logic.
//!
//! Platform adapters implement these traits; the core stays testable with
//! in-process fakes.

pub mod capability;

use crate::gatt::{AdvertisementPayload, MirrorDefinition, ServiceDescriptor};
use crate::relay::ForwardError;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub use capability::{PlatformCapability, StaticCapability};

/// Errors reported by a central-role driver
#[derive(Error, Debug, Clone)]
pub enum CentralError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("Read failed: {0}")]
    ReadFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),
}

/// Errors reported by a peripheral-role driver
#[derive(Error, Debug, Clone)]
pub enum PeripheralError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    #[error("Advertise failed: {0}")]
    AdvertiseFailed(String),
    #[error("Notify failed: {0}")]
    NotifyFailed(String),
    #[error("Stop failed: {0}")]
    StopFailed(String),
}

/// Events delivered by the central-role link after connecting
#[derive(Debug, Clone)]
pub enum CentralEvent {
    /// The target pushed a notification on a subscribed characteristic
    Notification {
        /// Characteristic UUID
        uuid: Uuid,
        /// Notification payload, unmodified
        value: Vec<u8>,
    },
    /// The central-role link was lost; no further operations will succeed
    LinkLost,
}

/// A read or write arriving on the mirrored peripheral.
///
/// The driver must error-complete any request it cannot deliver (for example
/// when the request queue is closed because the relay is draining), so the
/// original requester is never left hanging.
#[derive(Debug)]
pub enum PeripheralRequest {
    /// A central read the mirrored characteristic
    Read {
        /// Mirrored characteristic UUID
        uuid: Uuid,
        /// Completion channel: the response value or an error response
        respond: oneshot::Sender<Result<Vec<u8>, ForwardError>>,
    },
    /// A central wrote the mirrored characteristic
    Write {
        /// Mirrored characteristic UUID
        uuid: Uuid,
        /// Payload as delivered by the requester
        value: Vec<u8>,
        /// Completion channel: acknowledgement or an error response
        respond: oneshot::Sender<Result<(), ForwardError>>,
    },
}

impl PeripheralRequest {
    /// UUID the request targets
    pub fn uuid(&self) -> Uuid {
        match self {
            PeripheralRequest::Read { uuid, .. } => *uuid,
            PeripheralRequest::Write { uuid, .. } => *uuid,
        }
    }

    /// Complete the request with an error response
    pub fn reject(self, error: ForwardError) {
        match self {
            PeripheralRequest::Read { respond, .. } => {
                let _ = respond.send(Err(error));
            }
            PeripheralRequest::Write { respond, .. } => {
                let _ = respond.send(Err(error));
            }
        }
    }
}

/// Central-role driver: initiates the connection to the real target and
/// reads/writes its attributes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CentralDriver: Send + Sync {
    /// Connect to the target and return its event stream.
    ///
    /// The stream carries notifications for subscribed characteristics and a
    /// terminal [`CentralEvent::LinkLost`] when the link drops.
    async fn connect(&self, address: &str)
        -> Result<mpsc::UnboundedReceiver<CentralEvent>, CentralError>;

    /// Post-connect liveness check
    async fn is_connected(&self) -> bool;

    /// Tear down the link
    async fn disconnect(&self) -> Result<(), CentralError>;

    /// Enumerate the target's services and characteristics
    async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>, CentralError>;

    /// Read a characteristic on the target
    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, CentralError>;

    /// Write a characteristic on the target
    async fn write(&self, uuid: Uuid, value: &[u8]) -> Result<(), CentralError>;

    /// Subscribe to notifications for a characteristic
    async fn subscribe(&self, uuid: Uuid) -> Result<(), CentralError>;
}

/// Peripheral-role driver: publishes the mirrored services and relays
/// requests from connected centrals into the request queue.
#[async_trait]
pub trait PeripheralDriver: Send + Sync {
    /// Publish the mirrored definition and return the incoming request queue
    async fn publish(
        &self,
        mirror: &MirrorDefinition,
    ) -> Result<mpsc::Receiver<PeripheralRequest>, PeripheralError>;

    /// Begin advertising the payload
    async fn advertise(&self, payload: &AdvertisementPayload) -> Result<(), PeripheralError>;

    /// Push a notification to all subscribed centrals
    async fn notify(&self, uuid: Uuid, value: &[u8]) -> Result<(), PeripheralError>;

    /// Stop advertising and unpublish
    async fn stop(&self) -> Result<(), PeripheralError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_uuid_accessor() {
        let uuid = Uuid::from_u128(0xC1);
        let (tx, _rx) = oneshot::channel();
        let req = PeripheralRequest::Read { uuid, respond: tx };
        assert_eq!(req.uuid(), uuid);

        let (tx, _rx) = oneshot::channel();
        let req = PeripheralRequest::Write {
            uuid,
            value: vec![1, 2],
            respond: tx,
        };
        assert_eq!(req.uuid(), uuid);
    }

    #[tokio::test]
    async fn test_reject_completes_with_error() {
        let uuid = Uuid::from_u128(0xC1);
        let (tx, rx) = oneshot::channel();
        let req = PeripheralRequest::Read { uuid, respond: tx };

        req.reject(ForwardError::ShuttingDown);

        let outcome = rx.await.expect("responder dropped");
        assert!(matches!(outcome, Err(ForwardError::ShuttingDown)));
    }
}
