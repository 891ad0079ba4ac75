//! BLE MITM relay
//!
//! The relay sits between a victim central and a target peripheral: it holds a
//! central-role link to the target, republishes the target's discovered
//! services under the local peripheral role, and forwards read/write/notify
//! traffic bidirectionally. This module contains:
//!
//! - **connect**: bounded-retry connection to the target
//! - **engine**: the forwarding state machine
//! - **session**: the session controller sequencing the whole run
//! - **registry**: the one-active-session-per-target invariant
//!
//! Errors split along the propagation boundary: [`RelayError`] variants are
//! session-fatal and reach the session controller; [`ForwardError`] is scoped
//! to one forwarded request and only ever reaches the original requester.

pub mod connect;
pub mod engine;
pub mod registry;
pub mod session;

use thiserror::Error;
use uuid::Uuid;

pub use connect::{connect_with_retry, RetryPolicy};
pub use engine::{RelayEngine, RelayState};
pub use registry::{SessionGuard, SessionRegistry};
pub use session::{
    ConnectionState, RelaySession, SessionConfig, SessionController, SessionOutcome, SessionState,
    TargetHandle,
};

/// Session-level errors; all of these terminate the run
#[derive(Error, Debug)]
pub enum RelayError {
    /// Target unreachable after the full retry budget
    #[error("Failed to connect to {address} after {attempts} attempts")]
    Connection {
        /// Target address
        address: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Service enumeration failed after a successful connect
    #[error("Service discovery failed: {0}")]
    Discovery(String),

    /// A mirrored UUID does not exist in the captured service set
    #[error("Mirrored characteristic {0} is absent from the captured services")]
    MirrorMismatch(Uuid),

    /// Host cannot emulate the peripheral role
    #[error("Peripheral-role emulation unavailable on this host")]
    MirrorUnavailable,

    /// Central-role link to the target dropped mid-session
    #[error("Central link to target lost")]
    LinkLost,

    /// A relay session is already active against this target
    #[error("A relay session is already active for {0}")]
    AlreadyRelaying(String),

    /// Peripheral-role driver failure while publishing or advertising
    #[error("Peripheral driver error: {0}")]
    Peripheral(#[from] crate::driver::PeripheralError),
}

/// Per-request forwarding errors; surfaced to the original requester and
/// never fatal to the session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The requested UUID has no binding in the relay session
    #[error("No mirrored characteristic {0} in the captured service set")]
    UnknownCharacteristic(Uuid),

    /// The forwarded operation failed on the central-role link
    #[error("Forward to target failed: {0}")]
    Central(String),

    /// The relay stopped accepting requests
    #[error("Relay is shutting down")]
    ShuttingDown,
}
