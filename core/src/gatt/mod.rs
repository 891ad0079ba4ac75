//! GATT descriptor data model
//!
//! This module provides the captured-service data model shared by discovery,
//! mirroring, and forwarding:
//!
//! - **CharacteristicProps**: the advertised property flags of a characteristic
//! - **CharacteristicDescriptor / ServiceDescriptor**: the service tree captured
//!   from a connected target
//! - **MirrorDefinition**: the peripheral-role definition derived from a capture
//! - **mirror**: the builder that derives a `MirrorDefinition` from a capture
//!
//! Descriptors are immutable snapshots: the mirror builder copies them rather
//! than referencing them, so the "real" and "mirrored" object graphs never alias.

pub mod mirror;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use mirror::{build_mirror, MirrorPolicy};

/// Property flags advertised by a GATT characteristic.
///
/// Only the subset the relay forwards is modeled: read, write,
/// write-without-response, and notify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProps {
    /// Characteristic supports read requests
    pub read: bool,
    /// Characteristic supports acknowledged writes
    pub write: bool,
    /// Characteristic supports unacknowledged writes
    pub write_without_response: bool,
    /// Characteristic supports server-initiated notifications
    pub notify: bool,
}

impl CharacteristicProps {
    /// Whether any write variant is advertised
    pub fn writable(&self) -> bool {
        self.write || self.write_without_response
    }

    /// Whether no flag at all is set
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write && !self.write_without_response && !self.notify
    }
}

impl fmt::Display for CharacteristicProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.read {
            flags.push("read");
        }
        if self.write {
            flags.push("write");
        }
        if self.write_without_response {
            flags.push("write-without-response");
        }
        if self.notify {
            flags.push("notify");
        }
        write!(f, "[{}]", flags.join(","))
    }
}

/// A characteristic captured from the target during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Advertised property flags
    pub props: CharacteristicProps,
    /// Last-known raw value, if any read or notification has been seen
    pub cached_value: Option<Vec<u8>>,
}

impl CharacteristicDescriptor {
    /// Create a descriptor with no cached value
    pub fn new(uuid: Uuid, props: CharacteristicProps) -> Self {
        Self {
            uuid,
            props,
            cached_value: None,
        }
    }
}

/// A service captured from the target during discovery.
///
/// Characteristic order is preserved as delivered by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service UUID
    pub uuid: Uuid,
    /// Human-readable description (driver- or operator-supplied)
    pub description: String,
    /// Characteristics in discovery order
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    /// Create a service descriptor
    pub fn new(uuid: Uuid, description: impl Into<String>) -> Self {
        Self {
            uuid,
            description: description.into(),
            characteristics: Vec::new(),
        }
    }

    /// Append a characteristic, preserving discovery order
    pub fn with_characteristic(mut self, characteristic: CharacteristicDescriptor) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// A characteristic republished under the peripheral role.
///
/// Permissions are derived 1:1 from the source property flags; a mirrored
/// characteristic never gains a permission its source does not advertise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredCharacteristic {
    /// Characteristic UUID (identical to the source)
    pub uuid: Uuid,
    /// Property flags (identical to the source)
    pub props: CharacteristicProps,
    /// Readable permission, derived from `props.read`
    pub readable: bool,
    /// Writable permission, derived from the write flags
    pub writable: bool,
}

impl MirroredCharacteristic {
    /// Derive a mirrored characteristic from a captured one
    pub fn from_source(source: &CharacteristicDescriptor) -> Self {
        Self {
            uuid: source.uuid,
            props: source.props,
            readable: source.props.read,
            writable: source.props.writable(),
        }
    }
}

/// A service republished under the peripheral role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredService {
    /// Service UUID (identical to the source)
    pub uuid: Uuid,
    /// Mirrored characteristics in source order
    pub characteristics: Vec<MirroredCharacteristic>,
}

/// Advertisement payload for the mirrored peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementPayload {
    /// Advertised local name
    pub local_name: String,
    /// Advertised service UUID list
    pub service_uuids: Vec<Uuid>,
}

/// The complete peripheral-role definition to publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorDefinition {
    /// Services to publish
    pub services: Vec<MirroredService>,
    /// Advertisement to broadcast
    pub advertisement: AdvertisementPayload,
}

impl MirrorDefinition {
    /// Total characteristic count across all mirrored services
    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }

    /// Iterate over all mirrored characteristics
    pub fn characteristics(&self) -> impl Iterator<Item = &MirroredCharacteristic> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }
}
