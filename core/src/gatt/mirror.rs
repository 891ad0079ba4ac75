//! Service mirror builder — derives a peripheral-role definition from a capture
//!
//! Takes the service tree captured from a connected target and constructs an
//! equivalent local peripheral-role definition: same UUIDs, same property
//! flags, permissions derived 1:1 from those flags.

use super::{
    AdvertisementPayload, MirrorDefinition, MirroredCharacteristic, MirroredService,
    ServiceDescriptor,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which captured services to republish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorPolicy {
    /// Mirror the full captured service tree
    AllServices,
    /// Mirror only the first discovered service.
    ///
    /// Legacy-compatible behavior: observable advertised UUIDs differ from
    /// `AllServices`, so only select this when impersonation fidelity to the
    /// original tooling matters more than coverage.
    FirstServiceOnly,
}

impl Default for MirrorPolicy {
    fn default() -> Self {
        MirrorPolicy::AllServices
    }
}

/// Build a peripheral-role definition from a captured service tree.
///
/// Returns `None` when `services` is empty: with nothing to mirror the relay
/// cannot proceed in active mode.
pub fn build_mirror(
    services: &[ServiceDescriptor],
    policy: MirrorPolicy,
    local_name: &str,
) -> Option<MirrorDefinition> {
    if services.is_empty() {
        return None;
    }

    let selected: &[ServiceDescriptor] = match policy {
        MirrorPolicy::AllServices => services,
        MirrorPolicy::FirstServiceOnly => &services[..1],
    };

    let mirrored: Vec<MirroredService> = selected
        .iter()
        .map(|service| MirroredService {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .iter()
                .map(MirroredCharacteristic::from_source)
                .collect(),
        })
        .collect();

    let advertisement = AdvertisementPayload {
        local_name: local_name.to_string(),
        service_uuids: mirrored.iter().map(|s| s.uuid).collect(),
    };

    debug!(
        services = mirrored.len(),
        characteristics = mirrored.iter().map(|s| s.characteristics.len()).sum::<usize>(),
        policy = ?policy,
        "built mirror definition"
    );

    Some(MirrorDefinition {
        services: mirrored,
        advertisement,
    })
}
