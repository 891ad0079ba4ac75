//! Platform capability shim
//!
//! Peripheral-role emulation is not available on every host: it requires the
//! platform to both create local GATT services and begin advertising. Instead
//! of catching "unsupported API" failures deep in the call chain, the session
//! controller asks this shim once, up front, and degrades to passive logging
//! when the answer is no.

/// Capability query for the current host.
///
/// Pure and side-effect free; evaluated once per session run at the start of
/// mirroring.
pub trait PlatformCapability: Send + Sync {
    /// True only if the host can create local GATT services and advertise
    fn peripheral_role_available(&self) -> bool;
}

/// A capability value decided at startup.
///
/// Platform adapters know at construction time whether a peripheral-role
/// backend exists, so a precomputed answer is all the shim needs.
#[derive(Debug, Clone, Copy)]
pub struct StaticCapability {
    peripheral_role: bool,
}

impl StaticCapability {
    /// Capability with peripheral-role emulation available
    pub fn full() -> Self {
        Self {
            peripheral_role: true,
        }
    }

    /// Capability with central role only
    pub fn central_only() -> Self {
        Self {
            peripheral_role: false,
        }
    }
}

impl PlatformCapability for StaticCapability {
    fn peripheral_role_available(&self) -> bool {
        self.peripheral_role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_capability_values() {
        assert!(StaticCapability::full().peripheral_role_available());
        assert!(!StaticCapability::central_only().peripheral_role_available());
    }

    #[test]
    fn test_capability_is_repeatable() {
        // The query is pure: asking twice gives the same answer
        let cap = StaticCapability::central_only();
        assert_eq!(
            cap.peripheral_role_available(),
            cap.peripheral_role_available()
        );
    }
}
