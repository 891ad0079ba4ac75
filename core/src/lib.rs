// blerelay core — BLE MITM relay spine
//
// "Sit between a victim central and a target peripheral,
//  and forward everything, byte for byte."
//
// Platform adapters live outside this crate; everything here runs against
// the driver traits and is testable without radio hardware.

pub mod driver;
pub mod gatt;
pub mod relay;

pub use driver::{
    CentralDriver, CentralError, CentralEvent, PeripheralDriver, PeripheralError,
    PeripheralRequest, PlatformCapability, StaticCapability,
};
pub use gatt::{
    build_mirror, AdvertisementPayload, CharacteristicDescriptor, CharacteristicProps,
    MirrorDefinition, MirrorPolicy, MirroredCharacteristic, MirroredService, ServiceDescriptor,
};
pub use relay::{
    connect_with_retry, ConnectionState, ForwardError, RelayError, RelayEngine, RelaySession,
    RelayState, RetryPolicy, SessionConfig, SessionController, SessionGuard, SessionOutcome,
    SessionRegistry, SessionState, TargetHandle,
};
