//! Session controller — sequences one relay run end to end
//!
//! Connect (with retry) → discover → capability check → mirror → publish →
//! relay, with shutdown and cleanup owned here: the central link is
//! disconnected first, then advertising is stopped, and an error in either
//! step never blocks the other.
//!
//! When the host cannot emulate the peripheral role the controller degrades
//! to passive logging of the target's services and notifications instead of
//! failing outright.

use super::connect::{connect_with_retry, RetryPolicy};
use super::engine::RelayEngine;
use super::registry::SessionRegistry;
use super::RelayError;
use crate::driver::{CentralDriver, CentralEvent, PeripheralDriver, PlatformCapability};
use crate::gatt::{build_mirror, CharacteristicProps, MirrorDefinition, MirrorPolicy, ServiceDescriptor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Connection state of the target link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Link up and liveness-checked
    Connected,
    /// Terminal connect failure
    Failed,
}

/// The peripheral being impersonated.
///
/// Owned exclusively by the session controller and destroyed on shutdown.
#[derive(Debug, Clone)]
pub struct TargetHandle {
    /// Platform BLE address string
    pub address: String,
    /// Current link state
    pub state: ConnectionState,
}

impl TargetHandle {
    /// Create a handle in the `Disconnected` state
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: ConnectionState::Disconnected,
        }
    }

    /// Update the link state
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Whether the link is up
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Resolution of a mirrored characteristic back to its origin
#[derive(Debug, Clone)]
pub struct CharBinding {
    /// UUID of the originating service
    pub service_uuid: Uuid,
    /// Advertised property flags of the real characteristic
    pub props: CharacteristicProps,
}

/// One live relay: the target handle, the captured service tree, and the
/// per-characteristic resolution map and value slots the engine works with.
///
/// The per-characteristic slot mutex serves double duty: it protects the
/// cached value and serializes forwarded operations on that UUID without
/// serializing unrelated characteristics.
pub struct RelaySession {
    target: TargetHandle,
    services: Vec<ServiceDescriptor>,
    bindings: HashMap<Uuid, CharBinding>,
    slots: HashMap<Uuid, Arc<Mutex<Option<Vec<u8>>>>>,
    live: AtomicBool,
}

impl RelaySession {
    /// Build a session for a mirror derived from `services`.
    ///
    /// Fails with [`RelayError::MirrorMismatch`] if any mirrored UUID is
    /// absent from the captured tree — mirroring must never run ahead of
    /// discovery.
    pub fn new(
        target: TargetHandle,
        services: Vec<ServiceDescriptor>,
        mirror: &MirrorDefinition,
    ) -> Result<Self, RelayError> {
        let mut bindings = HashMap::new();
        let mut slots = HashMap::new();

        for mirrored in mirror.characteristics() {
            let origin = services.iter().find_map(|service| {
                service
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == mirrored.uuid)
                    .map(|c| (service.uuid, c))
            });
            let (service_uuid, characteristic) = match origin {
                Some(found) => found,
                None => return Err(RelayError::MirrorMismatch(mirrored.uuid)),
            };

            bindings.insert(
                mirrored.uuid,
                CharBinding {
                    service_uuid,
                    props: characteristic.props,
                },
            );
            slots.insert(
                mirrored.uuid,
                Arc::new(Mutex::new(characteristic.cached_value.clone())),
            );
        }

        Ok(Self {
            target,
            services,
            bindings,
            slots,
            live: AtomicBool::new(false),
        })
    }

    /// The impersonated target
    pub fn target(&self) -> &TargetHandle {
        &self.target
    }

    /// The captured service tree
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Resolve a mirrored UUID to its originating service and properties
    pub fn resolve(&self, uuid: Uuid) -> Option<&CharBinding> {
        self.bindings.get(&uuid)
    }

    /// The value slot for a mirrored characteristic
    pub fn slot(&self, uuid: Uuid) -> Option<Arc<Mutex<Option<Vec<u8>>>>> {
        self.slots.get(&uuid).cloned()
    }

    /// Last value forwarded or notified for a characteristic
    pub async fn cached_value(&self, uuid: Uuid) -> Option<Vec<u8>> {
        match self.slots.get(&uuid) {
            Some(slot) => slot.lock().await.clone(),
            None => None,
        }
    }

    /// Whether the relay is currently forwarding
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Mark the session live or drained
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }
}

/// Controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Running the retry connector
    Connecting,
    /// Discovery and mirror construction
    Mirroring,
    /// Relay engine owns the run
    Relaying,
    /// Degraded central-role-only mode
    PassiveLogging,
    /// Cleanup in progress
    ShuttingDown,
    /// Terminal
    Closed,
}

/// How a session ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Active relay, stopped by the operator
    Relayed,
    /// Passive logging, stopped by the operator
    Passive,
}

/// Configuration for one session run
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target BLE address
    pub target_address: String,
    /// Retry budget for the initial connect
    pub retry: RetryPolicy,
    /// Which captured services to mirror
    pub mirror_policy: MirrorPolicy,
    /// Local name to advertise
    pub local_name: String,
    /// Coarse liveness poll, bounding how stale a cancellation can go
    /// unnoticed
    pub poll_interval: Duration,
}

impl SessionConfig {
    /// Defaults matching the stock relay: three attempts two seconds apart,
    /// full-tree mirroring, one-second cancellation poll.
    pub fn new(target_address: impl Into<String>) -> Self {
        Self {
            target_address: target_address.into(),
            retry: RetryPolicy::default(),
            mirror_policy: MirrorPolicy::default(),
            local_name: "blerelay".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Top-level run loop for one relay session
pub struct SessionController {
    central: Arc<dyn CentralDriver>,
    peripheral: Option<Arc<dyn PeripheralDriver>>,
    capability: Arc<dyn PlatformCapability>,
    config: SessionConfig,
    state: SessionState,
}

impl SessionController {
    /// Create a controller; `peripheral` may be absent on central-only hosts
    pub fn new(
        central: Arc<dyn CentralDriver>,
        peripheral: Option<Arc<dyn PeripheralDriver>>,
        capability: Arc<dyn PlatformCapability>,
        config: SessionConfig,
    ) -> Self {
        Self {
            central,
            peripheral,
            capability,
            config,
            state: SessionState::Connecting,
        }
    }

    /// Current controller state
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        info!(from = ?self.state, to = ?state, "session state");
        self.state = state;
    }

    /// Run the session to completion.
    ///
    /// `shutdown` is the external stop signal; it is observed within one poll
    /// interval in every phase. Cleanup runs on every exit path.
    pub async fn run(
        &mut self,
        registry: &SessionRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SessionOutcome, RelayError> {
        let _guard = registry.claim(&self.config.target_address)?;

        self.set_state(SessionState::Connecting);
        let mut target = TargetHandle::new(self.config.target_address.clone());
        target.set_state(ConnectionState::Connecting);

        let events =
            match connect_with_retry(&*self.central, &target.address, &self.config.retry).await {
                Ok(events) => events,
                Err(err) => {
                    target.set_state(ConnectionState::Failed);
                    self.set_state(SessionState::Closed);
                    return Err(err);
                }
            };
        target.set_state(ConnectionState::Connected);

        self.set_state(SessionState::Mirroring);
        let services = match self.central.discover_services().await {
            Ok(services) => services,
            Err(err) => {
                return self
                    .finish(Err(RelayError::Discovery(err.to_string())))
                    .await;
            }
        };
        log_service_tree(&services);

        let peripheral_available =
            self.capability.peripheral_role_available() && self.peripheral.is_some();
        if !peripheral_available {
            warn!("peripheral role unavailable; degrading to passive logging");
            self.set_state(SessionState::PassiveLogging);
            let outcome = self.passive_loop(&services, events, shutdown).await;
            return self.finish(outcome).await;
        }

        let mirror = match build_mirror(
            &services,
            self.config.mirror_policy,
            &self.config.local_name,
        ) {
            Some(mirror) => mirror,
            None => {
                // Nothing to mirror: never enter active relaying
                let outcome = Err(RelayError::Discovery(
                    "target exposed no services".to_string(),
                ));
                return self.finish(outcome).await;
            }
        };

        let session = match RelaySession::new(target, services, &mirror) {
            Ok(session) => Arc::new(session),
            Err(err) => return self.finish(Err(err)).await,
        };

        self.set_state(SessionState::Relaying);
        let peripheral = self
            .peripheral
            .clone()
            .ok_or(RelayError::MirrorUnavailable)?;
        let engine = RelayEngine::new(self.central.clone(), peripheral, session, mirror);
        let result = engine.run(events, shutdown).await;

        self.finish(result.map(|()| SessionOutcome::Relayed)).await
    }

    /// Degraded mode: log the captured tree, subscribe where possible, and
    /// echo target notifications into the log until cancelled.
    async fn passive_loop(
        &self,
        services: &[ServiceDescriptor],
        mut events: mpsc::UnboundedReceiver<CentralEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionOutcome, RelayError> {
        for service in services {
            for characteristic in &service.characteristics {
                if characteristic.props.notify {
                    if let Err(err) = self.central.subscribe(characteristic.uuid).await {
                        warn!(uuid = %characteristic.uuid, %err, "subscribe failed");
                    }
                }
            }
        }

        let mut poll = tokio::time::interval(self.config.poll_interval);
        loop {
            if *shutdown.borrow() {
                return Ok(SessionOutcome::Passive);
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(SessionOutcome::Passive);
                    }
                }
                maybe_event = events.recv() => match maybe_event {
                    Some(CentralEvent::Notification { uuid, value }) => {
                        info!(%uuid, payload = ?value, "notification observed");
                    }
                    Some(CentralEvent::LinkLost) | None => {
                        return Err(RelayError::LinkLost);
                    }
                },
                _ = poll.tick() => {}
            }
        }
    }

    /// Cleanup on every exit path: disconnect the central link, then stop
    /// advertising, tolerating errors from either step.
    async fn finish(
        &mut self,
        outcome: Result<SessionOutcome, RelayError>,
    ) -> Result<SessionOutcome, RelayError> {
        self.set_state(SessionState::ShuttingDown);

        if let Err(err) = self.central.disconnect().await {
            warn!(%err, "disconnect failed during shutdown");
        }
        if let Some(peripheral) = &self.peripheral {
            if let Err(err) = peripheral.stop().await {
                warn!(%err, "stop advertising failed during shutdown");
            }
        }

        self.set_state(SessionState::Closed);
        match &outcome {
            Ok(result) => info!(?result, "session closed"),
            Err(err) => warn!(%err, "session closed with error"),
        }
        outcome
    }
}

fn log_service_tree(services: &[ServiceDescriptor]) {
    info!(count = services.len(), "services discovered");
    for service in services {
        info!(service = %service.uuid, description = %service.description, "service");
        for characteristic in &service.characteristics {
            info!(
                service = %service.uuid,
                characteristic = %characteristic.uuid,
                props = %characteristic.props,
                "characteristic"
            );
        }
    }
}
