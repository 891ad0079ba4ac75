//! Relay forwarding engine
//!
//! Long-lived state machine with two symmetric forwarding paths. Once the
//! mirrored services are published and advertised, every read/write arriving
//! on the peripheral side is resolved against the relay session and forwarded
//! to the real target over the central-role link; target notifications flow
//! back through the mirrored characteristics unchanged.
//!
//! Concurrency model: each mirrored characteristic gets its own worker task
//! fed by an unbounded queue. Requests are routed into the queue in the order
//! the peripheral driver delivers them, so two operations on the same
//! characteristic UUID are forwarded in delivery order, while operations on
//! distinct UUIDs proceed concurrently. Forwarding is at-most-once: a failed
//! read or write completes with an error response and is never retried by the
//! engine.

use super::session::RelaySession;
use super::{ForwardError, RelayError};
use crate::driver::{
    CentralDriver, CentralError, CentralEvent, PeripheralDriver, PeripheralRequest,
};
use crate::gatt::MirrorDefinition;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Created, nothing published yet
    Idle,
    /// Advertisement start requested, not yet confirmed
    Publishing,
    /// Steady-state relaying
    Active,
    /// Shutdown or link loss; flushing in-flight requests
    Draining,
    /// Terminal
    Stopped,
}

/// The forwarding engine for one relay session.
///
/// Owns no reconnection logic: a lost central link drains the engine and
/// reports [`RelayError::LinkLost`] upward; restarting the flow is the
/// session controller's decision.
pub struct RelayEngine {
    central: Arc<dyn CentralDriver>,
    peripheral: Arc<dyn PeripheralDriver>,
    session: Arc<RelaySession>,
    mirror: MirrorDefinition,
    state: RelayState,
}

impl RelayEngine {
    /// Create an engine in the `Idle` state
    pub fn new(
        central: Arc<dyn CentralDriver>,
        peripheral: Arc<dyn PeripheralDriver>,
        session: Arc<RelaySession>,
        mirror: MirrorDefinition,
    ) -> Self {
        Self {
            central,
            peripheral,
            session,
            mirror,
            state: RelayState::Idle,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Publish, advertise, and relay until shutdown or link loss.
    ///
    /// Returns `Ok(())` on an operator-requested stop and the terminal error
    /// otherwise. Either way the engine drains in-flight requests and makes a
    /// best-effort attempt to stop advertising before returning.
    pub async fn run(
        mut self,
        mut central_events: mpsc::UnboundedReceiver<CentralEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        self.state = RelayState::Publishing;
        info!(
            services = self.mirror.services.len(),
            characteristics = self.mirror.characteristic_count(),
            "publishing mirrored services"
        );

        let mut requests = self.peripheral.publish(&self.mirror).await?;
        self.peripheral.advertise(&self.mirror.advertisement).await?;

        // Subscribe on the target side for every characteristic we may have
        // to notify on the victim side. Failure to subscribe one
        // characteristic degrades that path only.
        for characteristic in self.mirror.characteristics() {
            if characteristic.props.notify {
                if let Err(err) = self.central.subscribe(characteristic.uuid).await {
                    warn!(uuid = %characteristic.uuid, %err, "subscribe failed");
                }
            }
        }

        self.state = RelayState::Active;
        self.session.set_live(true);
        info!("relay active");

        // Forward workers report a dead link here so a failed forward attempt
        // triggers draining even before the driver's own LinkLost event.
        let (link_down_tx, mut link_down_rx) = mpsc::unbounded_channel::<()>();
        let mut workers: HashMap<Uuid, mpsc::UnboundedSender<PeripheralRequest>> = HashMap::new();
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let draining = Arc::new(AtomicBool::new(false));
        let mut failure: Option<RelayError> = None;

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    maybe_request = requests.recv() => match maybe_request {
                        Some(request) => self.dispatch(
                            request,
                            &mut workers,
                            &mut in_flight,
                            &link_down_tx,
                            &draining,
                        ),
                        None => {
                            warn!("peripheral request queue closed");
                            failure = Some(RelayError::Peripheral(
                                crate::driver::PeripheralError::PublishFailed(
                                    "request queue closed".to_string(),
                                ),
                            ));
                            break;
                        }
                    },
                    maybe_event = central_events.recv() => match maybe_event {
                        Some(CentralEvent::Notification { uuid, value }) => {
                            self.relay_notification(uuid, value).await;
                        }
                        Some(CentralEvent::LinkLost) | None => {
                            warn!("central link lost");
                            failure = Some(RelayError::LinkLost);
                            break;
                        }
                    },
                    _ = link_down_rx.recv() => {
                        warn!("forward attempt reported dead link");
                        failure = Some(RelayError::LinkLost);
                        break;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("shutdown requested");
                            break;
                        }
                    }
                }
            }
        }

        self.state = RelayState::Draining;
        self.session.set_live(false);
        draining.store(true, Ordering::SeqCst);
        debug!(workers = in_flight.len(), "draining");

        // Reject everything still queued, let the request already being
        // forwarded on each characteristic complete or error out on its own.
        requests.close();
        while let Some(request) = requests.recv().await {
            request.reject(ForwardError::ShuttingDown);
        }
        workers.clear();
        while in_flight.join_next().await.is_some() {}

        if let Err(err) = self.peripheral.stop().await {
            warn!(%err, "stop advertising failed during drain");
        }

        self.state = RelayState::Stopped;
        info!("relay stopped");

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Route one peripheral-side request into its characteristic's worker
    /// queue, creating the worker on first use.
    ///
    /// Resolution failures are answered immediately. Enqueueing happens here,
    /// in the event loop, so same-characteristic requests keep the order the
    /// driver delivered them in; unrelated characteristics never wait on each
    /// other.
    fn dispatch(
        &self,
        request: PeripheralRequest,
        workers: &mut HashMap<Uuid, mpsc::UnboundedSender<PeripheralRequest>>,
        in_flight: &mut JoinSet<()>,
        link_down: &mpsc::UnboundedSender<()>,
        draining: &Arc<AtomicBool>,
    ) {
        let uuid = request.uuid();
        let Some(slot) = self.session.slot(uuid) else {
            warn!(%uuid, "request for unmirrored characteristic rejected");
            request.reject(ForwardError::UnknownCharacteristic(uuid));
            return;
        };

        let queue = workers.entry(uuid).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            in_flight.spawn(Self::forward_worker(
                self.central.clone(),
                slot,
                rx,
                link_down.clone(),
                draining.clone(),
            ));
            tx
        });
        if let Err(mpsc::error::SendError(request)) = queue.send(request) {
            request.reject(ForwardError::ShuttingDown);
        }
    }

    /// Forward one characteristic's requests, one at a time, in queue order.
    ///
    /// Runs until the queue closes during drain; requests still queued when
    /// draining begins are rejected rather than forwarded.
    async fn forward_worker(
        central: Arc<dyn CentralDriver>,
        slot: Arc<Mutex<Option<Vec<u8>>>>,
        mut queue: mpsc::UnboundedReceiver<PeripheralRequest>,
        link_down: mpsc::UnboundedSender<()>,
        draining: Arc<AtomicBool>,
    ) {
        while let Some(request) = queue.recv().await {
            if draining.load(Ordering::SeqCst) {
                request.reject(ForwardError::ShuttingDown);
                continue;
            }
            let mut cache = slot.lock().await;
            match request {
                PeripheralRequest::Read { uuid, respond } => {
                    match central.read(uuid).await {
                        Ok(value) => {
                            debug!(%uuid, len = value.len(), "read forwarded");
                            *cache = Some(value.clone());
                            let _ = respond.send(Ok(value));
                        }
                        Err(err) => {
                            warn!(%uuid, %err, "read forward failed");
                            if matches!(err, CentralError::NotConnected) {
                                let _ = link_down.send(());
                            }
                            let _ = respond.send(Err(ForwardError::Central(err.to_string())));
                        }
                    }
                }
                PeripheralRequest::Write { uuid, value, respond } => {
                    match central.write(uuid, &value).await {
                        Ok(()) => {
                            debug!(%uuid, len = value.len(), "write forwarded");
                            *cache = Some(value);
                            let _ = respond.send(Ok(()));
                        }
                        Err(err) => {
                            warn!(%uuid, %err, "write forward failed");
                            if matches!(err, CentralError::NotConnected) {
                                let _ = link_down.send(());
                            }
                            let _ = respond.send(Err(ForwardError::Central(err.to_string())));
                        }
                    }
                }
            }
        }
    }

    /// Reverse path: push a target notification through the mirrored
    /// characteristic, payload bytes unchanged.
    async fn relay_notification(&self, uuid: Uuid, value: Vec<u8>) {
        if let Some(slot) = self.session.slot(uuid) {
            *slot.lock().await = Some(value.clone());
        }
        match self.peripheral.notify(uuid, &value).await {
            Ok(()) => debug!(%uuid, len = value.len(), "notification relayed"),
            Err(err) => warn!(%uuid, %err, "notification relay failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PeripheralError;
    use crate::gatt::{
        build_mirror, CharacteristicDescriptor, CharacteristicProps, MirrorPolicy,
        ServiceDescriptor,
    };
    use crate::relay::session::TargetHandle;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::{oneshot, Semaphore};

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    /// In-process central: serves reads from a value map, records writes,
    /// optionally gates operations behind a semaphore and fails them once the
    /// link is marked down.
    struct FakeCentral {
        values: SyncMutex<HashMap<Uuid, Vec<u8>>>,
        writes: SyncMutex<Vec<(Uuid, Vec<u8>)>>,
        subscriptions: SyncMutex<Vec<Uuid>>,
        ops_started: AtomicU32,
        gate: Option<Semaphore>,
        link_down: AtomicBool,
    }

    impl FakeCentral {
        fn new() -> Self {
            Self {
                values: SyncMutex::new(HashMap::new()),
                writes: SyncMutex::new(Vec::new()),
                subscriptions: SyncMutex::new(Vec::new()),
                ops_started: AtomicU32::new(0),
                gate: None,
                link_down: AtomicBool::new(false),
            }
        }

        fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::new()
            }
        }

        fn set_value(&self, uuid: Uuid, value: &[u8]) {
            self.values.lock().insert(uuid, value.to_vec());
        }

        fn release(&self, permits: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(permits);
            }
        }

        async fn pass_gate(&self) {
            self.ops_started.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.expect("gate closed");
                permit.forget();
            }
        }
    }

    #[async_trait]
    impl CentralDriver for FakeCentral {
        async fn connect(
            &self,
            _address: &str,
        ) -> Result<mpsc::UnboundedReceiver<CentralEvent>, CentralError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn is_connected(&self) -> bool {
            !self.link_down.load(Ordering::SeqCst)
        }

        async fn disconnect(&self) -> Result<(), CentralError> {
            Ok(())
        }

        async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>, CentralError> {
            Ok(Vec::new())
        }

        async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, CentralError> {
            self.pass_gate().await;
            if self.link_down.load(Ordering::SeqCst) {
                return Err(CentralError::NotConnected);
            }
            self.values
                .lock()
                .get(&uuid)
                .cloned()
                .ok_or(CentralError::UnknownCharacteristic(uuid))
        }

        async fn write(&self, uuid: Uuid, value: &[u8]) -> Result<(), CentralError> {
            self.pass_gate().await;
            if self.link_down.load(Ordering::SeqCst) {
                return Err(CentralError::NotConnected);
            }
            self.writes.lock().push((uuid, value.to_vec()));
            Ok(())
        }

        async fn subscribe(&self, uuid: Uuid) -> Result<(), CentralError> {
            self.subscriptions.lock().push(uuid);
            Ok(())
        }
    }

    /// In-process peripheral: hands the engine a request queue and records
    /// notifications and stop calls.
    struct FakePeripheral {
        requests: SyncMutex<Option<mpsc::Receiver<PeripheralRequest>>>,
        notifications: SyncMutex<Vec<(Uuid, Vec<u8>)>>,
        stop_calls: AtomicU32,
        fail_stop: AtomicBool,
    }

    impl FakePeripheral {
        fn new() -> (Arc<Self>, mpsc::Sender<PeripheralRequest>) {
            let (tx, rx) = mpsc::channel(16);
            let this = Arc::new(Self {
                requests: SyncMutex::new(Some(rx)),
                notifications: SyncMutex::new(Vec::new()),
                stop_calls: AtomicU32::new(0),
                fail_stop: AtomicBool::new(false),
            });
            (this, tx)
        }
    }

    #[async_trait]
    impl PeripheralDriver for FakePeripheral {
        async fn publish(
            &self,
            _mirror: &MirrorDefinition,
        ) -> Result<mpsc::Receiver<PeripheralRequest>, PeripheralError> {
            self.requests
                .lock()
                .take()
                .ok_or_else(|| PeripheralError::PublishFailed("already published".to_string()))
        }

        async fn advertise(
            &self,
            _payload: &crate::gatt::AdvertisementPayload,
        ) -> Result<(), PeripheralError> {
            Ok(())
        }

        async fn notify(&self, uuid: Uuid, value: &[u8]) -> Result<(), PeripheralError> {
            self.notifications.lock().push((uuid, value.to_vec()));
            Ok(())
        }

        async fn stop(&self) -> Result<(), PeripheralError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(PeripheralError::StopFailed("radio gone".to_string()));
            }
            Ok(())
        }
    }

    fn services_with(chars: &[(u128, CharacteristicProps)]) -> Vec<ServiceDescriptor> {
        let mut service = ServiceDescriptor::new(uuid(0x51), "mirrored");
        for (n, props) in chars {
            service = service
                .with_characteristic(CharacteristicDescriptor::new(uuid(*n), *props));
        }
        vec![service]
    }

    fn read_write_props() -> CharacteristicProps {
        CharacteristicProps {
            read: true,
            write: true,
            notify: true,
            ..Default::default()
        }
    }

    struct Harness {
        central: Arc<FakeCentral>,
        peripheral: Arc<FakePeripheral>,
        requests: mpsc::Sender<PeripheralRequest>,
        central_events: mpsc::UnboundedSender<CentralEvent>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<Result<(), RelayError>>,
    }

    fn start_engine(central: FakeCentral, chars: &[(u128, CharacteristicProps)]) -> Harness {
        let central = Arc::new(central);
        let (peripheral, requests) = FakePeripheral::new();
        let services = services_with(chars);
        let mirror =
            build_mirror(&services, MirrorPolicy::AllServices, "relay").expect("mirror");
        let session = Arc::new(
            RelaySession::new(TargetHandle::new(ADDR), services, &mirror).expect("session"),
        );

        let engine = RelayEngine::new(
            central.clone(),
            peripheral.clone(),
            session,
            mirror,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(events_rx, shutdown_rx));

        Harness {
            central,
            peripheral,
            requests,
            central_events: events_tx,
            shutdown: shutdown_tx,
            handle,
        }
    }

    async fn settle() {
        // Paused clock: the timer only fires once every other task is idle
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_forwards_exact_bytes() {
        let central = FakeCentral::new();
        central.set_value(uuid(0xC1), &[0xDE, 0xAD, 0xBE, 0xEF]);
        let h = start_engine(central, &[(0xC1, read_write_props())]);

        let (tx, rx) = oneshot::channel();
        h.requests
            .send(PeripheralRequest::Read {
                uuid: uuid(0xC1),
                respond: tx,
            })
            .await
            .expect("send request");

        let value = rx.await.expect("responder").expect("read ok");
        assert_eq!(value, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        h.shutdown.send(true).expect("signal shutdown");
        assert!(h.handle.await.expect("join").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_delivers_exact_payload() {
        let h = start_engine(FakeCentral::new(), &[(0xC1, read_write_props())]);

        let (tx, rx) = oneshot::channel();
        h.requests
            .send(PeripheralRequest::Write {
                uuid: uuid(0xC1),
                value: vec![0x01, 0x02, 0x03],
                respond: tx,
            })
            .await
            .expect("send request");

        rx.await.expect("responder").expect("write acked");
        assert_eq!(
            *h.central.writes.lock(),
            vec![(uuid(0xC1), vec![0x01, 0x02, 0x03])]
        );

        h.shutdown.send(true).expect("signal shutdown");
        assert!(h.handle.await.expect("join").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_uuid_rejected_without_crash() {
        let h = start_engine(FakeCentral::new(), &[(0xC1, read_write_props())]);

        let (tx, rx) = oneshot::channel();
        h.requests
            .send(PeripheralRequest::Read {
                uuid: uuid(0xFF),
                respond: tx,
            })
            .await
            .expect("send request");

        let outcome = rx.await.expect("responder");
        assert_eq!(
            outcome,
            Err(ForwardError::UnknownCharacteristic(uuid(0xFF)))
        );

        // Engine still relays after the rejection
        let (tx, rx) = oneshot::channel();
        h.central.set_value(uuid(0xC1), &[0x42]);
        h.requests
            .send(PeripheralRequest::Read {
                uuid: uuid(0xC1),
                respond: tx,
            })
            .await
            .expect("send request");
        assert_eq!(rx.await.expect("responder").expect("read ok"), vec![0x42]);

        h.shutdown.send(true).expect("signal shutdown");
        assert!(h.handle.await.expect("join").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_uuid_requests_are_serialized() {
        let central = FakeCentral::gated();
        central.set_value(uuid(0xC1), &[0x01]);
        let h = start_engine(central, &[(0xC1, read_write_props())]);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        for tx in [tx1, tx2] {
            h.requests
                .send(PeripheralRequest::Read {
                    uuid: uuid(0xC1),
                    respond: tx,
                })
                .await
                .expect("send request");
        }
        settle().await;

        // The second read must not reach the driver while the first holds the
        // characteristic slot
        assert_eq!(h.central.ops_started.load(Ordering::SeqCst), 1);

        h.central.release(1);
        let first = rx1.await.expect("responder").expect("read ok");
        assert_eq!(first, vec![0x01]);

        h.central.release(1);
        let second = rx2.await.expect("responder").expect("read ok");
        assert_eq!(second, vec![0x01]);

        h.shutdown.send(true).expect("signal shutdown");
        assert!(h.handle.await.expect("join").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_same_uuid_writes_forward_in_delivery_order() {
        let h = start_engine(FakeCentral::new(), &[(0xC1, read_write_props())]);

        // Both writes are queued before the engine drains them; the target
        // must see them in the order they were delivered
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        h.requests
            .send(PeripheralRequest::Write {
                uuid: uuid(0xC1),
                value: vec![0x01],
                respond: tx1,
            })
            .await
            .expect("send first write");
        h.requests
            .send(PeripheralRequest::Write {
                uuid: uuid(0xC1),
                value: vec![0x02],
                respond: tx2,
            })
            .await
            .expect("send second write");

        rx1.await.expect("responder").expect("first write acked");
        rx2.await.expect("responder").expect("second write acked");
        assert_eq!(
            *h.central.writes.lock(),
            vec![(uuid(0xC1), vec![0x01]), (uuid(0xC1), vec![0x02])]
        );

        h.shutdown.send(true).expect("signal shutdown");
        assert!(h.handle.await.expect("join").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_uuids_proceed_concurrently() {
        let central = FakeCentral::gated();
        central.set_value(uuid(0xC1), &[0x01]);
        central.set_value(uuid(0xC2), &[0x02]);
        let h = start_engine(
            central,
            &[(0xC1, read_write_props()), (0xC2, read_write_props())],
        );

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        h.requests
            .send(PeripheralRequest::Read {
                uuid: uuid(0xC1),
                respond: tx1,
            })
            .await
            .expect("send request");
        h.requests
            .send(PeripheralRequest::Read {
                uuid: uuid(0xC2),
                respond: tx2,
            })
            .await
            .expect("send request");
        settle().await;

        // Both in flight at once: neither characteristic blocked the other
        assert_eq!(h.central.ops_started.load(Ordering::SeqCst), 2);

        h.central.release(2);
        assert_eq!(rx1.await.expect("responder").expect("ok"), vec![0x01]);
        assert_eq!(rx2.await.expect("responder").expect("ok"), vec![0x02]);

        h.shutdown.send(true).expect("signal shutdown");
        assert!(h.handle.await.expect("join").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_relayed_unchanged() {
        let h = start_engine(FakeCentral::new(), &[(0xC1, read_write_props())]);
        settle().await;

        // Engine subscribed for the notify-flagged characteristic
        assert_eq!(*h.central.subscriptions.lock(), vec![uuid(0xC1)]);

        h.central_events
            .send(CentralEvent::Notification {
                uuid: uuid(0xC1),
                value: vec![0xAA, 0xBB],
            })
            .expect("send event");
        settle().await;

        assert_eq!(
            *h.peripheral.notifications.lock(),
            vec![(uuid(0xC1), vec![0xAA, 0xBB])]
        );

        h.shutdown.send(true).expect("signal shutdown");
        assert!(h.handle.await.expect("join").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_drains_in_flight_with_errors() {
        let central = FakeCentral::gated();
        central.set_value(uuid(0xC1), &[0x01]);
        let h = start_engine(central, &[(0xC1, read_write_props())]);

        let (tx, rx) = oneshot::channel();
        h.requests
            .send(PeripheralRequest::Read {
                uuid: uuid(0xC1),
                respond: tx,
            })
            .await
            .expect("send request");
        settle().await;

        // Link drops while the read is in flight
        h.central.link_down.store(true, Ordering::SeqCst);
        h.central_events
            .send(CentralEvent::LinkLost)
            .expect("send event");
        h.central.release(1);

        let outcome = rx.await.expect("responder");
        assert!(matches!(outcome, Err(ForwardError::Central(_))));

        let result = h.handle.await.expect("join");
        assert!(matches!(result, Err(RelayError::LinkLost)));

        // Best-effort advertising stop happened during drain
        assert_eq!(h.peripheral.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_forward_on_dead_link_triggers_drain() {
        let central = FakeCentral::new();
        central.link_down.store(true, Ordering::SeqCst);
        let h = start_engine(central, &[(0xC1, read_write_props())]);

        let (tx, rx) = oneshot::channel();
        h.requests
            .send(PeripheralRequest::Read {
                uuid: uuid(0xC1),
                respond: tx,
            })
            .await
            .expect("send request");

        assert!(matches!(
            rx.await.expect("responder"),
            Err(ForwardError::Central(_))
        ));

        // The failed forward alone must drive the engine down, without any
        // LinkLost event from the driver
        let result = h.handle.await.expect("join");
        assert!(matches!(result, Err(RelayError::LinkLost)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_requests_rejected_during_drain() {
        let central = FakeCentral::gated();
        central.set_value(uuid(0xC1), &[0x01]);
        let h = start_engine(central, &[(0xC1, read_write_props())]);

        // One in flight, one queued behind it on the same characteristic
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        for tx in [tx1, tx2] {
            h.requests
                .send(PeripheralRequest::Read {
                    uuid: uuid(0xC1),
                    respond: tx,
                })
                .await
                .expect("send request");
        }
        settle().await;

        h.shutdown.send(true).expect("signal shutdown");
        settle().await;

        // Request arriving after the shutdown signal is rejected
        let (tx3, rx3) = oneshot::channel();
        if h.requests
            .send(PeripheralRequest::Read {
                uuid: uuid(0xC1),
                respond: tx3,
            })
            .await
            .is_ok()
        {
            assert_eq!(rx3.await.expect("responder"), Err(ForwardError::ShuttingDown));
        }

        // The in-flight request completes; the one queued behind it is
        // rejected instead of forwarded
        h.central.release(1);
        assert!(rx1.await.expect("responder").is_ok());
        assert_eq!(rx2.await.expect("responder"), Err(ForwardError::ShuttingDown));

        assert!(h.handle.await.expect("join").is_ok());
        assert_eq!(h.peripheral.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_failure_tolerated() {
        let h = start_engine(FakeCentral::new(), &[(0xC1, read_write_props())]);
        h.peripheral.fail_stop.store(true, Ordering::SeqCst);

        h.shutdown.send(true).expect("signal shutdown");
        // A failing stop must not turn a clean shutdown into an error
        assert!(h.handle.await.expect("join").is_ok());
        assert_eq!(h.peripheral.stop_calls.load(Ordering::SeqCst), 1);
    }
}
