//! btleplug-backed central-role driver
//!
//! Adapts the host Bluetooth adapter to the core `CentralDriver` boundary:
//! scan until the target address appears, connect, and translate btleplug
//! services, notifications, and disconnect events into core types.

use async_trait::async_trait;
use blerelay_core::{
    CentralDriver, CentralError, CentralEvent, CharacteristicDescriptor, CharacteristicProps,
    ServiceDescriptor,
};
use btleplug::api::{
    Central as _, CentralEvent as AdapterEvent, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// How long to scan for the target before giving up on one connect attempt
const SCAN_TIMEOUT: Duration = Duration::from_secs(15);
/// Poll interval while scanning
const SCAN_POLL: Duration = Duration::from_secs(1);

/// Central-role driver over the first host Bluetooth adapter
pub struct BtleplugCentral {
    adapter: Adapter,
    connected: Mutex<Option<Peripheral>>,
}

impl BtleplugCentral {
    /// Bind to the first available host adapter
    pub async fn new() -> Result<Self, CentralError> {
        let manager = Manager::new()
            .await
            .map_err(|e| CentralError::ConnectFailed(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| CentralError::ConnectFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| CentralError::ConnectFailed("no Bluetooth adapter".to_string()))?;
        Ok(Self {
            adapter,
            connected: Mutex::new(None),
        })
    }

    fn current(&self) -> Result<Peripheral, CentralError> {
        self.connected.lock().clone().ok_or(CentralError::NotConnected)
    }

    fn characteristic(
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, CentralError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(CentralError::UnknownCharacteristic(uuid))
    }

    /// Scan until a peripheral matching `address` shows up.
    ///
    /// Matches the advertised BLE address first and falls back to the
    /// platform peripheral id, which stands in for the address on hosts that
    /// hide it.
    async fn find_target(&self, address: &str) -> Result<Peripheral, CentralError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| CentralError::ConnectFailed(e.to_string()))?;

        let deadline = Instant::now() + SCAN_TIMEOUT;
        let found = loop {
            let peripherals = self
                .adapter
                .peripherals()
                .await
                .map_err(|e| CentralError::ConnectFailed(e.to_string()))?;

            let mut matched = None;
            for peripheral in peripherals {
                if peripheral.id().to_string().eq_ignore_ascii_case(address) {
                    matched = Some(peripheral);
                    break;
                }
                if let Ok(Some(props)) = peripheral.properties().await {
                    if props.address.to_string().eq_ignore_ascii_case(address) {
                        matched = Some(peripheral);
                        break;
                    }
                }
            }
            if let Some(peripheral) = matched {
                break peripheral;
            }

            if Instant::now() >= deadline {
                let _ = self.adapter.stop_scan().await;
                return Err(CentralError::ConnectFailed(format!(
                    "target {address} not seen within {}s",
                    SCAN_TIMEOUT.as_secs()
                )));
            }
            sleep(SCAN_POLL).await;
        };

        if let Err(err) = self.adapter.stop_scan().await {
            warn!(%err, "stop scan failed");
        }
        Ok(found)
    }

    /// Fan adapter disconnects and characteristic notifications into one
    /// event stream for the relay.
    async fn spawn_event_pump(
        &self,
        peripheral: &Peripheral,
        tx: mpsc::UnboundedSender<CentralEvent>,
    ) -> Result<(), CentralError> {
        let target_id = peripheral.id();
        let mut adapter_events = self
            .adapter
            .events()
            .await
            .map_err(|e| CentralError::ConnectFailed(e.to_string()))?;
        let disconnect_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let AdapterEvent::DeviceDisconnected(id) = event {
                    if id == target_id {
                        let _ = disconnect_tx.send(CentralEvent::LinkLost);
                        break;
                    }
                }
            }
        });

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| CentralError::SubscribeFailed(e.to_string()))?;
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let delivered = tx.send(CentralEvent::Notification {
                    uuid: notification.uuid,
                    value: notification.value,
                });
                if delivered.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl CentralDriver for BtleplugCentral {
    async fn connect(
        &self,
        address: &str,
    ) -> Result<mpsc::UnboundedReceiver<CentralEvent>, CentralError> {
        let peripheral = self.find_target(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| CentralError::ConnectFailed(e.to_string()))?;
        debug!(address, "btleplug connect complete");

        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_event_pump(&peripheral, tx).await?;
        *self.connected.lock() = Some(peripheral);
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        match self.current() {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn disconnect(&self) -> Result<(), CentralError> {
        let peripheral = self.connected.lock().take().ok_or(CentralError::NotConnected)?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| CentralError::ConnectFailed(e.to_string()))
    }

    async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>, CentralError> {
        let peripheral = self.current()?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| CentralError::DiscoveryFailed(e.to_string()))?;

        let services = peripheral
            .services()
            .into_iter()
            .map(|service| ServiceDescriptor {
                uuid: service.uuid,
                description: service.uuid.to_string(),
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicDescriptor::new(c.uuid, props_from_flags(c.properties)))
                    .collect(),
            })
            .collect();
        Ok(services)
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, CentralError> {
        let peripheral = self.current()?;
        let characteristic = Self::characteristic(&peripheral, uuid)?;
        peripheral
            .read(&characteristic)
            .await
            .map_err(|e| CentralError::ReadFailed(e.to_string()))
    }

    async fn write(&self, uuid: Uuid, value: &[u8]) -> Result<(), CentralError> {
        let peripheral = self.current()?;
        let characteristic = Self::characteristic(&peripheral, uuid)?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral
            .write(&characteristic, value, write_type)
            .await
            .map_err(|e| CentralError::WriteFailed(e.to_string()))
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<(), CentralError> {
        let peripheral = self.current()?;
        let characteristic = Self::characteristic(&peripheral, uuid)?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| CentralError::SubscribeFailed(e.to_string()))
    }
}

fn props_from_flags(flags: CharPropFlags) -> CharacteristicProps {
    CharacteristicProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_props_from_flags_mapping() {
        let flags = CharPropFlags::READ | CharPropFlags::NOTIFY;
        let props = props_from_flags(flags);
        assert!(props.read);
        assert!(props.notify);
        assert!(!props.write);
        assert!(!props.write_without_response);

        let flags = CharPropFlags::WRITE_WITHOUT_RESPONSE;
        let props = props_from_flags(flags);
        assert!(props.write_without_response);
        assert!(props.writable());
        assert!(!props.read);
    }
}
