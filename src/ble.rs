//! `btleplug` implementation of [`BleBackend`] / [`BleLink`].
//!
//! One adapter is opened lazily on first use and reused for every scan and
//! connect.  Peripherals seen by the latest scan are remembered by id so a
//! later reconnect can reach the same device without scanning again.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{BleBackend, BleLink, DiscoveredDevice, Notifications};

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

// ── BtleplugBackend ───────────────────────────────────────────────────────────

pub struct BtleplugBackend {
    notify_uuid: Uuid,
    control_uuid: Uuid,
    connect_timeout: Duration,
    adapter: Mutex<Option<Adapter>>,
    peripherals: Mutex<HashMap<String, Peripheral>>,
}

impl BtleplugBackend {
    pub fn new(notify_uuid: Uuid, control_uuid: Uuid, connect_timeout: Duration) -> Self {
        Self {
            notify_uuid,
            control_uuid,
            connect_timeout,
            adapter: Mutex::new(None),
            peripherals: Mutex::new(HashMap::new()),
        }
    }

    async fn adapter(&self) -> Result<Adapter, TransportError> {
        let mut slot = self.adapter.lock().await;
        if let Some(adapter) = slot.as_ref() {
            return Ok(adapter.clone());
        }

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        // CoreBluetooth starts in an "unknown" state; scanning before it
        // reports PoweredOn is a silent no-op.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("macOS: adapter still {state:?} after 3 s, proceeding anyway");
                            break;
                        }
                        debug!("macOS: adapter state = {state:?}, waiting…");
                    }
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        *slot = Some(adapter.clone());
        Ok(adapter)
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let adapter = self.adapter().await?;

        debug!("scan: listening for {} ms", duration.as_millis());
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;
        adapter.stop_scan().await.ok();

        let mut found = Vec::new();
        let mut known = self.peripherals.lock().await;
        for p in adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    let id = p.id().to_string();
                    debug!("scan: saw {name}  id={id}");
                    known.insert(id.clone(), p);
                    found.push(DiscoveredDevice { name, id });
                }
            }
        }
        debug!("scan: {} named device(s)", found.len());
        Ok(found)
    }

    async fn connect(
        &self,
        device: &DiscoveredDevice,
    ) -> Result<Box<dyn BleLink>, TransportError> {
        let adapter = self.adapter().await?;
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(&device.id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(device.id.clone()))?;

        // BlueZ's Device1.Connect can block forever when the device is out of range.
        tokio::time::timeout(self.connect_timeout, peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout("connect"))??;

        // BlueZ reports the connection before the GATT cache is populated.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout("discover_services"))??;
        info!("Connected and services discovered: {}", device.name);

        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let find_char = |uuid: Uuid| -> Result<Characteristic, TransportError> {
            chars
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or(TransportError::CharacteristicNotFound(uuid))
        };

        let (notify_char, control_char) =
            match (find_char(self.notify_uuid), find_char(self.control_uuid)) {
                (Ok(n), Ok(c)) => (n, c),
                (Err(e), _) | (_, Err(e)) => {
                    peripheral.disconnect().await.ok();
                    return Err(e);
                }
            };

        Ok(Box::new(BtleplugLink {
            adapter,
            peripheral,
            notify_char,
            control_char,
        }))
    }
}

// ── BtleplugLink ──────────────────────────────────────────────────────────────

struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
    notify_char: Characteristic,
    control_char: Characteristic,
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn subscribe(&self) -> Result<Notifications, TransportError> {
        self.peripheral.subscribe(&self.notify_char).await?;
        let notifications = self.peripheral.notifications().await?;

        // The notification stream does not always end when the link drops, so
        // end it on the adapter's DeviceDisconnected event as well.
        let peripheral_id = self.peripheral.id();
        let disconnected = match self.adapter.events().await {
            Ok(mut events) => async move {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        if id == peripheral_id {
                            info!("Disconnect watcher: device {id:?} disconnected.");
                            break;
                        }
                    }
                }
            }
            .boxed(),
            Err(e) => {
                warn!("Disconnect watcher: could not subscribe to adapter events: {e}");
                futures::future::pending().boxed()
            }
        };

        let uuid = self.notify_char.uuid;
        let stream = notifications
            .filter_map(move |n| futures::future::ready((n.uuid == uuid).then_some(n.value)))
            .take_until(disconnected);
        Ok(stream.boxed())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.control_char, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.unsubscribe(&self.notify_char).await.ok();
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
