//! Host Bluetooth adapter backend
//!
//! Uses the first adapter reported by `btleplug`. Adapter events are
//! translated into [`RadioEvent`]s on a forwarding task started by
//! [`Central::events`]. Every advertiser is reported, but only devices
//! advertising the meter's name are kept for later connects.
//!
//! On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{self, Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    Advertisement, Central, CharacteristicHandle, PeripheralId, PowerState, RadioEvent,
};
use crate::error::{MeterError, Result};

type PeripheralMap = Arc<Mutex<PeripheralCache<Peripheral>>>;

/// Platform peripherals that a connect may later be issued for
#[derive(Debug)]
struct PeripheralCache<P> {
    device_name: String,
    entries: HashMap<PeripheralId, P>,
}

impl<P: Clone> PeripheralCache<P> {
    fn new(device_name: String) -> Self {
        Self {
            device_name,
            entries: HashMap::new(),
        }
    }

    /// Record an advertiser; anything not named like the meter is dropped
    fn observe(&mut self, id: &PeripheralId, local_name: Option<&str>, device: P) {
        if local_name == Some(self.device_name.as_str()) {
            self.entries.insert(id.clone(), device);
        } else {
            self.entries.remove(id);
        }
    }

    fn get(&self, id: &PeripheralId) -> Option<P> {
        self.entries.get(id).cloned()
    }

    fn forget(&mut self, id: &PeripheralId) {
        self.entries.remove(id);
    }
}

/// Central backed by the host Bluetooth adapter
pub struct BleCentral {
    adapter: Adapter,
    adapter_name: String,
    scan_filter: Vec<Uuid>,
    peripherals: PeripheralMap,
    events_tx: Mutex<Option<mpsc::UnboundedSender<RadioEvent>>>,
}

impl BleCentral {
    /// Open the first Bluetooth adapter
    ///
    /// Scans are filtered to `scan_services` when non-empty. Only
    /// peripherals advertising `device_name` can be connected to.
    pub async fn new(scan_services: Vec<Uuid>, device_name: impl Into<String>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(MeterError::NoAdapter)?;
        let adapter_name = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| "bluetooth".to_string());
        info!(adapter = %adapter_name, "Using Bluetooth adapter");

        Ok(Self {
            adapter,
            adapter_name,
            scan_filter: scan_services,
            peripherals: Arc::new(Mutex::new(PeripheralCache::new(device_name.into()))),
            events_tx: Mutex::new(None),
        })
    }

    fn emit(&self, event: RadioEvent) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .get(id)
            .ok_or_else(|| MeterError::UnknownPeripheral(id.to_string()))
    }
}

#[async_trait]
impl Central for BleCentral {
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<RadioEvent>> {
        let mut stream = self.adapter.events().await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let initial = match self.adapter.adapter_state().await {
            Ok(state) => power_state(state),
            Err(e) => {
                warn!("Could not read adapter state, assuming powered on: {}", e);
                PowerState::PoweredOn
            }
        };
        let _ = tx.send(RadioEvent::PowerChanged(initial));
        *self.events_tx.lock() = Some(tx.clone());

        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let Some(event) = translate(&adapter, &peripherals, event).await else {
                    continue;
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            debug!("Adapter event stream ended");
        });

        Ok(rx)
    }

    async fn start_scan(&self) -> Result<()> {
        let filter = ScanFilter {
            services: self.scan_filter.clone(),
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| MeterError::ScanFailed(e.to_string()))?;
        self.emit(RadioEvent::ScanStarted);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| MeterError::ScanFailed(e.to_string()))?;
        self.emit(RadioEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        let device = self.peripheral(peripheral)?;
        if device.is_connected().await? {
            return Ok(());
        }
        device
            .connect()
            .await
            .map_err(|e| MeterError::ConnectFailed {
                peripheral: peripheral.to_string(),
                reason: e.to_string(),
            })
    }

    async fn discover(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicHandle>> {
        let device = self.peripheral(peripheral)?;
        device
            .discover_services()
            .await
            .map_err(|e| MeterError::DiscoveryFailed(e.to_string()))?;

        Ok(device
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service)
            .map(|c| characteristic_handle(&c))
            .collect())
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()> {
        let device = self.peripheral(peripheral)?;
        let target = device
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid
            })
            .ok_or(MeterError::CharacteristicMissing(characteristic.uuid))?;

        trace!(%peripheral, len = data.len(), "Writing without response");
        device
            .write(&target, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| MeterError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        let device = self.peripheral(peripheral)?;
        self.peripherals.lock().forget(peripheral);
        device.disconnect().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.adapter_name
    }
}

async fn translate(
    adapter: &Adapter,
    peripherals: &PeripheralMap,
    event: CentralEvent,
) -> Option<RadioEvent> {
    match event {
        CentralEvent::StateUpdate(state) => Some(RadioEvent::PowerChanged(power_state(state))),
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
            match advertisement(adapter, peripherals, &id).await {
                Ok(adv) => adv.map(RadioEvent::Discovered),
                Err(e) => Some(RadioEvent::Warning(format!(
                    "could not read properties of {id}: {e}"
                ))),
            }
        }
        CentralEvent::DeviceDisconnected(id) => Some(RadioEvent::Disconnected(peripheral_id(&id))),
        _ => None,
    }
}

async fn advertisement(
    adapter: &Adapter,
    peripherals: &PeripheralMap,
    id: &platform::PeripheralId,
) -> Result<Option<Advertisement>> {
    let device = adapter.peripheral(id).await?;
    let Some(properties) = device.properties().await? else {
        return Ok(None);
    };

    let id = peripheral_id(id);
    peripherals
        .lock()
        .observe(&id, properties.local_name.as_deref(), device);

    Ok(Some(Advertisement {
        id,
        local_name: properties.local_name,
        service_uuids: properties.services,
    }))
}

fn peripheral_id(id: &platform::PeripheralId) -> PeripheralId {
    PeripheralId::new(id.to_string())
}

fn power_state(state: CentralState) -> PowerState {
    match state {
        CentralState::PoweredOn => PowerState::PoweredOn,
        CentralState::PoweredOff => PowerState::PoweredOff,
        _ => PowerState::Unknown,
    }
}

fn characteristic_handle(c: &Characteristic) -> CharacteristicHandle {
    CharacteristicHandle {
        uuid: c.uuid,
        service_uuid: c.service_uuid,
        writable: c
            .properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
    }
}
