//! Central-role radio abstraction
//!
//! The connection state machine only ever talks to the radio through the
//! [`Central`] trait and the [`RadioEvent`] stream it hands out:
//!
//! - [`ble::BleCentral`] - host Bluetooth adapter via `btleplug` (requires `ble` feature)
//! - [`MockCentral`](crate::test_utils::MockCentral) - scripted radio for tests
//!
//! # Feature Requirements
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```

#[cfg(feature = "ble")]
mod ble;
#[cfg(feature = "ble")]
pub use ble::BleCentral;

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Bluetooth base UUID, the 128-bit form of every 16-bit assigned number
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit UUID (e.g. `0xffe0`) to its 128-bit form
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Trait for central-role radio backends
///
/// All operations are issued by the meter service; their completion is fed
/// back into the state machine as a separate event. Implementations must not
/// block the caller.
#[async_trait]
pub trait Central: Send + Sync + 'static {
    /// Subscribe to radio events
    ///
    /// Called once by the service before any other operation.
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<RadioEvent>>;

    /// Start scanning for advertisements (idempotent)
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a discovered peripheral
    async fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Discover the characteristics of `service` on a connected peripheral
    async fn discover(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicHandle>>;

    /// Write without response
    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()>;

    /// Drop the radio-level connection
    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Get the backend name (for logging)
    fn name(&self) -> &str;
}

/// Radio power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Adapter is on and usable
    PoweredOn,
    /// Adapter is off
    PoweredOff,
    /// Anything else reported by the platform (resetting, unauthorized, ...)
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::PoweredOn => write!(f, "poweredOn"),
            PowerState::PoweredOff => write!(f, "poweredOff"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Events delivered by a central backend
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Adapter power state changed
    PowerChanged(PowerState),
    /// An advertisement was received
    Discovered(Advertisement),
    /// Scanning started (by this process or another consumer)
    ScanStarted,
    /// Scanning stopped (by this process or another consumer)
    ScanStopped,
    /// Non-fatal backend warning
    Warning(String),
    /// A peripheral dropped its connection
    Disconnected(PeripheralId),
}

/// Platform identifier of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    /// Create from any string-like identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Advertisement data the machine filters on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertising peripheral
    pub id: PeripheralId,
    /// Advertised local name
    pub local_name: Option<String>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
}

/// A discovered peripheral held by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Platform identifier
    pub id: PeripheralId,
    /// Advertised local name
    pub name: String,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
}

impl PeripheralHandle {
    /// Build from an advertisement
    pub fn from_advertisement(adv: &Advertisement) -> Self {
        Self {
            id: adv.id.clone(),
            name: adv.local_name.clone().unwrap_or_default(),
            service_uuids: adv.service_uuids.clone(),
        }
    }
}

/// A characteristic discovered on a connected peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Owning service UUID
    pub service_uuid: Uuid,
    /// Supports write or write-without-response
    pub writable: bool,
}
