//! Divergence Meter BLE Controller
//!
//! This crate keeps a single Divergence nixie-style display connected over
//! Bluetooth Low Energy and drives it with short ASCII commands.
//!
//! # Architecture
//!
//! The controller operates in four layers:
//!
//! 1. **Command Encoding** - Display features → fixed 18-byte `*`-padded frames
//! 2. **Connection State Machine** - Scan, connect, discover, reconnect (sans-IO)
//! 3. **Service** - Drives the machine against a [`Central`] radio backend
//! 4. **Accessory** - Active switch, input sources and the auto-off timer
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `ble` feature to use BleCentral
//! // Cargo.toml: divergence-meter = { version = "0.1", features = ["ble"] }
//!
//! use divergence_meter::{BleCentral, Meter, MeterConfigBuilder, MeterService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeterConfigBuilder::new()
//!         .rescan_delay(std::time::Duration::from_secs(3))
//!         .build();
//!
//!     let central =
//!         BleCentral::new(vec![config.device.service_uuid], config.device.name.clone()).await?;
//!     let central = Arc::new(central);
//!     let (service, meter) = MeterService::new(central, &config);
//!     tokio::spawn(service.run());
//!
//!     meter.wait_connected().await?;
//!     meter.sync_time()?;
//!     meter.worldline_mode(0, "1.048596")?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `ble` - Host Bluetooth adapter backend (requires `btleplug`)
//!
//! # Connection Lifecycle
//!
//! 1. Radio powers on → scan intent set, scan started
//! 2. Advertisement named `Divergence` with exactly the `ffe0` service → connect
//! 3. Connected → discover the writable `ffe1` characteristic
//! 4. Characteristic found → disconnect observer registered, writes accepted
//! 5. Disconnect, connect failure or discovery failure → release and rescan
//!
//! A scan stopped by another consumer of the radio while this controller
//! still wants to scan is restarted after the configured rescan delay.
//!
//! # Wire Format
//!
//! Every command is written as exactly **18 bytes** of ASCII, padded with
//! `*`, in a single write without response.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod accessory;
pub mod central;
pub mod command;
pub mod config;
pub mod error;
pub mod machine;
pub mod meter;
pub mod service;
pub mod test_utils;
pub mod timer;

pub use accessory::{InputSource, MeterAccessory};
pub use central::{
    uuid_from_u16, Advertisement, Central, CharacteristicHandle, PeripheralHandle, PeripheralId,
    PowerState, RadioEvent,
};
pub use command::{encode, Command, CommandFrame, TimeLayout};
pub use config::{AutoOffConfig, DeviceProfile, MeterConfig, MeterConfigBuilder, ReconnectConfig};
pub use error::{MeterError, Result};
pub use machine::{Action, ConnectionMachine, ConnectionState, LinkStatus, ObserverToken};
pub use meter::Meter;
pub use service::{MeterHandle, MeterService};
pub use timer::{AutoOffTimer, Countdown, Tick, TimerPhase};

#[cfg(feature = "ble")]
pub use central::BleCentral;

pub use test_utils::{MockCentral, TestFixture};

// Protocol constants re-exports
pub use config::{
    CHARACTERISTIC_UUID, COMMAND_FRAME_LEN, DEFAULT_AUTO_OFF_RETRY_SECS, DEFAULT_AUTO_OFF_SECS,
    DEFAULT_RESCAN_DELAY_MS, DEVICE_NAME, PADDING_BYTE, SERVICE_UUID,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
