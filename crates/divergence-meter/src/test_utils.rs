//! Test utilities for exercising the meter without a Bluetooth adapter
//!
//! [`MockCentral`] is a scripted [`Central`]: tests push radio events into it,
//! choose which operations fail, and inspect what the service asked the radio
//! to do.
//!
//! # Example
//!
//! ```rust,ignore
//! use divergence_meter::test_utils::TestFixture;
//! use divergence_meter::Meter;
//!
//! #[tokio::test]
//! async fn writes_reach_the_radio() {
//!     let fixture = TestFixture::new();
//!     let (meter, _task) = fixture.start();
//!     fixture.connect(&meter).await;
//!
//!     meter.gyro_mode().unwrap();
//! }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::central::{
    Advertisement, Central, CharacteristicHandle, PeripheralId, PowerState, RadioEvent,
};
use crate::config::{MeterConfig, MeterConfigBuilder, CHARACTERISTIC_UUID, DEVICE_NAME, SERVICE_UUID};
use crate::error::{MeterError, Result};
use crate::service::{MeterHandle, MeterService};

#[derive(Debug, Default)]
struct MockState {
    scanning: bool,
    scan_starts: usize,
    scan_stops: usize,
    connects: Vec<PeripheralId>,
    disconnects: Vec<PeripheralId>,
    written: Vec<(PeripheralId, Vec<u8>)>,
    failing_connects: usize,
    failing_discoveries: usize,
    characteristics: Option<Vec<CharacteristicHandle>>,
    missing_characteristic: bool,
    scan_start_delay: Duration,
}

/// Mock central for testing without hardware
#[derive(Debug)]
pub struct MockCentral {
    event_tx: mpsc::UnboundedSender<RadioEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<RadioEvent>>>,
    state: Mutex<MockState>,
}

impl Default for MockCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCentral {
    /// Create a new mock central
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Deliver a radio event to the subscriber
    pub fn emit(&self, event: RadioEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Simulate the peripheral dropping the connection
    pub fn drop_connection(&self, id: &str) {
        self.emit(RadioEvent::Disconnected(PeripheralId::new(id)));
    }

    /// Simulate another consumer stopping the shared scan
    pub fn external_scan_stop(&self) {
        self.state.lock().scanning = false;
        self.emit(RadioEvent::ScanStopped);
    }

    /// Make the next `n` connects fail
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().failing_connects = n;
    }

    /// Make the next `n` discoveries fail
    pub fn fail_next_discoveries(&self, n: usize) {
        self.state.lock().failing_discoveries = n;
    }

    /// Characteristics returned by discovery (default: the command characteristic)
    pub fn set_characteristics(&self, characteristics: Vec<CharacteristicHandle>) {
        self.state.lock().characteristics = Some(characteristics);
    }

    /// Report the command characteristic as missing on write
    pub fn missing_characteristic_on_write(&self, missing: bool) {
        self.state.lock().missing_characteristic = missing;
    }

    /// Make each scan start take `delay` before it returns
    pub fn delay_scan_starts(&self, delay: Duration) {
        self.state.lock().scan_start_delay = delay;
    }

    /// Number of scan starts requested
    pub fn scan_starts(&self) -> usize {
        self.state.lock().scan_starts
    }

    /// Number of scan stops requested
    pub fn scan_stops(&self) -> usize {
        self.state.lock().scan_stops
    }

    /// Peripherals a connect was requested for
    pub fn connects(&self) -> Vec<PeripheralId> {
        self.state.lock().connects.clone()
    }

    /// Peripherals a disconnect was requested for
    pub fn disconnects(&self) -> Vec<PeripheralId> {
        self.state.lock().disconnects.clone()
    }

    /// Raw frames written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .written
            .iter()
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Written frames as command text with padding removed
    pub fn written_commands(&self) -> Vec<String> {
        self.written()
            .iter()
            .map(|frame| {
                String::from_utf8_lossy(frame)
                    .trim_end_matches('*')
                    .to_string()
            })
            .collect()
    }

    /// Advertisement of a meter with the given id
    pub fn meter_advertisement(id: &str) -> Advertisement {
        Advertisement {
            id: PeripheralId::new(id),
            local_name: Some(DEVICE_NAME.to_string()),
            service_uuids: vec![SERVICE_UUID],
        }
    }

    /// Advertisement of an unrelated device
    pub fn other_advertisement(id: &str, name: &str, services: Vec<Uuid>) -> Advertisement {
        Advertisement {
            id: PeripheralId::new(id),
            local_name: Some(name.to_string()),
            service_uuids: services,
        }
    }

    /// The writable command characteristic
    pub fn command_characteristic() -> CharacteristicHandle {
        CharacteristicHandle {
            uuid: CHARACTERISTIC_UUID,
            service_uuid: SERVICE_UUID,
            writable: true,
        }
    }
}

#[async_trait]
impl Central for MockCentral {
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<RadioEvent>> {
        self.event_rx
            .lock()
            .take()
            .ok_or_else(|| MeterError::Radio("events already subscribed".to_string()))
    }

    async fn start_scan(&self) -> Result<()> {
        let delay = self.state.lock().scan_start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let started = {
            let mut state = self.state.lock();
            state.scan_starts += 1;
            !std::mem::replace(&mut state.scanning, true)
        };
        if started {
            self.emit(RadioEvent::ScanStarted);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let stopped = {
            let mut state = self.state.lock();
            state.scan_stops += 1;
            std::mem::replace(&mut state.scanning, false)
        };
        if stopped {
            self.emit(RadioEvent::ScanStopped);
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        let mut state = self.state.lock();
        state.connects.push(peripheral.clone());
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(MeterError::ConnectFailed {
                peripheral: peripheral.to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        Ok(())
    }

    async fn discover(
        &self,
        peripheral: &PeripheralId,
        _service: Uuid,
    ) -> Result<Vec<CharacteristicHandle>> {
        let mut state = self.state.lock();
        if state.failing_discoveries > 0 {
            state.failing_discoveries -= 1;
            return Err(MeterError::DiscoveryFailed(format!(
                "simulated failure on {peripheral}"
            )));
        }
        Ok(state
            .characteristics
            .clone()
            .unwrap_or_else(|| vec![Self::command_characteristic()]))
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.missing_characteristic {
            return Err(MeterError::CharacteristicMissing(characteristic.uuid));
        }
        state.written.push((peripheral.clone(), data.to_vec()));
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.state.lock().disconnects.push(peripheral.clone());
        self.emit(RadioEvent::Disconnected(peripheral.clone()));
        Ok(())
    }

    fn name(&self) -> &str {
        "MockCentral"
    }
}

/// Test fixture for creating pre-configured test scenarios
pub struct TestFixture {
    /// Mock radio
    pub central: Arc<MockCentral>,
    /// Test configuration
    pub config: MeterConfig,
}

impl TestFixture {
    /// Create a basic test fixture with a short rescan delay
    pub fn new() -> Self {
        Self {
            central: Arc::new(MockCentral::new()),
            config: MeterConfigBuilder::new()
                .rescan_delay(Duration::from_millis(100))
                .build(),
        }
    }

    /// Create with auto-off enabled
    pub fn with_auto_off(duration_secs: u32, retry_delay_secs: u32) -> Self {
        let mut fixture = Self::new();
        fixture.config.auto_off.enabled = true;
        fixture.config.auto_off.duration_secs = duration_secs;
        fixture.config.auto_off.retry_delay_secs = retry_delay_secs;
        fixture
    }

    /// Spawn a service on the mock central
    pub fn start(&self) -> (MeterHandle, JoinHandle<Result<()>>) {
        let (service, handle) = MeterService::new(Arc::clone(&self.central), &self.config);
        (handle, service.spawn())
    }

    /// Power the radio on, advertise a meter and wait for the link
    pub async fn connect(&self, meter: &MeterHandle) {
        self.central
            .emit(RadioEvent::PowerChanged(PowerState::PoweredOn));
        self.central
            .emit(RadioEvent::Discovered(MockCentral::meter_advertisement("meter")));
        if let Err(e) = meter.wait_connected().await {
            debug!("Service stopped before connecting: {}", e);
        }
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
