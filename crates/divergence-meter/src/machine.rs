//! Connection state machine
//!
//! Tracks the link to one named peripheral through
//! `Idle → Scanning → Connecting → DiscoveringServices → Connected` and back.
//! The machine performs no IO: every handler returns the [`Action`]s the
//! driver must carry out, and async completions come back in through the
//! `on_*_result` handlers.
//!
//! Scanning is tracked as an *intent* separate from what the radio is
//! actually doing. Other consumers of the same adapter start and stop scans
//! on their own; the machine never stops a scan it did not need to, and a
//! scan stop it did not cause is answered with a delayed rescan.

use std::fmt;
use std::mem;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::central::{
    Advertisement, CharacteristicHandle, PeripheralHandle, PeripheralId, PowerState, RadioEvent,
};
use crate::command::CommandFrame;
use crate::config::{DeviceProfile, MeterConfig};
use crate::error::{MeterError, Result};

/// Identifies one registration of a disconnect observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

/// Link state together with the handles valid in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not scanning and holding no peripheral
    Idle,
    /// Waiting for the target to advertise
    Scanning,
    /// Radio-level connect in flight
    Connecting {
        /// Peripheral being connected
        peripheral: PeripheralHandle,
    },
    /// Looking up the command characteristic
    DiscoveringServices {
        /// Connected peripheral
        peripheral: PeripheralHandle,
    },
    /// Ready for writes
    Connected {
        /// Connected peripheral
        peripheral: PeripheralHandle,
        /// Command characteristic
        characteristic: CharacteristicHandle,
        /// Registered disconnect observer
        observer: ObserverToken,
    },
}

/// Handle-free snapshot of [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Not scanning
    Idle,
    /// Scanning for the meter
    Scanning,
    /// Connecting
    Connecting,
    /// Discovering services
    DiscoveringServices,
    /// Ready for writes
    Connected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Idle => write!(f, "idle"),
            LinkStatus::Scanning => write!(f, "scanning"),
            LinkStatus::Connecting => write!(f, "connecting"),
            LinkStatus::DiscoveringServices => write!(f, "discovering services"),
            LinkStatus::Connected => write!(f, "connected"),
        }
    }
}

impl From<&ConnectionState> for LinkStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Idle => LinkStatus::Idle,
            ConnectionState::Scanning => LinkStatus::Scanning,
            ConnectionState::Connecting { .. } => LinkStatus::Connecting,
            ConnectionState::DiscoveringServices { .. } => LinkStatus::DiscoveringServices,
            ConnectionState::Connected { .. } => LinkStatus::Connected,
        }
    }
}

/// Side effects requested by the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start (or keep) the radio scanning
    StartScan,
    /// Stop the radio scan
    StopScan,
    /// Connect to a peripheral; report via `on_connect_result`
    Connect(PeripheralId),
    /// Discover characteristics; report via `on_discover_result`
    Discover {
        /// Connected peripheral
        peripheral: PeripheralId,
        /// Service to search
        service: Uuid,
    },
    /// Register a one-shot disconnect observer; report via `on_peripheral_disconnected`
    ObserveDisconnect {
        /// Observed peripheral
        peripheral: PeripheralId,
        /// Token to report back
        token: ObserverToken,
    },
    /// Drop a previously registered disconnect observer
    ClearObserver {
        /// Observed peripheral
        peripheral: PeripheralId,
        /// Registered token
        token: ObserverToken,
    },
    /// Forget a peripheral, optionally dropping its radio connection
    Release {
        /// Released peripheral
        peripheral: PeripheralId,
        /// Also disconnect at radio level
        disconnect: bool,
    },
    /// Call `on_rescan_elapsed` after the delay
    ScheduleRescan(Duration),
    /// Cancel the pending rescan timer
    CancelRescan,
    /// Write a frame without response; report via `on_write_result`
    Write {
        /// Target peripheral
        peripheral: PeripheralId,
        /// Command characteristic
        characteristic: CharacteristicHandle,
        /// Encoded command
        frame: CommandFrame,
    },
}

/// Connection state machine for one meter
#[derive(Debug)]
pub struct ConnectionMachine {
    profile: DeviceProfile,
    rescan_delay: Duration,
    state: ConnectionState,
    powered: bool,
    scan_intent: bool,
    rescan_pending: bool,
    next_token: u64,
}

impl ConnectionMachine {
    /// Create an idle machine
    pub fn new(profile: DeviceProfile, rescan_delay: Duration) -> Self {
        debug!(?rescan_delay, device = %profile.name, "Creating connection machine");
        Self {
            profile,
            rescan_delay,
            state: ConnectionState::Idle,
            powered: false,
            scan_intent: false,
            rescan_pending: false,
            next_token: 0,
        }
    }

    /// Create from a meter configuration
    pub fn from_config(config: &MeterConfig) -> Self {
        Self::new(config.device.clone(), config.reconnect.rescan_delay)
    }

    /// Current state
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Current state without handles
    pub fn status(&self) -> LinkStatus {
        LinkStatus::from(&self.state)
    }

    /// Whether writes can be issued right now
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    /// Whether the machine wants the radio to be scanning
    pub fn scan_intent(&self) -> bool {
        self.scan_intent
    }

    /// Whether a delayed rescan is outstanding
    pub fn rescan_pending(&self) -> bool {
        self.rescan_pending
    }

    /// Peripheral held in the current state
    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        match &self.state {
            ConnectionState::Idle | ConnectionState::Scanning => None,
            ConnectionState::Connecting { peripheral }
            | ConnectionState::DiscoveringServices { peripheral }
            | ConnectionState::Connected { peripheral, .. } => Some(peripheral),
        }
    }

    /// Command characteristic, only while connected
    pub fn characteristic(&self) -> Option<&CharacteristicHandle> {
        match &self.state {
            ConnectionState::Connected { characteristic, .. } => Some(characteristic),
            _ => None,
        }
    }

    /// Dispatch a radio event to its handler
    ///
    /// [`RadioEvent::Disconnected`] is not handled here: the driver resolves
    /// it to an observer token and calls [`Self::on_peripheral_disconnected`].
    pub fn handle(&mut self, event: RadioEvent) -> Vec<Action> {
        match event {
            RadioEvent::PowerChanged(state) => self.on_power_changed(state),
            RadioEvent::Discovered(adv) => self.on_discovered(&adv),
            RadioEvent::ScanStarted => self.on_scan_started(),
            RadioEvent::ScanStopped => self.on_scan_stopped(),
            RadioEvent::Warning(message) => self.on_warning(&message),
            RadioEvent::Disconnected(id) => {
                trace!(peripheral = %id, "Radio disconnect without registered observer");
                Vec::new()
            }
        }
    }

    /// Adapter power state changed
    pub fn on_power_changed(&mut self, state: PowerState) -> Vec<Action> {
        let mut actions = Vec::new();
        if state == PowerState::PoweredOn {
            self.powered = true;
            self.start_scanning(&mut actions);
            return actions;
        }

        info!(%state, "Radio state changed");
        self.powered = false;
        self.scan_intent = false;
        self.cancel_rescan(&mut actions);
        if self.state == ConnectionState::Scanning {
            self.state = ConnectionState::Idle;
        }
        actions.push(Action::StopScan);
        actions
    }

    /// An advertisement was received
    pub fn on_discovered(&mut self, adv: &Advertisement) -> Vec<Action> {
        if !self.scan_intent || self.peripheral().is_some() {
            // Other consumers may keep scanning; their results are not ours to act on
            return Vec::new();
        }
        if adv.local_name.as_deref() != Some(self.profile.name.as_str()) {
            return Vec::new();
        }

        info!(peripheral = %adv.id, "Found {}", self.profile.name);
        if adv.service_uuids.as_slice() != [self.profile.service_uuid] {
            info!(
                services = ?adv.service_uuids,
                "Found {} but services do not match", self.profile.name
            );
            return Vec::new();
        }

        // Cleared before the connect resolves so duplicate advertisements are ignored
        self.scan_intent = false;

        let mut actions = Vec::new();
        self.cancel_rescan(&mut actions);

        let peripheral = PeripheralHandle::from_advertisement(adv);
        actions.push(Action::Connect(peripheral.id.clone()));
        self.state = ConnectionState::Connecting { peripheral };
        actions
    }

    /// Scanning started somewhere on the adapter
    pub fn on_scan_started(&mut self) -> Vec<Action> {
        debug!("On scan start (this process or another consumer)");
        Vec::new()
    }

    /// Scanning stopped somewhere on the adapter
    pub fn on_scan_stopped(&mut self) -> Vec<Action> {
        debug!("On scan stop (this process or another consumer)");
        let mut actions = Vec::new();
        if self.scan_intent && self.peripheral().is_none() && !self.rescan_pending {
            debug!(delay = ?self.rescan_delay, "Decided to restart scanning after delay");
            self.rescan_pending = true;
            actions.push(Action::ScheduleRescan(self.rescan_delay));
        }
        actions
    }

    /// Backend warning
    pub fn on_warning(&mut self, message: &str) -> Vec<Action> {
        info!(warning = message, "Radio warning");
        Vec::new()
    }

    /// The delayed rescan timer fired
    pub fn on_rescan_elapsed(&mut self) -> Vec<Action> {
        if !self.rescan_pending {
            return Vec::new();
        }
        self.rescan_pending = false;

        let mut actions = Vec::new();
        if self.scan_intent {
            self.start_scanning(&mut actions);
        } else {
            debug!("Rescan superseded");
        }
        actions
    }

    /// A connect issued by [`Action::Connect`] completed
    pub fn on_connect_result(&mut self, id: &PeripheralId, result: Result<()>) -> Vec<Action> {
        let peripheral = match &self.state {
            ConnectionState::Connecting { peripheral } if peripheral.id == *id => {
                peripheral.clone()
            }
            _ => {
                debug!(peripheral = %id, "Ignoring stale connect result");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        match result {
            Ok(()) => {
                info!(peripheral = %id, "Connected to {}", self.profile.name);
                actions.push(Action::Discover {
                    peripheral: id.clone(),
                    service: self.profile.service_uuid,
                });
                self.state = ConnectionState::DiscoveringServices { peripheral };
            }
            Err(e) => {
                error!(peripheral = %id, "Failed to connect: {}", e);
                self.release_and_rescan(false, &mut actions);
            }
        }
        actions
    }

    /// A discovery issued by [`Action::Discover`] completed
    pub fn on_discover_result(
        &mut self,
        id: &PeripheralId,
        result: Result<Vec<CharacteristicHandle>>,
    ) -> Vec<Action> {
        let peripheral = match &self.state {
            ConnectionState::DiscoveringServices { peripheral } if peripheral.id == *id => {
                peripheral.clone()
            }
            _ => {
                debug!(peripheral = %id, "Ignoring stale discovery result");
                return Vec::new();
            }
        };

        let wanted = self.profile.characteristic_uuid;
        let found = result.and_then(|characteristics| {
            characteristics
                .into_iter()
                .find(|c| c.uuid == wanted && c.writable)
                .ok_or(MeterError::CharacteristicMissing(wanted))
        });

        let mut actions = Vec::new();
        match found {
            Ok(characteristic) => {
                let token = self.next_observer_token();
                info!(peripheral = %id, characteristic = %characteristic.uuid, "Ready for commands");
                actions.push(Action::ObserveDisconnect {
                    peripheral: id.clone(),
                    token,
                });
                self.state = ConnectionState::Connected {
                    peripheral,
                    characteristic,
                    observer: token,
                };
            }
            Err(e) => {
                error!(peripheral = %id, "Service discovery failed: {}", e);
                self.release_and_rescan(true, &mut actions);
            }
        }
        actions
    }

    /// The disconnect observer registered with `token` fired
    pub fn on_peripheral_disconnected(&mut self, token: ObserverToken) -> Vec<Action> {
        match &self.state {
            ConnectionState::Connected { observer, .. } if *observer == token => {}
            _ => {
                debug!(?token, "Ignoring stale disconnect observer");
                return Vec::new();
            }
        }

        info!(
            "Disconnected from {} peripheral. Restart scanning...",
            self.profile.name
        );
        let mut actions = Vec::new();
        self.release_and_rescan(false, &mut actions);
        actions
    }

    /// Request a write of `frame`
    ///
    /// Returns [`MeterError::ServiceUnavailable`] without any action when not
    /// connected.
    pub fn write(&mut self, frame: CommandFrame) -> Result<Vec<Action>> {
        match &self.state {
            ConnectionState::Connected {
                peripheral,
                characteristic,
                ..
            } => Ok(vec![Action::Write {
                peripheral: peripheral.id.clone(),
                characteristic: characteristic.clone(),
                frame,
            }]),
            _ => {
                warn!(command = %frame.command(), "Cannot write to {}: not connected", self.profile.name);
                Err(MeterError::ServiceUnavailable)
            }
        }
    }

    /// A write issued by [`Action::Write`] completed
    ///
    /// A missing characteristic means the held handles are no longer valid;
    /// the link is dropped and scanning restarts.
    pub fn on_write_result(&mut self, id: &PeripheralId, result: Result<()>) -> Vec<Action> {
        let mut actions = Vec::new();
        match result {
            Ok(()) => trace!(peripheral = %id, "Write completed"),
            Err(MeterError::CharacteristicMissing(uuid)) => {
                let current = self.peripheral().map(|p| p.id == *id).unwrap_or(false);
                if current && self.is_connected() {
                    warn!(characteristic = %uuid, "Characteristic missing on write, rescanning");
                    self.release_and_rescan(true, &mut actions);
                }
            }
            Err(e) => warn!(peripheral = %id, "Write failed: {}", e),
        }
        actions
    }

    fn start_scanning(&mut self, actions: &mut Vec<Action>) {
        if self.peripheral().is_some() {
            debug!("Not actually start scanning: already holding a peripheral");
            return;
        }
        if !self.powered {
            debug!("Not actually start scanning: radio is not powered on");
            self.state = ConnectionState::Idle;
            return;
        }
        self.scan_intent = true;
        self.state = ConnectionState::Scanning;
        info!("Start scanning for {}...", self.profile.name);
        actions.push(Action::StartScan);
    }

    fn release_and_rescan(&mut self, disconnect: bool, actions: &mut Vec<Action>) {
        match mem::replace(&mut self.state, ConnectionState::Idle) {
            ConnectionState::Connected {
                peripheral,
                observer,
                ..
            } => {
                // Observer first, so it cannot fire for the next peripheral
                actions.push(Action::ClearObserver {
                    peripheral: peripheral.id.clone(),
                    token: observer,
                });
                actions.push(Action::Release {
                    peripheral: peripheral.id,
                    disconnect,
                });
            }
            ConnectionState::Connecting { peripheral }
            | ConnectionState::DiscoveringServices { peripheral } => {
                actions.push(Action::Release {
                    peripheral: peripheral.id,
                    disconnect,
                });
            }
            ConnectionState::Idle | ConnectionState::Scanning => {}
        }
        self.start_scanning(actions);
    }

    fn cancel_rescan(&mut self, actions: &mut Vec<Action>) {
        if self.rescan_pending {
            self.rescan_pending = false;
            actions.push(Action::CancelRescan);
        }
    }

    fn next_observer_token(&mut self) -> ObserverToken {
        self.next_token += 1;
        ObserverToken(self.next_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::uuid_from_u16;
    use crate::command::encode;
    use crate::config::{CHARACTERISTIC_UUID, DEVICE_NAME, SERVICE_UUID};

    const DELAY: Duration = Duration::from_millis(250);

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(DeviceProfile::default(), DELAY)
    }

    fn meter_adv(id: &str) -> Advertisement {
        Advertisement {
            id: PeripheralId::new(id),
            local_name: Some(DEVICE_NAME.to_string()),
            service_uuids: vec![uuid_from_u16(0xffe0)],
        }
    }

    fn command_characteristic() -> CharacteristicHandle {
        CharacteristicHandle {
            uuid: CHARACTERISTIC_UUID,
            service_uuid: SERVICE_UUID,
            writable: true,
        }
    }

    fn scanning() -> ConnectionMachine {
        let mut m = machine();
        m.on_power_changed(PowerState::PoweredOn);
        m
    }

    fn connected(id: &str) -> (ConnectionMachine, ObserverToken) {
        let mut m = scanning();
        let peripheral = PeripheralId::new(id);
        m.on_discovered(&meter_adv(id));
        m.on_connect_result(&peripheral, Ok(()));
        let actions = m.on_discover_result(&peripheral, Ok(vec![command_characteristic()]));
        let token = match actions.as_slice() {
            [Action::ObserveDisconnect { token, .. }] => *token,
            other => panic!("unexpected actions: {other:?}"),
        };
        (m, token)
    }

    #[test]
    fn test_power_on_starts_scanning() {
        let mut m = machine();
        assert_eq!(m.status(), LinkStatus::Idle);

        let actions = m.on_power_changed(PowerState::PoweredOn);
        assert_eq!(actions, vec![Action::StartScan]);
        assert_eq!(m.status(), LinkStatus::Scanning);
        assert!(m.scan_intent());
    }

    #[test]
    fn test_power_off_stops_scanning() {
        let mut m = scanning();
        m.on_scan_stopped();
        assert!(m.rescan_pending());

        let actions = m.on_power_changed(PowerState::PoweredOff);
        assert_eq!(actions, vec![Action::CancelRescan, Action::StopScan]);
        assert_eq!(m.status(), LinkStatus::Idle);
        assert!(!m.scan_intent());
        assert!(!m.rescan_pending());
    }

    #[test]
    fn test_power_off_keeps_connected_peripheral() {
        let (mut m, _) = connected("meter");
        let actions = m.on_power_changed(PowerState::PoweredOff);
        assert_eq!(actions, vec![Action::StopScan]);
        assert!(m.is_connected());
    }

    #[test]
    fn test_discovery_of_matching_peripheral_connects() {
        let mut m = scanning();
        let actions = m.on_discovered(&meter_adv("meter"));

        assert_eq!(actions, vec![Action::Connect(PeripheralId::new("meter"))]);
        assert_eq!(m.status(), LinkStatus::Connecting);
        assert!(!m.scan_intent());
    }

    #[test]
    fn test_duplicate_discovery_is_ignored() {
        let mut m = scanning();
        m.on_discovered(&meter_adv("meter"));
        assert!(m.on_discovered(&meter_adv("meter")).is_empty());
        assert!(m.on_discovered(&meter_adv("other")).is_empty());
        assert_eq!(m.peripheral().unwrap().id, PeripheralId::new("meter"));
    }

    #[test]
    fn test_discovery_with_wrong_name_is_ignored() {
        let mut m = scanning();
        let mut adv = meter_adv("thermometer");
        adv.local_name = Some("LYWSD03MMC".to_string());
        assert!(m.on_discovered(&adv).is_empty());
        adv.local_name = None;
        assert!(m.on_discovered(&adv).is_empty());
        assert_eq!(m.status(), LinkStatus::Scanning);
    }

    #[test]
    fn test_discovery_with_mismatched_services_stays_scanning() {
        let mut m = scanning();

        let mut adv = meter_adv("meter");
        adv.service_uuids = vec![uuid_from_u16(0x180f)];
        assert!(m.on_discovered(&adv).is_empty());

        adv.service_uuids = vec![SERVICE_UUID, uuid_from_u16(0x180f)];
        assert!(m.on_discovered(&adv).is_empty());

        adv.service_uuids.clear();
        assert!(m.on_discovered(&adv).is_empty());

        assert_eq!(m.status(), LinkStatus::Scanning);
        assert!(m.scan_intent());
    }

    #[test]
    fn test_discovery_while_not_intending_to_scan() {
        let mut m = machine();
        assert!(m.on_discovered(&meter_adv("meter")).is_empty());
        assert_eq!(m.status(), LinkStatus::Idle);
    }

    #[test]
    fn test_connect_failure_rescans_immediately() {
        let mut m = scanning();
        let id = PeripheralId::new("meter");
        m.on_discovered(&meter_adv("meter"));

        let actions = m.on_connect_result(
            &id,
            Err(MeterError::ConnectFailed {
                peripheral: "meter".to_string(),
                reason: "timeout".to_string(),
            }),
        );

        assert_eq!(
            actions,
            vec![
                Action::Release {
                    peripheral: id,
                    disconnect: false
                },
                Action::StartScan,
            ]
        );
        assert_eq!(m.status(), LinkStatus::Scanning);
        assert!(m.peripheral().is_none());
        assert!(m.scan_intent());
    }

    #[test]
    fn test_connect_success_discovers_services() {
        let mut m = scanning();
        let id = PeripheralId::new("meter");
        m.on_discovered(&meter_adv("meter"));

        let actions = m.on_connect_result(&id, Ok(()));
        assert_eq!(
            actions,
            vec![Action::Discover {
                peripheral: id,
                service: SERVICE_UUID
            }]
        );
        assert_eq!(m.status(), LinkStatus::DiscoveringServices);
    }

    #[test]
    fn test_stale_connect_result_is_ignored() {
        let mut m = scanning();
        m.on_discovered(&meter_adv("meter"));
        assert!(m
            .on_connect_result(&PeripheralId::new("other"), Ok(()))
            .is_empty());
        assert_eq!(m.status(), LinkStatus::Connecting);
    }

    #[test]
    fn test_discovery_success_connects() {
        let (m, token) = connected("meter");
        assert!(m.is_connected());
        assert_eq!(m.characteristic(), Some(&command_characteristic()));
        assert_eq!(
            m.state(),
            &ConnectionState::Connected {
                peripheral: PeripheralHandle::from_advertisement(&meter_adv("meter")),
                characteristic: command_characteristic(),
                observer: token,
            }
        );
    }

    #[test]
    fn test_discovery_without_characteristic_rescans() {
        let mut m = scanning();
        let id = PeripheralId::new("meter");
        m.on_discovered(&meter_adv("meter"));
        m.on_connect_result(&id, Ok(()));

        let mut read_only = command_characteristic();
        read_only.writable = false;
        let actions = m.on_discover_result(&id, Ok(vec![read_only]));

        assert_eq!(
            actions,
            vec![
                Action::Release {
                    peripheral: id,
                    disconnect: true
                },
                Action::StartScan,
            ]
        );
        assert_eq!(m.status(), LinkStatus::Scanning);
    }

    #[test]
    fn test_discovery_error_rescans() {
        let mut m = scanning();
        let id = PeripheralId::new("meter");
        m.on_discovered(&meter_adv("meter"));
        m.on_connect_result(&id, Ok(()));

        let actions = m.on_discover_result(&id, Err(MeterError::DiscoveryFailed("gatt".into())));
        assert!(actions.contains(&Action::StartScan));
        assert!(m.peripheral().is_none());
    }

    #[test]
    fn test_disconnect_observer_clears_handles_and_rescans() {
        let (mut m, token) = connected("meter");
        let id = PeripheralId::new("meter");

        let actions = m.on_peripheral_disconnected(token);
        assert_eq!(
            actions,
            vec![
                Action::ClearObserver {
                    peripheral: id.clone(),
                    token
                },
                Action::Release {
                    peripheral: id,
                    disconnect: false
                },
                Action::StartScan,
            ]
        );
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::ScheduleRescan(_))));
        assert_eq!(m.status(), LinkStatus::Scanning);
        assert!(m.peripheral().is_none());
        assert!(m.characteristic().is_none());
    }

    #[test]
    fn test_stale_observer_is_ignored() {
        let (mut m, first) = connected("meter");
        m.on_peripheral_disconnected(first);
        m.on_discovered(&meter_adv("meter"));
        let id = PeripheralId::new("meter");
        m.on_connect_result(&id, Ok(()));
        let actions = m.on_discover_result(&id, Ok(vec![command_characteristic()]));
        assert_eq!(actions.len(), 1);

        assert!(m.on_peripheral_disconnected(first).is_empty());
        assert!(m.is_connected());
    }

    #[test]
    fn test_external_scan_stop_schedules_one_rescan() {
        let mut m = scanning();

        assert_eq!(m.on_scan_stopped(), vec![Action::ScheduleRescan(DELAY)]);
        assert!(m.on_scan_stopped().is_empty());
        assert_eq!(m.status(), LinkStatus::Scanning);

        assert_eq!(m.on_rescan_elapsed(), vec![Action::StartScan]);
        assert!(!m.rescan_pending());
        assert!(m.on_rescan_elapsed().is_empty());
    }

    #[test]
    fn test_scan_stop_while_connecting_is_ignored() {
        let mut m = scanning();
        m.on_discovered(&meter_adv("meter"));
        assert!(m.on_scan_stopped().is_empty());
    }

    #[test]
    fn test_discovery_cancels_pending_rescan() {
        let mut m = scanning();
        m.on_scan_stopped();

        let actions = m.on_discovered(&meter_adv("meter"));
        assert_eq!(
            actions,
            vec![
                Action::CancelRescan,
                Action::Connect(PeripheralId::new("meter"))
            ]
        );
        assert!(m.on_rescan_elapsed().is_empty());
    }

    #[test]
    fn test_write_when_not_connected() {
        let mut m = scanning();
        let frame = encode("#422").unwrap();
        assert!(matches!(
            m.write(frame),
            Err(MeterError::ServiceUnavailable)
        ));
        assert!(!m.is_connected());
    }

    #[test]
    fn test_write_when_connected() {
        let (mut m, _) = connected("meter");
        let frame = encode("#422").unwrap();
        let actions = m.write(frame).unwrap();
        assert_eq!(
            actions,
            vec![Action::Write {
                peripheral: PeripheralId::new("meter"),
                characteristic: command_characteristic(),
                frame,
            }]
        );
    }

    #[test]
    fn test_write_failure_is_only_logged() {
        let (mut m, _) = connected("meter");
        let actions = m.on_write_result(
            &PeripheralId::new("meter"),
            Err(MeterError::WriteFailed("busy".into())),
        );
        assert!(actions.is_empty());
        assert!(m.is_connected());
    }

    #[test]
    fn test_missing_characteristic_on_write_rescans() {
        let (mut m, token) = connected("meter");
        let id = PeripheralId::new("meter");
        let actions = m.on_write_result(
            &id,
            Err(MeterError::CharacteristicMissing(CHARACTERISTIC_UUID)),
        );
        assert_eq!(
            actions,
            vec![
                Action::ClearObserver {
                    peripheral: id.clone(),
                    token
                },
                Action::Release {
                    peripheral: id,
                    disconnect: true
                },
                Action::StartScan,
            ]
        );
        assert!(!m.is_connected());
    }

    #[test]
    fn test_handle_dispatch() {
        let mut m = machine();
        assert_eq!(
            m.handle(RadioEvent::PowerChanged(PowerState::PoweredOn)),
            vec![Action::StartScan]
        );
        assert!(m.handle(RadioEvent::ScanStarted).is_empty());
        assert!(m.handle(RadioEvent::Warning("adapter busy".into())).is_empty());
        assert!(m
            .handle(RadioEvent::Disconnected(PeripheralId::new("x")))
            .is_empty());
        assert_eq!(
            m.handle(RadioEvent::Discovered(meter_adv("meter"))),
            vec![Action::Connect(PeripheralId::new("meter"))]
        );
    }

    #[test]
    fn test_failure_before_power_on_goes_idle() {
        let mut m = scanning();
        m.on_discovered(&meter_adv("meter"));
        m.on_power_changed(PowerState::PoweredOff);
        let actions = m.on_connect_result(
            &PeripheralId::new("meter"),
            Err(MeterError::Radio("powered off".into())),
        );
        assert_eq!(
            actions,
            vec![Action::Release {
                peripheral: PeripheralId::new("meter"),
                disconnect: false
            }]
        );
        assert_eq!(m.status(), LinkStatus::Idle);
        assert!(!m.scan_intent());
    }

    #[test]
    fn test_link_status_display() {
        assert_eq!(LinkStatus::Connected.to_string(), "connected");
        assert_eq!(
            LinkStatus::DiscoveringServices.to_string(),
            "discovering services"
        );
    }
}
