//! MeterService - drives the connection state machine against a radio
//!
//! The service owns the [`ConnectionMachine`] and is the only code that
//! mutates it. Everything arrives as a discrete event on one task:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       MeterService                         │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  RadioEvent rx ──┐                      ┌──► Central ops   │
//! │                  │   ┌──────────────┐   │   (spawned)      │
//! │  Completions  ───┼──►│ Connection   │───┤                  │
//! │                  │   │ Machine      │   └──► status watch  │
//! │  MeterHandle  ───┘   └──────────────┘                      │
//! │                                                            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connect, discover, write and disconnect run as spawned tasks whose result
//! is fed back as a completion, so the loop never waits on the radio.
//!
//! # Example
//!
//! ```rust,ignore
//! use divergence_meter::{Meter, MeterConfig, MeterService};
//!
//! let (service, meter) = MeterService::new(central, &MeterConfig::default());
//! tokio::spawn(service.run());
//!
//! if meter.is_connected() {
//!     meter.time_mode(0)?;
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::central::{Central, CharacteristicHandle, PeripheralId, RadioEvent};
use crate::command::CommandFrame;
use crate::config::MeterConfig;
use crate::error::{MeterError, Result};
use crate::machine::{Action, ConnectionMachine, LinkStatus, ObserverToken};
use crate::meter::Meter;

/// Commands sent from a [`MeterHandle`] to the service
#[derive(Debug)]
enum ServiceCommand {
    /// Write a frame if connected
    Write(CommandFrame),
    /// Stop the service
    Shutdown,
}

/// Results of radio operations spawned by the service
#[derive(Debug)]
enum Completion {
    Connect(PeripheralId, Result<()>),
    Discover(PeripheralId, Result<Vec<CharacteristicHandle>>),
    Write(PeripheralId, Result<()>),
    /// The rescan timer of the given generation fired
    RescanElapsed(u64),
}

/// Handle for talking to a running [`MeterService`]
///
/// Cheap to clone. All methods return immediately.
#[derive(Clone)]
pub struct MeterHandle {
    command_tx: mpsc::UnboundedSender<ServiceCommand>,
    status_rx: watch::Receiver<LinkStatus>,
}

impl MeterHandle {
    /// Current link status
    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    /// Watch link status changes
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Wait until the meter is connected
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.status_rx.clone();
        rx.wait_for(|status| *status == LinkStatus::Connected)
            .await
            .map(|_| ())
            .map_err(|_| MeterError::ChannelClosed)
    }

    /// Stop the service
    pub fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(ServiceCommand::Shutdown)
            .map_err(MeterError::from)
    }
}

impl Meter for MeterHandle {
    fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
    }

    fn write(&self, frame: CommandFrame) -> Result<()> {
        if !self.is_connected() {
            warn!(command = %frame.command(), "Cannot write to meter: not connected");
            return Err(MeterError::ServiceUnavailable);
        }
        self.command_tx
            .send(ServiceCommand::Write(frame))
            .map_err(MeterError::from)
    }
}

/// Service keeping one meter connected
pub struct MeterService<C: Central> {
    /// Radio backend
    central: Arc<C>,
    /// Link state
    machine: ConnectionMachine,
    /// Commands from handles
    command_rx: mpsc::UnboundedReceiver<ServiceCommand>,
    /// Completions of spawned radio operations
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    /// Published link status
    status_tx: watch::Sender<LinkStatus>,
    /// One-shot disconnect observers by peripheral
    observers: HashMap<PeripheralId, ObserverToken>,
    /// Pending delayed rescan
    rescan_task: Option<JoinHandle<()>>,
    /// Generation of the most recently scheduled rescan
    rescan_generation: u64,
}

impl<C: Central> MeterService<C> {
    /// Create a service for `central` and a handle to it
    pub fn new(central: Arc<C>, config: &MeterConfig) -> (Self, MeterHandle) {
        let machine = ConnectionMachine::from_config(config);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(machine.status());

        let handle = MeterHandle {
            command_tx,
            status_rx,
        };
        let service = Self {
            central,
            machine,
            command_rx,
            completion_tx,
            completion_rx,
            status_tx,
            observers: HashMap::new(),
            rescan_task: None,
            rescan_generation: 0,
        };

        (service, handle)
    }

    /// Spawn the service onto the current runtime
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Run the service event loop until shutdown
    pub async fn run(mut self) -> Result<()> {
        info!(central = self.central.name(), "Starting meter service");
        let mut events = self.central.events().await?;

        loop {
            let actions = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_radio_event(event),
                    None => {
                        warn!("Radio event stream closed");
                        break;
                    }
                },

                Some(completion) = self.completion_rx.recv() => self.on_completion(completion),

                command = self.command_rx.recv() => match command {
                    Some(ServiceCommand::Write(frame)) => match self.machine.write(frame) {
                        Ok(actions) => actions,
                        Err(e) => {
                            debug!("Dropping write: {}", e);
                            Vec::new()
                        }
                    },
                    Some(ServiceCommand::Shutdown) | None => {
                        info!("Meter service shutdown requested");
                        break;
                    }
                },
            };

            // Status first: performing actions may wait on the radio
            self.publish_status();
            self.perform(actions).await;
        }

        self.cancel_rescan();
        if let Some(peripheral) = self.machine.peripheral() {
            if let Err(e) = self.central.disconnect(&peripheral.id).await {
                warn!("Error disconnecting from meter: {}", e);
            }
        }
        self.status_tx.send_replace(LinkStatus::Idle);

        info!("Meter service stopped");
        Ok(())
    }

    fn on_radio_event(&mut self, event: RadioEvent) -> Vec<Action> {
        trace!(?event, "Radio event");
        match event {
            RadioEvent::Disconnected(id) => match self.observers.remove(&id) {
                // One-shot: the observer is gone once it fires
                Some(token) => self.machine.on_peripheral_disconnected(token),
                None => self.machine.handle(RadioEvent::Disconnected(id)),
            },
            event => self.machine.handle(event),
        }
    }

    fn on_completion(&mut self, completion: Completion) -> Vec<Action> {
        match completion {
            Completion::Connect(id, result) => self.machine.on_connect_result(&id, result),
            Completion::Discover(id, result) => self.machine.on_discover_result(&id, result),
            Completion::Write(id, result) => self.machine.on_write_result(&id, result),
            Completion::RescanElapsed(generation) => {
                if generation != self.rescan_generation || self.rescan_task.is_none() {
                    trace!(generation, "Ignoring stale rescan timer");
                    return Vec::new();
                }
                self.rescan_task = None;
                self.machine.on_rescan_elapsed()
            }
        }
    }

    async fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            trace!(?action, "Performing action");
            match action {
                Action::StartScan => {
                    if let Err(e) = self.central.start_scan().await {
                        warn!("Failed to start scanning: {}", e);
                    }
                }
                Action::StopScan => {
                    if let Err(e) = self.central.stop_scan().await {
                        warn!("Failed to stop scanning: {}", e);
                    }
                }
                Action::Connect(id) => {
                    let central = Arc::clone(&self.central);
                    let target = id.clone();
                    self.spawn_op(
                        async move { central.connect(&target).await },
                        move |result| Completion::Connect(id, result),
                    );
                }
                Action::Discover {
                    peripheral,
                    service,
                } => {
                    let central = Arc::clone(&self.central);
                    let target = peripheral.clone();
                    self.spawn_op(
                        async move { central.discover(&target, service).await },
                        move |result| Completion::Discover(peripheral, result),
                    );
                }
                Action::ObserveDisconnect { peripheral, token } => {
                    self.observers.insert(peripheral, token);
                }
                Action::ClearObserver { peripheral, token } => {
                    if self.observers.get(&peripheral) == Some(&token) {
                        self.observers.remove(&peripheral);
                    }
                }
                Action::Release {
                    peripheral,
                    disconnect,
                } => {
                    if disconnect {
                        let central = Arc::clone(&self.central);
                        tokio::spawn(async move {
                            if let Err(e) = central.disconnect(&peripheral).await {
                                debug!(%peripheral, "Disconnect after release failed: {}", e);
                            }
                        });
                    }
                }
                Action::ScheduleRescan(delay) => self.schedule_rescan(delay),
                Action::CancelRescan => self.cancel_rescan(),
                Action::Write {
                    peripheral,
                    characteristic,
                    frame,
                } => {
                    let central = Arc::clone(&self.central);
                    let target = peripheral.clone();
                    self.spawn_op(
                        async move {
                            central
                                .write(&target, &characteristic, frame.as_bytes())
                                .await
                        },
                        move |result| Completion::Write(peripheral, result),
                    );
                }
            }
        }
    }

    /// Run a radio operation on its own task and report its result
    ///
    /// A panicking operation is reported as a radio error.
    fn spawn_op<T, F, M>(&self, op: F, complete: M)
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
        M: FnOnce(Result<T>) -> Completion + Send + 'static,
    {
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::spawn(op).await {
                Ok(result) => result,
                Err(e) => Err(MeterError::Radio(format!("radio operation failed: {e}"))),
            };
            let _ = completion_tx.send(complete(result));
        });
    }

    fn schedule_rescan(&mut self, delay: Duration) {
        self.cancel_rescan();
        self.rescan_generation += 1;
        let generation = self.rescan_generation;
        let completion_tx = self.completion_tx.clone();
        self.rescan_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = completion_tx.send(Completion::RescanElapsed(generation));
        }));
    }

    fn cancel_rescan(&mut self) {
        if let Some(task) = self.rescan_task.take() {
            task.abort();
        }
    }

    fn publish_status(&self) {
        let status = self.machine.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(%status, "Link status changed");
            *current = status;
            true
        });
    }
}
