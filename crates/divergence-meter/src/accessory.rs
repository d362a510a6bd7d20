//! Accessory controller
//!
//! Presents the meter the way a home-automation "television" would: an
//! active switch, a choice of input sources and an optional auto-off timer.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AutoOffConfig;
use crate::error::{MeterError, Result};
use crate::meter::Meter;
use crate::timer::AutoOffTimer;

/// Display inputs selectable on the accessory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InputSource {
    /// Time mode, layout 1
    #[default]
    TimeMode1,
    /// Time mode, layout 2
    TimeMode2,
    /// Time mode, layout 3
    TimeMode3,
    /// Gyroscope mode
    Gyroscope,
    /// Saved random worldlines
    SavedRandom,
}

impl InputSource {
    /// All inputs in identifier order
    pub const ALL: [InputSource; 5] = [
        InputSource::TimeMode1,
        InputSource::TimeMode2,
        InputSource::TimeMode3,
        InputSource::Gyroscope,
        InputSource::SavedRandom,
    ];

    /// Stable identifier (0-4)
    pub fn id(self) -> u8 {
        match self {
            InputSource::TimeMode1 => 0,
            InputSource::TimeMode2 => 1,
            InputSource::TimeMode3 => 2,
            InputSource::Gyroscope => 3,
            InputSource::SavedRandom => 4,
        }
    }

    /// Look up by identifier
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(usize::from(id)).copied()
    }

    /// Human-readable name
    pub fn display_name(self) -> &'static str {
        match self {
            InputSource::TimeMode1 => "Time Mode 1",
            InputSource::TimeMode2 => "Time Mode 2",
            InputSource::TimeMode3 => "Time Mode 3",
            InputSource::Gyroscope => "Gyroscope",
            InputSource::SavedRandom => "Saved Random",
        }
    }

    fn apply<M: Meter + ?Sized>(self, meter: &M) -> Result<()> {
        match self {
            InputSource::TimeMode1 => meter.time_mode(0),
            InputSource::TimeMode2 => meter.time_mode(1),
            InputSource::TimeMode3 => meter.time_mode(2),
            InputSource::Gyroscope => meter.gyro_mode(),
            InputSource::SavedRandom => meter.random_mode(false),
        }
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Default)]
struct AccessoryState {
    active: bool,
    input: InputSource,
}

/// Active switch and input selector over a [`Meter`]
pub struct MeterAccessory<M> {
    meter: M,
    state: Arc<Mutex<AccessoryState>>,
    timer: Option<AutoOffTimer>,
}

impl<M> MeterAccessory<M>
where
    M: Meter + Clone + 'static,
{
    /// Create a controller; the auto-off timer exists only when enabled
    pub fn new(meter: M, auto_off: &AutoOffConfig) -> Self {
        let state = Arc::new(Mutex::new(AccessoryState::default()));

        let timer = auto_off.enabled.then(|| {
            let meter = meter.clone();
            let state = Arc::clone(&state);
            let retry_delay = auto_off.retry_delay_secs;
            AutoOffTimer::new(auto_off.duration_secs, move || {
                auto_off_action(&meter, &state, retry_delay)
            })
        });

        Self {
            meter,
            state,
            timer,
        }
    }

    /// Turn the display on or off
    ///
    /// Turning on applies the current input and restarts the auto-off timer.
    /// Turning off blanks the display and stops the timer. The recorded state
    /// only changes once the meter accepted the command.
    pub fn set_active(&self, active: bool) -> Result<()> {
        info!(active, "Set active");
        if active {
            let input = self.state.lock().input;
            input.apply(&self.meter)?;
            if let Some(timer) = &self.timer {
                timer.start();
            }
        } else {
            self.meter.turn_off()?;
            if let Some(timer) = &self.timer {
                timer.stop();
            }
        }
        self.state.lock().active = active;
        Ok(())
    }

    /// Last requested active state
    ///
    /// Fails with [`MeterError::ServiceUnavailable`] while the meter is not
    /// connected so callers can show it as not responding.
    pub fn active(&self) -> Result<bool> {
        if !self.meter.is_connected() {
            return Err(MeterError::ServiceUnavailable);
        }
        Ok(self.state.lock().active)
    }

    /// Select an input, applying it right away when active
    pub fn set_input(&self, input: InputSource) -> Result<()> {
        info!(input = %input, "Set input source");
        let active = {
            let mut state = self.state.lock();
            state.input = input;
            state.active
        };

        if active {
            input.apply(&self.meter)?;
        }
        Ok(())
    }

    /// Currently selected input
    pub fn input(&self) -> InputSource {
        self.state.lock().input
    }

    /// Auto-off timer, if enabled
    pub fn timer(&self) -> Option<&AutoOffTimer> {
        self.timer.as_ref()
    }

    /// Underlying meter
    pub fn meter(&self) -> &M {
        &self.meter
    }
}

fn auto_off_action<M: Meter>(meter: &M, state: &Mutex<AccessoryState>, retry_delay: u32) -> u32 {
    match meter.turn_off() {
        Ok(()) => {
            state.lock().active = false;
            info!("Meter turned off by auto-off timer");
            0
        }
        Err(e) => {
            warn!(retry_secs = retry_delay, "Auto-off failed: {}", e);
            retry_delay
        }
    }
}

impl<M> fmt::Debug for MeterAccessory<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MeterAccessory")
            .field("active", &state.active)
            .field("input", &state.input)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandFrame;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct FakeMeter {
        connected: Arc<AtomicBool>,
        frames: Arc<Mutex<Vec<String>>>,
    }

    impl FakeMeter {
        fn connected() -> Self {
            let meter = Self::default();
            meter.connected.store(true, Ordering::SeqCst);
            meter
        }

        fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        fn frames(&self) -> Vec<String> {
            self.frames.lock().clone()
        }
    }

    impl Meter for FakeMeter {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn write(&self, frame: CommandFrame) -> Result<()> {
            if !self.is_connected() {
                return Err(MeterError::ServiceUnavailable);
            }
            self.frames.lock().push(frame.command().trim_end().to_string());
            Ok(())
        }
    }

    fn auto_off(duration_secs: u32, retry_delay_secs: u32) -> AutoOffConfig {
        AutoOffConfig {
            enabled: true,
            duration_secs,
            retry_delay_secs,
        }
    }

    #[test]
    fn test_input_source_ids() {
        for (i, input) in InputSource::ALL.iter().enumerate() {
            assert_eq!(usize::from(input.id()), i);
            assert_eq!(InputSource::from_id(input.id()), Some(*input));
        }
        assert_eq!(InputSource::from_id(5), None);
        assert_eq!(InputSource::SavedRandom.to_string(), "Saved Random");
    }

    #[test]
    fn test_inputs_map_to_commands() {
        let meter = FakeMeter::connected();
        let accessory = MeterAccessory::new(meter.clone(), &AutoOffConfig::default());
        accessory.set_active(true).unwrap();
        for input in InputSource::ALL {
            accessory.set_input(input).unwrap();
        }

        assert_eq!(
            meter.frames(),
            vec![
                "#410", "#430", "#410", "#430", "#411", "#430", "#412", "#430", "#422", "#4210"
            ]
        );
    }

    #[test]
    fn test_set_input_while_inactive_only_records() {
        let meter = FakeMeter::connected();
        let accessory = MeterAccessory::new(meter.clone(), &AutoOffConfig::default());
        accessory.set_input(InputSource::Gyroscope).unwrap();

        assert!(meter.frames().is_empty());
        assert_eq!(accessory.input(), InputSource::Gyroscope);

        accessory.set_active(true).unwrap();
        assert_eq!(meter.frames(), vec!["#422"]);
    }

    #[test]
    fn test_active_reports_unavailable_when_disconnected() {
        let meter = FakeMeter::default();
        let accessory = MeterAccessory::new(meter.clone(), &AutoOffConfig::default());

        assert!(matches!(accessory.active(), Err(MeterError::ServiceUnavailable)));
        assert!(matches!(
            accessory.set_active(true),
            Err(MeterError::ServiceUnavailable)
        ));

        meter.set_connected(true);
        assert!(!accessory.active().unwrap());
        accessory.set_active(true).unwrap();
        accessory.set_active(false).unwrap();
        assert!(!accessory.active().unwrap());
        assert_eq!(meter.frames(), vec!["#410", "#430", "#33"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_turn_on_keeps_accessory_off() {
        let meter = FakeMeter::default();
        let accessory = MeterAccessory::new(meter.clone(), &auto_off(1, 1));

        assert!(accessory.set_active(true).is_err());
        assert!(!accessory.timer().unwrap().is_running());

        meter.set_connected(true);
        assert!(!accessory.active().unwrap());
        assert!(meter.frames().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(meter.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_turn_off_keeps_accessory_on() {
        let meter = FakeMeter::connected();
        let accessory = MeterAccessory::new(meter.clone(), &auto_off(10, 1));
        accessory.set_active(true).unwrap();

        meter.set_connected(false);
        assert!(accessory.set_active(false).is_err());
        assert!(accessory.timer().unwrap().is_running());

        meter.set_connected(true);
        assert!(accessory.active().unwrap());
    }

    #[test]
    fn test_no_timer_when_disabled() {
        let accessory = MeterAccessory::new(FakeMeter::connected(), &AutoOffConfig::default());
        assert!(accessory.timer().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_off_turns_meter_off() {
        let meter = FakeMeter::connected();
        let accessory = MeterAccessory::new(meter.clone(), &auto_off(2, 5));
        accessory.set_active(true).unwrap();
        assert!(accessory.timer().unwrap().is_running());

        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(meter.frames(), vec!["#410", "#430", "#33"]);
        assert!(!accessory.active().unwrap());
        assert!(!accessory.timer().unwrap().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_off_retries_while_unavailable() {
        let meter = FakeMeter::connected();
        let accessory = MeterAccessory::new(meter.clone(), &auto_off(1, 3));
        accessory.set_active(true).unwrap();
        meter.set_connected(false);

        // Expires on the 2nd tick, retries 3 ticks later
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(accessory.timer().unwrap().is_running());

        meter.set_connected(true);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(meter.frames(), vec!["#410", "#430", "#33"]);
        assert!(!accessory.timer().unwrap().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_turning_off_stops_timer() {
        let meter = FakeMeter::connected();
        let accessory = MeterAccessory::new(meter.clone(), &auto_off(1, 1));
        accessory.set_active(true).unwrap();
        accessory.set_active(false).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(meter.frames(), vec!["#410", "#430", "#33"]);
    }
}
