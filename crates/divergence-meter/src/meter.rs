//! Accessory-facing command surface
//!
//! [`Meter`] turns display features into encoded frames and hands them to
//! the write path. Invalid arguments are logged and dropped; the only error
//! a caller sees is [`MeterError::ServiceUnavailable`] (or
//! [`MeterError::ChannelClosed`] once the service has stopped).

use tracing::error;

use crate::command::{Command, CommandFrame};
use crate::error::{MeterError, Result};

/// Commands understood by the meter
///
/// Implementors provide the readiness query and the raw write; everything
/// else is provided.
pub trait Meter: Send + Sync {
    /// Whether the meter is connected and writable
    fn is_connected(&self) -> bool;

    /// Write one frame, fire-and-forget
    fn write(&self, frame: CommandFrame) -> Result<()>;

    /// Encode and write a command
    fn send_command(&self, command: &Command) -> Result<()> {
        match command.encode() {
            Ok(frame) => self.write(frame),
            Err(e) => drop_invalid(e),
        }
    }

    /// Blank the display
    fn turn_off(&self) -> Result<()> {
        self.send_command(&Command::TurnOff)
    }

    /// Show `text` (exactly 8 characters) in worldline slot `index` (0..=7)
    fn worldline_mode(&self, index: i32, text: &str) -> Result<()> {
        match Command::worldline(index, text) {
            Ok(command) => self.send_command(&command),
            Err(e) => drop_invalid(e),
        }
    }

    /// Switch to time mode, selecting layout `mode` when it is 0, 1 or 2
    fn time_mode(&self, mode: i32) -> Result<()> {
        for command in Command::time_mode(mode) {
            self.send_command(&command)?;
        }
        Ok(())
    }

    /// Gyroscope mode
    fn gyro_mode(&self) -> Result<()> {
        self.send_command(&Command::GyroMode)
    }

    /// Saved random worldlines
    fn random_mode(&self, flashing: bool) -> Result<()> {
        self.send_command(&Command::RandomMode { flashing })
    }

    /// 12 or 24 hour clock
    fn set_12_or_24h(&self, use_24h: bool) -> Result<()> {
        self.send_command(&Command::HourFormat { use_24h })
    }

    /// Set the meter clock to the current UTC time
    fn sync_time(&self) -> Result<()> {
        self.send_command(&Command::sync_time())
    }
}

fn drop_invalid(err: MeterError) -> Result<()> {
    error!(code = err.error_code(), "Dropping command: {}", err);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        connected: bool,
        frames: Mutex<Vec<String>>,
    }

    impl Meter for Recorder {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn write(&self, frame: CommandFrame) -> Result<()> {
            if !self.connected {
                return Err(MeterError::ServiceUnavailable);
            }
            self.frames.lock().push(frame.command().to_string());
            Ok(())
        }
    }

    fn connected() -> Recorder {
        Recorder {
            connected: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_worldline_sends_iff_valid() {
        let meter = connected();
        meter.worldline_mode(0, "01234567").unwrap();
        meter.worldline_mode(7, "ABCDEFGH").unwrap();
        meter.worldline_mode(8, "ABCDEFGH").unwrap();
        meter.worldline_mode(-3, "ABCDEFGH").unwrap();
        meter.worldline_mode(2, "ABCDEFG").unwrap();
        meter.worldline_mode(2, "ABCDEFGHI").unwrap();

        assert_eq!(*meter.frames.lock(), vec!["#3001234567", "#37ABCDEFGH"]);
    }

    #[test]
    fn test_time_mode_always_sends_trailing_command() {
        let meter = connected();
        meter.time_mode(1).unwrap();
        meter.time_mode(5).unwrap();
        assert_eq!(*meter.frames.lock(), vec!["#411", "#430", "#430"]);
    }

    #[test]
    fn test_time_mode_stops_when_unavailable() {
        let meter = Recorder::default();
        assert!(matches!(
            meter.time_mode(0),
            Err(MeterError::ServiceUnavailable)
        ));
        assert!(meter.frames.lock().is_empty());
    }

    #[test]
    fn test_selector_commands() {
        let meter = connected();
        meter.turn_off().unwrap();
        meter.gyro_mode().unwrap();
        meter.random_mode(true).unwrap();
        meter.random_mode(false).unwrap();
        meter.set_12_or_24h(true).unwrap();
        meter.set_12_or_24h(false).unwrap();

        assert_eq!(
            *meter.frames.lock(),
            vec!["#33        ", "#422", "#4211", "#4210", "#401", "#400"]
        );
    }

    #[test]
    fn test_sync_time_sends_timestamp() {
        let meter = connected();
        meter.sync_time().unwrap();
        let frames = meter.frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("#0"));
        assert_eq!(frames[0].len(), 16);
    }

    #[test]
    fn test_overlong_command_is_dropped() {
        let meter = connected();
        let command = Command::SyncTime("2024030907054299999".to_string());
        meter.send_command(&command).unwrap();
        assert!(meter.frames.lock().is_empty());
    }
}
