//! Command encoding for the meter
//!
//! The meter accepts ASCII command strings written as a single 18-byte frame,
//! right-padded with `*`:
//!
//! ```text
//! #410**************
//! ^^^^ command text
//!     ^^^^^^^^^^^^^^ padding
//! ```
//!
//! [`Command`] builds the command text for each display feature and
//! [`encode`] turns the text into a [`CommandFrame`].

use chrono::{DateTime, Utc};
use std::fmt;

use crate::config::{COMMAND_FRAME_LEN, PADDING_BYTE};
use crate::error::{MeterError, Result};

/// Length of the free text shown by a custom worldline
pub const WORLDLINE_TEXT_LEN: usize = 8;

/// Highest worldline slot
pub const MAX_WORLDLINE_INDEX: i32 = 7;

// Payload that blanks the display (custom worldline 3 with empty text)
const TURN_OFF: &str = "#33        ";
const TIME_MODE: &str = "#430";
const GYRO_MODE: &str = "#422";
const RANDOM_MODE: &str = "#4210";
const RANDOM_FLASHING: &str = "#4211";
const HOUR_12: &str = "#400";
const HOUR_24: &str = "#401";
const SYNC_TIME_PREFIX: &str = "#0";
const WORLDLINE_PREFIX: &str = "#3";

/// A fixed-length frame ready to be written to the command characteristic
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandFrame([u8; COMMAND_FRAME_LEN]);

impl CommandFrame {
    /// Raw bytes of the frame
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The command text without padding
    pub fn command(&self) -> &str {
        let end = self
            .0
            .iter()
            .rposition(|b| *b != PADDING_BYTE)
            .map_or(0, |i| i + 1);
        // Frames are only built from ASCII text
        std::str::from_utf8(&self.0[..end]).unwrap_or_default()
    }
}

impl AsRef<[u8]> for CommandFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommandFrame")
            .field(&String::from_utf8_lossy(&self.0))
            .finish()
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Encode command text into a padded frame
///
/// Fails with [`MeterError::CommandTooLong`] rather than truncating, and with
/// [`MeterError::NonAsciiCommand`] for text the meter cannot display.
pub fn encode(command: &str) -> Result<CommandFrame> {
    if !command.is_ascii() {
        return Err(MeterError::NonAsciiCommand(command.to_string()));
    }
    let bytes = command.as_bytes();
    if bytes.len() > COMMAND_FRAME_LEN {
        return Err(MeterError::CommandTooLong {
            len: bytes.len(),
            max: COMMAND_FRAME_LEN,
        });
    }

    let mut frame = [PADDING_BYTE; COMMAND_FRAME_LEN];
    frame[..bytes.len()].copy_from_slice(bytes);
    Ok(CommandFrame(frame))
}

/// Display time layout selected by the time-mode commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLayout {
    /// `HH MM SS`
    HourMinuteSecond,
    /// `0.HHMMSS`
    ZeroDotHms,
    /// `HHMMSS.MS`
    HmsDotMillis,
}

impl TimeLayout {
    /// Layout for a numeric mode, `None` outside 0..=2
    pub fn from_mode(mode: i32) -> Option<Self> {
        match mode {
            0 => Some(TimeLayout::HourMinuteSecond),
            1 => Some(TimeLayout::ZeroDotHms),
            2 => Some(TimeLayout::HmsDotMillis),
            _ => None,
        }
    }

    fn command(self) -> &'static str {
        match self {
            TimeLayout::HourMinuteSecond => "#410",
            TimeLayout::ZeroDotHms => "#411",
            TimeLayout::HmsDotMillis => "#412",
        }
    }
}

/// A semantic meter command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Blank the display
    TurnOff,
    /// Show a custom worldline in slot `index`
    Worldline {
        /// Slot 0..=7
        index: u8,
        /// Exactly eight characters
        text: String,
    },
    /// Select the time layout
    TimeLayout(TimeLayout),
    /// Switch the display to time mode
    TimeMode,
    /// Gyroscope mode
    GyroMode,
    /// Saved random worldlines, optionally flashing
    RandomMode {
        /// Flash between worldlines
        flashing: bool,
    },
    /// 12 or 24 hour clock
    HourFormat {
        /// Use the 24 hour clock
        use_24h: bool,
    },
    /// Set the meter clock to `YYYYMMDDHHMMSS` (UTC)
    SyncTime(String),
}

impl Command {
    /// Build a worldline command, checking the slot and text shape
    pub fn worldline(index: i32, text: &str) -> Result<Self> {
        if !(0..=MAX_WORLDLINE_INDEX).contains(&index) {
            return Err(MeterError::InvalidWorldlineIndex(index));
        }
        let len = text.chars().count();
        if len != WORLDLINE_TEXT_LEN {
            return Err(MeterError::InvalidWorldlineText { len });
        }
        Ok(Command::Worldline {
            index: index as u8,
            text: text.to_string(),
        })
    }

    /// Commands sent for a numeric time mode
    ///
    /// The layout selection is only included for modes 0, 1 and 2; the
    /// trailing [`Command::TimeMode`] is always sent.
    pub fn time_mode(mode: i32) -> Vec<Self> {
        let mut commands = Vec::with_capacity(2);
        if let Some(layout) = TimeLayout::from_mode(mode) {
            commands.push(Command::TimeLayout(layout));
        }
        commands.push(Command::TimeMode);
        commands
    }

    /// Sync command for the current time
    pub fn sync_time() -> Self {
        Self::sync_time_at(Utc::now())
    }

    /// Sync command for a given instant
    pub fn sync_time_at(now: DateTime<Utc>) -> Self {
        Command::SyncTime(format_timestamp(now))
    }

    /// Command text before padding
    pub fn text(&self) -> String {
        match self {
            Command::TurnOff => TURN_OFF.to_string(),
            Command::Worldline { index, text } => format!("{WORLDLINE_PREFIX}{index}{text}"),
            Command::TimeLayout(layout) => layout.command().to_string(),
            Command::TimeMode => TIME_MODE.to_string(),
            Command::GyroMode => GYRO_MODE.to_string(),
            Command::RandomMode { flashing: true } => RANDOM_FLASHING.to_string(),
            Command::RandomMode { flashing: false } => RANDOM_MODE.to_string(),
            Command::HourFormat { use_24h: true } => HOUR_24.to_string(),
            Command::HourFormat { use_24h: false } => HOUR_12.to_string(),
            Command::SyncTime(stamp) => format!("{SYNC_TIME_PREFIX}{stamp}"),
        }
    }

    /// Encode into a frame
    pub fn encode(&self) -> Result<CommandFrame> {
        encode(&self.text())
    }
}

/// `YYYYMMDDHHMMSS` from an ISO-8601 timestamp with separators stripped
fn format_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339()
        .chars()
        .filter(|c| !matches!(c, '-' | ':' | '.' | 'T'))
        .take(14)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encode_pads_with_filler() {
        let frame = encode("#410").unwrap();
        assert_eq!(frame.as_bytes().len(), COMMAND_FRAME_LEN);
        assert_eq!(frame.as_bytes(), b"#410**************");
        assert_eq!(frame.command(), "#410");
    }

    #[test]
    fn test_encode_lengths() {
        for len in 0..=COMMAND_FRAME_LEN {
            let text = "x".repeat(len);
            let frame = encode(&text).unwrap();
            assert_eq!(frame.as_bytes().len(), COMMAND_FRAME_LEN);
            assert!(frame.as_bytes().starts_with(text.as_bytes()));
            assert!(frame.as_bytes()[len..].iter().all(|b| *b == PADDING_BYTE));
        }
    }

    #[test]
    fn test_encode_too_long() {
        let err = encode(&"x".repeat(19)).unwrap_err();
        assert!(matches!(err, MeterError::CommandTooLong { len: 19, max: 18 }));
    }

    #[test]
    fn test_encode_non_ascii() {
        assert!(matches!(
            encode("#3π"),
            Err(MeterError::NonAsciiCommand(_))
        ));
    }

    #[test]
    fn test_turn_off_payload() {
        assert_eq!(Command::TurnOff.text().len(), 11);
        assert_eq!(
            Command::TurnOff.encode().unwrap().as_bytes(),
            b"#33        *******"
        );
    }

    #[test]
    fn test_worldline_valid() {
        let cmd = Command::worldline(3, "1.048596").unwrap();
        assert_eq!(cmd.text(), "#331.048596");
    }

    #[test]
    fn test_worldline_bounds() {
        assert!(Command::worldline(0, "        ").is_ok());
        assert!(Command::worldline(7, "        ").is_ok());
        assert!(matches!(
            Command::worldline(8, "        "),
            Err(MeterError::InvalidWorldlineIndex(8))
        ));
        assert!(matches!(
            Command::worldline(-1, "        "),
            Err(MeterError::InvalidWorldlineIndex(-1))
        ));
        assert!(matches!(
            Command::worldline(1, "short"),
            Err(MeterError::InvalidWorldlineText { len: 5 })
        ));
        assert!(Command::worldline(1, "ninechars").is_err());
    }

    #[test]
    fn test_time_mode_commands() {
        let texts = |mode| -> Vec<String> {
            Command::time_mode(mode).iter().map(Command::text).collect()
        };
        assert_eq!(texts(0), vec!["#410", "#430"]);
        assert_eq!(texts(1), vec!["#411", "#430"]);
        assert_eq!(texts(2), vec!["#412", "#430"]);
        assert_eq!(texts(3), vec!["#430"]);
        assert_eq!(texts(-1), vec!["#430"]);
    }

    #[test]
    fn test_selector_commands() {
        assert_eq!(Command::GyroMode.text(), "#422");
        assert_eq!(Command::RandomMode { flashing: true }.text(), "#4211");
        assert_eq!(Command::RandomMode { flashing: false }.text(), "#4210");
        assert_eq!(Command::HourFormat { use_24h: true }.text(), "#401");
        assert_eq!(Command::HourFormat { use_24h: false }.text(), "#400");
    }

    #[test]
    fn test_sync_time_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 42).unwrap();
        let cmd = Command::sync_time_at(now);
        assert_eq!(cmd.text(), "#020240309070542");
        assert_eq!(cmd.encode().unwrap().as_bytes().len(), COMMAND_FRAME_LEN);
    }

    #[test]
    fn test_sync_time_now_fits_frame() {
        let text = Command::sync_time().text();
        assert_eq!(text.len(), 16);
        assert!(text[2..].chars().all(|c| c.is_ascii_digit()));
    }
}
