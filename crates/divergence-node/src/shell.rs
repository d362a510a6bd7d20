//! Line-oriented command shell

use anyhow::{anyhow, bail, Context, Result};
use divergence_meter::{InputSource, Meter, MeterAccessory, MeterError, MeterHandle};

/// Help text printed by `help`
pub const HELP: &str = "\
Commands:
  on                      turn the display on
  off                     turn the display off
  input <0-4>             select input (time 1-3, gyroscope, saved random)
  worldline <0-7> <text>  show an 8-character worldline
  time <mode>             time mode (layout 0, 1 or 2)
  gyro                    gyroscope mode
  random [flash]          saved random worldlines
  hour <12|24>            clock format
  sync                    set the meter clock to now
  status                  show link and accessory state
  quit                    exit";

/// A parsed shell line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    On,
    Off,
    Input(InputSource),
    Worldline { index: i32, text: String },
    Time(i32),
    Gyro,
    Random { flashing: bool },
    Hour { use_24h: bool },
    Sync,
    Status,
    Help,
    Quit,
}

/// Parse one line; blank lines yield `None`
///
/// Worldline text is taken verbatim after the index, so padding spaces
/// survive.
pub fn parse(line: &str) -> Result<Option<ShellCommand>> {
    let line = line.trim_end_matches(['\r', '\n']).trim_start();
    if line.trim_end().is_empty() {
        return Ok(None);
    }

    let (word, raw) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = raw.trim();

    let command = match word.to_ascii_lowercase().as_str() {
        "on" => ShellCommand::On,
        "off" => ShellCommand::Off,
        "input" => {
            let id: u8 = rest.parse().context("usage: input <0-4>")?;
            let input =
                InputSource::from_id(id).ok_or_else(|| anyhow!("no input source {}", id))?;
            ShellCommand::Input(input)
        }
        "worldline" => {
            let (index, text) = raw
                .trim_start()
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("usage: worldline <0-7> <text>"))?;
            ShellCommand::Worldline {
                index: index.parse().context("worldline index must be a number")?,
                text: text.to_string(),
            }
        }
        "time" => ShellCommand::Time(rest.parse().context("usage: time <mode>")?),
        "gyro" => ShellCommand::Gyro,
        "random" => match rest {
            "" => ShellCommand::Random { flashing: false },
            "flash" => ShellCommand::Random { flashing: true },
            _ => bail!("usage: random [flash]"),
        },
        "hour" => match rest {
            "12" => ShellCommand::Hour { use_24h: false },
            "24" => ShellCommand::Hour { use_24h: true },
            _ => bail!("usage: hour <12|24>"),
        },
        "sync" => ShellCommand::Sync,
        "status" => ShellCommand::Status,
        "help" | "?" => ShellCommand::Help,
        "quit" | "exit" => ShellCommand::Quit,
        other => bail!("unknown command '{}' (try 'help')", other),
    };

    Ok(Some(command))
}

/// Run a command; returns `false` when the shell should exit
pub fn execute(
    command: ShellCommand,
    meter: &MeterHandle,
    accessory: &MeterAccessory<MeterHandle>,
) -> bool {
    let result = match command {
        ShellCommand::On => accessory.set_active(true),
        ShellCommand::Off => accessory.set_active(false),
        ShellCommand::Input(input) => accessory.set_input(input),
        ShellCommand::Worldline { index, text } => meter.worldline_mode(index, &text),
        ShellCommand::Time(mode) => meter.time_mode(mode),
        ShellCommand::Gyro => meter.gyro_mode(),
        ShellCommand::Random { flashing } => meter.random_mode(flashing),
        ShellCommand::Hour { use_24h } => meter.set_12_or_24h(use_24h),
        ShellCommand::Sync => meter.sync_time(),
        ShellCommand::Status => {
            print_status(meter, accessory);
            Ok(())
        }
        ShellCommand::Help => {
            println!("{}", HELP);
            Ok(())
        }
        ShellCommand::Quit => return false,
    };

    match result {
        Ok(()) => {}
        Err(MeterError::ServiceUnavailable) => println!("Meter is not responding"),
        Err(e) => println!("Error: {}", e),
    }
    true
}

fn print_status(meter: &MeterHandle, accessory: &MeterAccessory<MeterHandle>) {
    println!("Link:   {}", meter.status());
    match accessory.active() {
        Ok(active) => println!("Active: {}", if active { "on" } else { "off" }),
        Err(_) => println!("Active: not responding"),
    }
    println!("Input:  {}", accessory.input());
    if let Some(timer) = accessory.timer() {
        if timer.is_running() {
            println!("Auto-off in {}s", timer.remaining().max(0));
        } else {
            println!("Auto-off idle");
        }
    }
}
