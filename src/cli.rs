use std::time::{Duration, UNIX_EPOCH};
use clap::Parser;
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::types::{Preferences, TransportKind};
use crate::device::ble::BleTransport;
use crate::device::constants::{DEFAULT_SCAN_SECS, RECONNECT_DELAY, SERIAL_BAUD_RATE};
use crate::device::serial::SerialTransport;
use crate::device::transport::Transport;
use crate::error::{AppRunError, TransportError};
use crate::session::facade::Connection;
use crate::session::SessionEvent;

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Talks to a Quarzlampe over Bluetooth LE or a serial port.\n\nType lamp commands (`bri 50`, `mode 3`, ...) or `:help`.", long_about = None)]
pub struct Args {
    /// Transport to use, defaults to the one used last time
    #[arg(long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Pick the device whose name or address (BLE) or port name (serial) contains this text
    #[arg(long)]
    pub device: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = SERIAL_BAUD_RATE)]
    pub baud: u32,

    /// How long to scan for the lamp, in seconds
    #[arg(long, default_value_t = DEFAULT_SCAN_SECS)]
    pub scan_secs: u64,

    /// Do not reconnect after the link drops (remembered)
    #[arg(long)]
    pub no_auto_reconnect: bool,

    /// Show recognized status lines and sensor telemetry in the log (remembered)
    #[arg(long)]
    pub raw_log: bool,

    /// Do not connect on start
    #[arg(long)]
    pub offline: bool,

    /// Log debug messages
    #[arg(short, long)]
    pub verbose: bool,
}

/// A line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    /// Sent to the lamp as is
    Command(String),
    Status,
    Refresh,
    Live(bool),
    Filter(bool),
    Auto(bool),
    Devices,
    Rename { id: String, name: String },
    Forget(String),
    Connect,
    Disconnect,
    Reconnect,
    Transport(TransportKind),
    Help,
    Quit,
    Invalid(String),
}

fn parse_switch(value: Option<&str>) -> Option<bool> {
    match value? {
        "on" | "1" | "true" => Some(true),
        "off" | "0" | "false" => Some(false),
        _ => None,
    }
}

fn parse_switch_input(name: &str, value: Option<&str>, make: fn(bool) -> Input) -> Input {
    match parse_switch(value) {
        Some(value) => make(value),
        None => Input::Invalid(format!("Usage: :{} on|off", name)),
    }
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }

    let Some(meta) = line.strip_prefix(':') else {
        return Input::Command(line.to_string());
    };

    let mut words = meta.split_whitespace();
    let name = words.next().unwrap_or("");
    match name {
        "status" => Input::Status,
        "refresh" => Input::Refresh,
        "live" => parse_switch_input(name, words.next(), Input::Live),
        "filter" => parse_switch_input(name, words.next(), Input::Filter),
        "auto" => parse_switch_input(name, words.next(), Input::Auto),
        "devices" => Input::Devices,
        "rename" => {
            let id = words.next();
            let name = words.collect::<Vec<_>>().join(" ");
            match id {
                Some(id) if !name.is_empty() => Input::Rename { id: id.to_string(), name },
                _ => Input::Invalid("Usage: :rename <id> <name>".to_string()),
            }
        },
        "forget" => match words.next() {
            Some(id) => Input::Forget(id.to_string()),
            None => Input::Invalid("Usage: :forget <id>".to_string()),
        },
        "connect" => Input::Connect,
        "disconnect" => Input::Disconnect,
        "reconnect" => Input::Reconnect,
        "transport" => match words.next().and_then(TransportKind::parse) {
            Some(kind) => Input::Transport(kind),
            None => Input::Invalid("Usage: :transport ble|serial".to_string()),
        },
        "help" | "?" => Input::Help,
        "quit" | "q" | "exit" => Input::Quit,
        _ => Input::Invalid(format!("Unknown command :{} (try :help)", name)),
    }
}

const HELP: &str = "\
Anything not starting with ':' is sent to the lamp.
  :status               print the decoded lamp status (JSON)
  :refresh              ask the lamp for its full status
  :live on|off          pause or resume the live log
  :filter on|off        hide recognized status lines and telemetry
  :auto on|off          reconnect after the link drops
  :devices              list known devices
  :rename <id> <name>   name a known device
  :forget <id>          forget a known device
  :connect | :disconnect | :reconnect
  :transport ble|serial switch transport
  :quit";

fn format_ts(ts: u64) -> String {
    humantime::format_rfc3339_millis(UNIX_EPOCH + Duration::from_millis(ts)).to_string()
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Log(entry) => println!("{} {}", format_ts(entry.ts), entry.line),
        SessionEvent::Notice(message) => eprintln!("! {}", message),
        SessionEvent::Connected(device) => println!("* connected to {} ({})", device.name, device.id),
        SessionEvent::Disconnected => println!("* disconnected"),
        SessionEvent::ReconnectScheduled => println!("* reconnecting in {} ms", RECONNECT_DELAY),
        SessionEvent::StatusChanged => {},
    }
}

fn print_pending(events: &mut UnboundedReceiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
}

/// Failures are already logged and announced by the session; only a dismissed device choice
/// goes unmentioned there.
fn report(result: Result<(), TransportError>) {
    match result {
        Err(err) if err.is_user_cancelled() => println!("* {}", err),
        Err(err) => debug!("{}", err),
        Ok(()) => {},
    }
}

fn print_switch(what: &str, value: bool) {
    println!("* {} {}", what, if value { "on" } else { "off" });
}

/// Runs one line of input; false means quit.
async fn execute<B: Transport, S: Transport>(connection: &mut Connection<B, S>, input: Input) -> bool {
    match input {
        Input::Empty => {},
        Input::Command(command) => report(connection.send_cmd(&command).await),
        Input::Status => match serde_json::to_string_pretty(connection.status()) {
            Ok(json) => println!("{}", json),
            Err(err) => warn!("Failed to serialize status: {}", err),
        },
        Input::Refresh => report(connection.refresh_status().await),
        Input::Live(live) => {
            connection.set_live_log(live);
            print_switch("live log", live);
        },
        Input::Filter(enabled) => {
            connection.set_noise_filter(enabled);
            print_switch("log filter", enabled);
        },
        Input::Auto(enabled) => {
            connection.set_auto_reconnect(enabled);
            print_switch("auto reconnect", enabled);
        },
        Input::Devices => {
            let devices = connection.known_devices();
            if devices.is_empty() {
                println!("* no known {} devices", connection.active());
            }
            for (id, name) in devices.iter() {
                println!("  {:<24} {}", id, name);
            }
        },
        Input::Rename { id, name } => match connection.rename_device(&id, &name) {
            Ok(true) => println!("* {} is now called {}", id, name),
            Ok(false) => println!("* unknown device {}", id),
            Err(err) => eprintln!("! {}", err),
        },
        Input::Forget(id) => match connection.forget_device(&id) {
            Ok(true) => println!("* forgot {}", id),
            Ok(false) => println!("* unknown device {}", id),
            Err(err) => eprintln!("! {}", err),
        },
        Input::Connect => report(connection.connect().await),
        Input::Disconnect => connection.disconnect().await,
        Input::Reconnect => report(connection.reconnect_now().await),
        Input::Transport(kind) => {
            connection.select_transport(kind).await;
            println!("* using {}", kind);
        },
        Input::Help => println!("{}", HELP),
        Input::Invalid(message) => eprintln!("! {}", message),
        Input::Quit => return false,
    }

    true
}

pub async fn run(args: Args, prefs: Preferences) -> Result<(), AppRunError> {
    if args.no_auto_reconnect {
        prefs.set_auto_reconnect(false);
    }
    if args.raw_log {
        prefs.set_log_filter(false);
    }

    let ble = BleTransport::new(args.device.clone(), Duration::from_secs(args.scan_secs));
    let serial = SerialTransport::new(args.device.clone(), args.baud);
    let (sender, mut events) = unbounded();
    let mut connection = Connection::new(ble, serial, prefs, sender);

    if let Some(kind) = args.transport {
        connection.select_transport(kind).await;
    }
    info!("Using {}", connection.active());

    if !args.offline {
        report(connection.connect().await);
    }
    print_pending(&mut events);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line.map_err(|source| AppRunError::Terminal { source })?;
                // end of input quits too
                let Some(line) = line else { break };
                let keep_going = execute(&mut connection, parse_input(&line)).await;
                print_pending(&mut events);
                if !keep_going {
                    break;
                }
            },
            Some(event) = events.next() => print_event(&event),
            wake = connection.wait() => connection.process(wake).await,
        }
    }

    connection.close().await;
    print_pending(&mut events);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lamp_commands_pass_through() {
        assert_eq!(parse_input("  bri 50 "), Input::Command("bri 50".to_string()));
        assert_eq!(parse_input("notify 80 40 80 120 fade=40"), Input::Command("notify 80 40 80 120 fade=40".to_string()));
        assert_eq!(parse_input("   "), Input::Empty);
    }

    #[test]
    fn meta_commands() {
        assert_eq!(parse_input(":status"), Input::Status);
        assert_eq!(parse_input(":live off"), Input::Live(false));
        assert_eq!(parse_input(":filter on"), Input::Filter(true));
        assert_eq!(parse_input(":auto 0"), Input::Auto(false));
        assert_eq!(parse_input(":transport serial"), Input::Transport(TransportKind::Serial));
        assert_eq!(parse_input(":q"), Input::Quit);
        assert_eq!(
            parse_input(":rename AA:BB Lamp im Flur"),
            Input::Rename { id: "AA:BB".to_string(), name: "Lamp im Flur".to_string() }
        );
        assert_eq!(parse_input(":forget usb:1a86:7523"), Input::Forget("usb:1a86:7523".to_string()));
    }

    #[test]
    fn bad_meta_commands() {
        assert!(matches!(parse_input(":live maybe"), Input::Invalid(message) if message.contains(":live")));
        assert!(matches!(parse_input(":rename AA:BB"), Input::Invalid(_)));
        assert!(matches!(parse_input(":forget"), Input::Invalid(_)));
        assert!(matches!(parse_input(":transport usb"), Input::Invalid(_)));
        assert!(matches!(parse_input(":frobnicate"), Input::Invalid(_)));
    }

    #[test]
    fn timestamps_are_rfc3339() {
        assert_eq!(format_ts(1_700_000_000_123), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn args_parse() {
        let args = Args::parse_from(["quarzlampe-link", "--transport", "serial", "--device", "ttyUSB0", "-v"]);
        assert_eq!(args.transport, Some(TransportKind::Serial));
        assert_eq!(args.device.as_deref(), Some("ttyUSB0"));
        assert_eq!(args.baud, SERIAL_BAUD_RATE);
        assert!(args.verbose);
        assert!(!args.raw_log);
    }
}
