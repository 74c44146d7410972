use uuid::Uuid;

/**
 * Delay (milliseconds) between an unexpected disconnect and the reconnect attempt.
 */
pub const RECONNECT_DELAY: u64 = 800;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (seconds) to scan for the lamp before giving up, unless overridden.
 */
pub const DEFAULT_SCAN_SECS: u64 = 4;

/**
 * The UUID of the Bluetooth BLE service of the lamp firmware.
 */
pub const LAMP_SERVICE: &str = "d94d86d7-1eaf-47a4-9d1e-7a90bf34e66b";

/**
 * The UUID of the characteristic that accepts text commands (write without response).
 */
pub const LAMP_COMMAND_CHARACTERISTIC: &str = "4bb5047d-0d8b-4c5e-81cd-6fb5c0d1d1f7";

/**
 * The UUID of the characteristic that notifies status lines.
 */
pub const LAMP_STATUS_CHARACTERISTIC: &str = "c5ad78b6-9b77-4a96-9a42-8e6e9a40c123";

/**
 * Names the firmware advertises by default, used when a device does not include the
 * service UUID in its advertisement.
 */
pub const LAMP_ADVERTISED_NAMES: [&str; 3] = ["Quarzlampe", "Schreibtischlampe", "Superduperlampe"];

pub const SERIAL_BAUD_RATE: u32 = 115200;

/**
 * Read timeout (milliseconds) of the serial port; bounds how long closing the port may take.
 */
pub const SERIAL_READ_TIMEOUT: u64 = 100;

/**
 * Commands sent to pull a full status snapshot.
 */
pub const COMMAND_STATUS: &str = "status";
pub const COMMAND_CUSTOM_EXPORT: &str = "custom export";

pub fn make_lamp_service_uuid() -> Uuid {
    Uuid::parse_str(LAMP_SERVICE).unwrap()
}

pub fn make_lamp_command_uuid() -> Uuid {
    Uuid::parse_str(LAMP_COMMAND_CHARACTERISTIC).unwrap()
}

pub fn make_lamp_status_uuid() -> Uuid {
    Uuid::parse_str(LAMP_STATUS_CHARACTERISTIC).unwrap()
}
