#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    // BLE
    Discovering,
    Connecting,
    Subscribing,
    // Serial
    PortRequested,
    Opening,
    Ready,
}

/// Where a line came from. Lines of different sources are not ordered against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    CommandCharacteristic,
    StatusCharacteristic,
    SerialPort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Line { source: LineSource, line: String },
    /// The link went away without being asked to.
    Dropped(String),
}

/// Identity of a connected device. `id` is stable across connections (BLE address, or USB
/// vendor/product id of a serial adapter), `name` is what the device calls itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
}
