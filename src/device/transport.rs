use std::borrow::Cow;
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;

use crate::config::types::TransportKind;
use crate::device::types::{DeviceInfo, LinkEvent, LinkState};
use crate::error::TransportError;

pub type LinkSender = UnboundedSender<LinkEvent>;

/// A link to the lamp: Bluetooth LE or a serial port.
///
/// Lines received from the device, and an unexpected loss of the link, are reported through
/// the `LinkSender` handed to `connect`/`reconnect`.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> LinkState;

    /// Whether the platform offers this kind of transport at all (adapter present, ...).
    async fn is_supported(&mut self) -> bool;

    /// Chooses a device, opens the link and starts delivering lines.
    async fn connect(&mut self, events: LinkSender) -> Result<DeviceInfo, TransportError>;

    fn supports_reconnect(&self) -> bool;

    /// Opens the link again to the device of the previous `connect`.
    async fn reconnect(&mut self, events: LinkSender) -> Result<DeviceInfo, TransportError>;

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Closes the link. Safe to call in any state, any number of times.
    async fn disconnect(&mut self);

    /// false if losing the link only shows up as a failing read or write.
    fn reports_disconnects(&self) -> bool {
        true
    }
}

pub fn with_newline(line: &str) -> Cow<'_, str> {
    if line.ends_with('\n') {
        Cow::Borrowed(line)
    } else {
        Cow::Owned(format!("{}\n", line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newline_is_appended_once() {
        assert_eq!(with_newline("bri 50"), "bri 50\n");
        assert_eq!(with_newline("mode 3\n"), "mode 3\n");
    }
}
