//! Host input-device access.
//!
//! The [`DeviceSource`] trait covers the three things the daemon needs
//! from the platform: enumerating event nodes, probing their
//! capabilities, and opening their event streams.  The production
//! implementation is [`evdev::EvdevSource`]; tests use
//! [`mock::MockDeviceSource`].
//!
//! # What is evdev? (for beginners)
//!
//! On Linux every input device (keyboard, mouse, touchpad, tablet, lid
//! switch) appears as a character device `/dev/input/eventN`.  Reading
//! from it yields fixed-size `struct input_event` records: a timestamp,
//! an event type (`EV_KEY`, `EV_REL`, ...), a code (which key, which
//! axis), and a value.  Writing an `EV_LED` record to the same node sets
//! a keyboard LED.  The kernel also mirrors each device's capability
//! bitmasks under `/sys/class/input/eventN/device/`, which is what the
//! probe reads to feed the classifier.
//!
//! Probe failures are never fatal: the scanner logs them and retries the
//! node on the next rescan.  A read error on an open stream is treated
//! as a device removal.

use input_core::{DeviceCaps, InputEvent};

pub mod evdev;
pub mod leds;
pub mod mock;
pub mod scanner;

/// Error type for device access.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("i/o error on {node}: {source}")]
    Io {
        node: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed sysfs attribute {attr} for {node}")]
    BadAttribute { node: String, attr: &'static str },
    #[error("no such device: {node}")]
    NoSuchDevice { node: String },
}

/// A blocking stream of events from one open device.
///
/// `Ok(None)` means the device went away; the reader treats any error
/// the same way.
pub trait EventStream: Send {
    fn next_event(&mut self) -> Result<Option<InputEvent>, DeviceError>;
}

/// Access to the host's input devices.
pub trait DeviceSource: Send + Sync {
    /// Lists the event nodes currently present, by node name
    /// (`event0`, `event1`, ...).
    fn enumerate(&mut self) -> Result<Vec<String>, DeviceError>;

    /// Probes the capabilities of one node for the classifier.
    fn probe(&mut self, node: &str) -> Result<DeviceCaps, DeviceError>;

    /// Opens the event stream of one node.
    fn open(&mut self, node: &str) -> Result<Box<dyn EventStream>, DeviceError>;

    /// Writes one LED state to one node.
    fn set_led(&mut self, node: &str, led: u16, on: bool) -> Result<(), DeviceError>;
}
