//! Mock device source for unit testing.
//!
//! Lets tests present synthetic devices with canned capabilities and
//! event streams, without touching `/dev/input`.  The handle is cheaply
//! cloneable so a test can keep mutating the device set after handing
//! the source to a scanner.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use input_core::{DeviceCaps, InputEvent};

use super::{DeviceError, DeviceSource, EventStream};

#[derive(Default)]
struct Inner {
    devices: HashMap<String, MockDevice>,
    led_writes: Vec<(String, u16, bool)>,
}

#[derive(Default, Clone)]
struct MockDevice {
    caps: DeviceCaps,
    events: VecDeque<InputEvent>,
}

/// A mock implementation of [`DeviceSource`] with an injectable device
/// table.
#[derive(Clone, Default)]
pub struct MockDeviceSource {
    inner: Arc<Mutex<Inner>>,
}

impl MockDeviceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a synthetic device with a canned event stream.
    pub fn add_device(&self, node: &str, caps: DeviceCaps, events: Vec<InputEvent>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.devices.insert(
            node.to_string(),
            MockDevice {
                caps,
                events: events.into(),
            },
        );
    }

    /// Unplugs a synthetic device.
    pub fn remove_device(&self, node: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.devices.remove(node);
    }

    /// Returns every LED write performed through this source.
    pub fn led_writes(&self) -> Vec<(String, u16, bool)> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).led_writes.clone()
    }
}

impl DeviceSource for MockDeviceSource {
    fn enumerate(&mut self) -> Result<Vec<String>, DeviceError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut nodes: Vec<String> = inner.devices.keys().cloned().collect();
        nodes.sort();
        Ok(nodes)
    }

    fn probe(&mut self, node: &str) -> Result<DeviceCaps, DeviceError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .devices
            .get(node)
            .map(|d| d.caps.clone())
            .ok_or_else(|| DeviceError::NoSuchDevice {
                node: node.to_string(),
            })
    }

    fn open(&mut self, node: &str) -> Result<Box<dyn EventStream>, DeviceError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let device = inner
            .devices
            .get(node)
            .ok_or_else(|| DeviceError::NoSuchDevice {
                node: node.to_string(),
            })?;
        Ok(Box::new(MockStream {
            events: device.events.clone(),
        }))
    }

    fn set_led(&mut self, node: &str, led: u16, on: bool) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.devices.contains_key(node) {
            return Err(DeviceError::NoSuchDevice {
                node: node.to_string(),
            });
        }
        inner.led_writes.push((node.to_string(), led, on));
        Ok(())
    }
}

struct MockStream {
    events: VecDeque<InputEvent>,
}

impl EventStream for MockStream {
    fn next_event(&mut self) -> Result<Option<InputEvent>, DeviceError> {
        Ok(self.events.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use input_core::codes::{EV_KEY, KEY_A, LED_CAPSL};

    fn keyboard_caps() -> DeviceCaps {
        DeviceCaps {
            name: "Mock Keyboard".to_string(),
            ..DeviceCaps::default()
        }
    }

    #[test]
    fn test_mock_source_enumerates_in_order() {
        // Arrange
        let source = MockDeviceSource::new();
        source.add_device("event3", keyboard_caps(), vec![]);
        source.add_device("event1", keyboard_caps(), vec![]);

        // Act
        let nodes = source.clone().enumerate().expect("enumerate");

        // Assert
        assert_eq!(nodes, vec!["event1".to_string(), "event3".to_string()]);
    }

    #[test]
    fn test_mock_stream_drains_then_ends() {
        // Arrange
        let source = MockDeviceSource::new();
        source.add_device(
            "event0",
            keyboard_caps(),
            vec![InputEvent::new(EV_KEY, KEY_A, 1)],
        );
        let mut stream = source.clone().open("event0").expect("open");

        // Act / Assert
        assert_eq!(
            stream.next_event().expect("read"),
            Some(InputEvent::new(EV_KEY, KEY_A, 1))
        );
        assert_eq!(stream.next_event().expect("read"), None);
    }

    #[test]
    fn test_mock_source_records_led_writes() {
        // Arrange
        let source = MockDeviceSource::new();
        source.add_device("event0", keyboard_caps(), vec![]);

        // Act
        source
            .clone()
            .set_led("event0", LED_CAPSL, true)
            .expect("led");

        // Assert
        assert_eq!(source.led_writes(), vec![("event0".to_string(), LED_CAPSL, true)]);
    }

    #[test]
    fn test_unknown_node_errors() {
        let mut source = MockDeviceSource::new();
        assert!(matches!(
            source.probe("event9"),
            Err(DeviceError::NoSuchDevice { .. })
        ));
    }
}
