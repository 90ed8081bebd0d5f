//! Keyboard LED write-back.
//!
//! The arbiter requests LED updates when keyboard focus lands on a
//! domain with a remembered lock-key state.  This sink fans each update
//! out to every keyboard-classified device node; the scanner keeps the
//! node set current across hot-plugs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::application::engine::LedSink;

use super::DeviceSource;

/// Keyboard node set shared between the scanner and the LED sink.
pub type SharedKeyboards = Arc<Mutex<HashSet<String>>>;

pub fn shared_keyboards() -> SharedKeyboards {
    Arc::new(Mutex::new(HashSet::new()))
}

/// [`LedSink`] that writes through a [`DeviceSource`] to every known
/// keyboard node.  Write failures are logged and skipped; a dead node
/// is about to be removed by the scanner anyway.
pub struct DeviceLedSink<S> {
    source: S,
    keyboards: SharedKeyboards,
}

impl<S: DeviceSource> DeviceLedSink<S> {
    pub fn new(source: S, keyboards: SharedKeyboards) -> Self {
        Self { source, keyboards }
    }
}

impl<S: DeviceSource> LedSink for DeviceLedSink<S> {
    fn set_led(&mut self, led: u16, on: bool) {
        let nodes: Vec<String> = {
            let guard = self.keyboards.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().cloned().collect()
        };
        for node in nodes {
            if let Err(e) = self.source.set_led(&node, led, on) {
                warn!(node = %node, error = %e, "led write failed");
            }
        }
    }
}
