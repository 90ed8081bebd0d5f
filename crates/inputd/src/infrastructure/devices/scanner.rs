//! Polling hot-plug scanner.
//!
//! Every [`SCAN_INTERVAL`] the scanner re-enumerates the event nodes,
//! probes newcomers, classifies them, and announces them to the engine
//! as [`HotplugEvent::Added`] together with the normalizer instance the
//! class calls for.  Each added device gets a blocking reader task that
//! pumps raw events into the engine channel; when the stream ends or
//! errors, the reader announces the removal itself.
//!
//! Probe failures are logged and the node is retried on the next scan.
//! Nothing on this path is fatal to the daemon.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use input_core::codes::{BTN_LEFT, BTN_MIDDLE, BTN_RIGHT};
use input_core::normalize::tablet::TabletNormalizer;
use input_core::normalize::touchpad::{TouchpadConfig, TouchpadLimits, TouchpadPipeline};
use input_core::{classify, DeviceCaps, DeviceClass};

use crate::application::engine::{EngineMsg, HotplugEvent, Normalizer};

use super::evdev::node_number;
use super::leds::SharedKeyboards;
use super::{DeviceSource, EventStream};

/// Rescan period for the polling hot-plug loop.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(2);

// Abs axis ranges are not mirrored in sysfs.  These are the common
// Synaptics envelopes; the touchpad pipeline only derives edge zones
// and the speed diagonal from them.
const TOUCHPAD_X_RANGE: (i32, i32) = (1472, 5472);
const TOUCHPAD_Y_RANGE: (i32, i32) = (1408, 4448);
const TOUCHPAD_PRESSURE_RANGE: (i32, i32) = (0, 255);

// Tablets without a per-model quirk report on this range.
const TABLET_AXIS_RANGE: (i32, i32) = (0, 4095);

pub struct DeviceScanner {
    source: Box<dyn DeviceSource>,
    tx: mpsc::Sender<EngineMsg>,
    touchpad_config: TouchpadConfig,
    keyboards: SharedKeyboards,
    /// Node name to routing slot, for everything currently announced.
    known: HashMap<String, u8>,
    /// Blacklisted or unsupported nodes, skipped until they unplug.
    ignored: HashSet<String>,
}

impl DeviceScanner {
    pub fn new(
        source: Box<dyn DeviceSource>,
        tx: mpsc::Sender<EngineMsg>,
        touchpad_config: TouchpadConfig,
        keyboards: SharedKeyboards,
    ) -> Self {
        Self {
            source,
            tx,
            touchpad_config,
            keyboards,
            known: HashMap::new(),
            ignored: HashSet::new(),
        }
    }

    /// Runs the polling loop until the engine channel closes.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        loop {
            interval.tick().await;
            if !self.rescan().await {
                return;
            }
        }
    }

    /// One enumeration pass.  Returns false once the engine is gone.
    pub async fn rescan(&mut self) -> bool {
        let nodes = match self.source.enumerate() {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "device enumeration failed");
                return true;
            }
        };
        let present: HashSet<&String> = nodes.iter().collect();

        // Unplugged nodes first.  The reader task usually notices before
        // the scan does; the engine treats the duplicate as a no-op.
        let gone: Vec<(String, u8)> = self
            .known
            .iter()
            .filter(|(node, _)| !present.contains(node))
            .map(|(node, &slot)| (node.clone(), slot))
            .collect();
        for (node, slot) in gone {
            info!(node = %node, slot, "device unplugged");
            self.known.remove(&node);
            self.keyboards.lock().unwrap_or_else(|e| e.into_inner()).remove(&node);
            if !self.announce(HotplugEvent::Removed { slot }).await {
                return false;
            }
        }
        self.ignored.retain(|node| present.contains(node));

        for node in &nodes {
            if self.known.contains_key(node) || self.ignored.contains(node) {
                continue;
            }
            if !self.add_node(node).await {
                return false;
            }
        }
        true
    }

    async fn add_node(&mut self, node: &str) -> bool {
        let Some(slot) = node_number(node) else {
            debug!(node = %node, "skipping node without an event number");
            self.ignored.insert(node.to_string());
            return true;
        };

        let caps = match self.source.probe(node) {
            Ok(caps) => caps,
            Err(e) => {
                // Retried on the next scan.
                warn!(node = %node, error = %e, "device probe failed");
                return true;
            }
        };

        let class = classify(&caps);
        if class == DeviceClass::Ignored {
            debug!(node = %node, name = %caps.name, "ignoring device");
            self.ignored.insert(node.to_string());
            return true;
        }

        let stream = match self.source.open(node) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(node = %node, error = %e, "device open failed");
                return true;
            }
        };

        info!(node = %node, name = %caps.name, ?class, slot, "device added");
        let normalizer = self.build_normalizer(class, &caps);
        if !self
            .announce(HotplugEvent::Added {
                slot,
                class,
                normalizer,
            })
            .await
        {
            return false;
        }

        if class == DeviceClass::Keyboard {
            self.keyboards
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(node.to_string());
        }
        self.known.insert(node.to_string(), slot);
        spawn_reader(self.tx.clone(), node.to_string(), slot, stream);
        true
    }

    fn build_normalizer(&self, class: DeviceClass, caps: &DeviceCaps) -> Normalizer {
        match class {
            DeviceClass::Touchpad => {
                let limits = TouchpadLimits::new(
                    TOUCHPAD_X_RANGE,
                    TOUCHPAD_Y_RANGE,
                    TOUCHPAD_PRESSURE_RANGE,
                    caps.has_key(BTN_RIGHT),
                    caps.has_key(BTN_MIDDLE),
                    caps.has_key(BTN_LEFT),
                );
                Normalizer::Touchpad(TouchpadPipeline::new(limits, self.touchpad_config))
            }
            DeviceClass::Tablet(kind) => {
                match TabletNormalizer::new(
                    kind,
                    caps.vendor,
                    caps.product,
                    TABLET_AXIS_RANGE,
                    TABLET_AXIS_RANGE,
                ) {
                    Ok(normalizer) => Normalizer::Tablet(normalizer),
                    Err(e) => {
                        warn!(name = %caps.name, error = %e, "tablet geometry rejected");
                        Normalizer::None
                    }
                }
            }
            _ => Normalizer::None,
        }
    }

    async fn announce(&self, event: HotplugEvent) -> bool {
        self.tx.send(EngineMsg::Hotplug(event)).await.is_ok()
    }
}

/// Pumps one device's events into the engine until the stream ends,
/// then announces the removal.
fn spawn_reader(
    tx: mpsc::Sender<EngineMsg>,
    node: String,
    slot: u8,
    mut stream: Box<dyn EventStream>,
) {
    tokio::task::spawn_blocking(move || {
        loop {
            match stream.next_event() {
                Ok(Some(event)) => {
                    if tx.blocking_send(EngineMsg::Device { slot, event }).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(node = %node, error = %e, "device read failed");
                    break;
                }
            }
        }
        debug!(node = %node, "device reader finished");
        let _ = tx.blocking_send(EngineMsg::Hotplug(HotplugEvent::Removed { slot }));
    });
}
