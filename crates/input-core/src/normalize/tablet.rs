//! Tablet and digitizer normalization.
//!
//! Rescales digitizer coordinates into the canonical absolute range and
//! translates tool buttons into mouse buttons a guest driver understands:
//! the pen becomes the left button, the eraser the right button, the
//! stylus barrel button the middle button.  A finger touch on a monotouch
//! panel becomes a left click, deferred until after the positioning packet
//! so the press lands where the finger is.
//!
//! The normalizer also feeds finger reports to the gesture recognizer and
//! holds back touch events while a gesture is partially matched.

use tracing::info;

use crate::classify::TabletKind;
use crate::event::codes::*;
use crate::event::InputEvent;
use crate::geometry::{GeometryError, ABS_RANGE_MAX};
use crate::gesture::{GestureAction, GestureTracker, Touch};

// Deferral marker: the synthetic left press goes out after the next sync.
const BTNLEFT_NEWLY_PRESSED: u8 = 2;

/// Events plus the gesture action (if any) produced by one raw event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TabletOut {
    pub events: Vec<InputEvent>,
    pub action: Option<GestureAction>,
}

/// Axis-range override for panels whose reported ranges are wrong.
pub fn quirk_axis_ranges(
    vendor: u16,
    product: u16,
    kind: TabletKind,
) -> Option<((i32, i32), (i32, i32))> {
    // This Wacom panel advertises the pen's range on the touch interface.
    if vendor == 0x056a && product == 0x00ed && kind == TabletKind::MonoTouch {
        return Some(((380, 3820), (290, 3620)));
    }
    None
}

/// Per-device tablet normalization state.
#[derive(Debug)]
pub struct TabletNormalizer {
    kind: TabletKind,
    x_offs: i32,
    y_offs: i32,
    x_mult: f64,
    y_mult: f64,
    /// Currently selected tool's mouse button, 0 until a tool is seen.
    tool: u16,
    btnleft: u8,
    pen_inrange: bool,
    ignore_events: bool,
    feeder: TouchFeeder,
}

impl TabletNormalizer {
    /// Builds the normalizer from the device's absolute axis ranges,
    /// applying [`quirk_axis_ranges`] first.
    pub fn new(
        kind: TabletKind,
        vendor: u16,
        product: u16,
        x_range: (i32, i32),
        y_range: (i32, i32),
    ) -> Result<Self, GeometryError> {
        let (x_range, y_range) = match quirk_axis_ranges(vendor, product, kind) {
            Some(ranges) => ranges,
            None => (x_range, y_range),
        };

        let x_diff = x_range.1 - x_range.0;
        let y_diff = y_range.1 - y_range.0;
        if x_diff == 0 || y_diff == 0 {
            return Err(GeometryError::DegenerateFrame);
        }

        Ok(Self {
            kind,
            x_offs: x_range.0,
            y_offs: y_range.0,
            x_mult: f64::from(ABS_RANGE_MAX) / f64::from(x_diff),
            y_mult: f64::from(ABS_RANGE_MAX) / f64::from(y_diff),
            tool: 0,
            btnleft: 0,
            pen_inrange: false,
            ignore_events: false,
            feeder: TouchFeeder::new(),
        })
    }

    /// Processes one raw event.  `tracker` is the shared gesture
    /// recognizer; touch events are withheld while it reports a partial
    /// match.
    pub fn handle_event(&mut self, ev: InputEvent, tracker: &mut GestureTracker) -> TabletOut {
        let mut out = TabletOut::default();
        let mut new_ev = ev;

        if new_ev.kind == EV_ABS {
            // While the pen hovers over a monotouch panel the finger
            // positions are stale; drop them.
            if self.pen_inrange && self.kind == TabletKind::MonoTouch {
                return out;
            }
            match new_ev.code {
                ABS_X | ABS_MT_POSITION_X => {
                    new_ev.value = self.scale_x(new_ev.value);
                }
                ABS_Y | ABS_MT_POSITION_Y => {
                    new_ev.value = self.scale_y(new_ev.value);
                }
                _ => {}
            }
        } else if new_ev.kind == EV_KEY {
            self.translate_key(&mut new_ev);
        }

        if new_ev.is_sync_report() && self.btnleft == BTNLEFT_NEWLY_PRESSED {
            // The position is out; now the deferred press.
            self.btnleft = 1;
            self.emit(&mut out, new_ev, tracker);
            self.emit(&mut out, InputEvent::key(BTN_LEFT, 1), tracker);
            self.emit(&mut out, InputEvent::sync(), tracker);
            return out;
        }

        if new_ev.kind == EV_SYN && new_ev.code == SYN_DROPPED {
            // Buffer overrun.  The packet's earlier events already went
            // out, so the marker itself must be forwarded too.
            self.ignore_events = true;
            info!("dropping tablet events until the next packet begins");
        } else if self.ignore_events {
            if new_ev.is_sync_report() {
                self.ignore_events = false;
            } else {
                return out;
            }
        }

        // A translated button goes out in both forms so tablet-aware
        // guests still see the tool event.
        if new_ev.kind == EV_KEY && new_ev.code != ev.code {
            self.emit(&mut out, ev, tracker);
        }

        self.emit(&mut out, new_ev, tracker);
        out
    }

    fn scale_x(&self, value: i32) -> i32 {
        (f64::from(value - self.x_offs) * self.x_mult).floor() as i32
    }

    fn scale_y(&self, value: i32) -> i32 {
        (f64::from(value - self.y_offs) * self.y_mult).floor() as i32
    }

    fn translate_key(&mut self, ev: &mut InputEvent) {
        match ev.code {
            BTN_TOOL_PEN => {
                if ev.value != 0 {
                    self.tool = BTN_LEFT;
                }
                self.pen_inrange = ev.value != 0;
            }
            BTN_TOOL_FINGER => {
                if ev.value != 0 {
                    self.tool = BTN_TOOL_FINGER;
                }
            }
            BTN_TOOL_RUBBER => {
                if ev.value != 0 {
                    self.tool = BTN_RIGHT;
                }
                self.pen_inrange = ev.value != 0;
            }
            BTN_TOUCH => {
                if self.tool == BTN_TOOL_FINGER {
                    if ev.value != 0 {
                        if self.btnleft == 0 && !self.pen_inrange {
                            self.btnleft = BTNLEFT_NEWLY_PRESSED;
                        }
                    } else if self.btnleft != 0 {
                        ev.code = BTN_LEFT;
                        self.btnleft = 0;
                    }
                } else if self.tool != 0 {
                    ev.code = self.tool;
                }
            }
            BTN_STYLUS => {
                ev.code = BTN_MIDDLE;
            }
            _ => {}
        }
    }

    fn emit(&mut self, out: &mut TabletOut, ev: InputEvent, tracker: &mut GestureTracker) {
        let (pass, action) = self.feeder.feed(ev, tracker);
        if action.is_some() {
            out.action = action;
        }
        if pass {
            out.events.push(ev);
        }
    }
}

// ── Gesture feeder ────────────────────────────────────────────────────────────

const MAX_SLOTS: usize = 3;

/// Accumulates per-slot multitouch state and hands finger reports to the
/// gesture recognizer at slot and packet boundaries.
#[derive(Debug)]
struct TouchFeeder {
    silence: bool,
    go_silent: bool,
    track_id: [i32; MAX_SLOTS],
    x: [i32; MAX_SLOTS],
    y: [i32; MAX_SLOTS],
    slot: i32,
    distance: i32,
    track_change: bool,
}

impl TouchFeeder {
    fn new() -> Self {
        Self {
            silence: false,
            go_silent: false,
            track_id: [-1; MAX_SLOTS],
            x: [-1; MAX_SLOTS],
            y: [-1; MAX_SLOTS],
            slot: -1,
            distance: 0,
            track_change: false,
        }
    }

    /// Returns whether `ev` may pass through, and any recognized action.
    fn feed(
        &mut self,
        ev: InputEvent,
        tracker: &mut GestureTracker,
    ) -> (bool, Option<GestureAction>) {
        if ev.kind == EV_SYN && ev.code == SYN_DROPPED {
            self.distance = 0;
            self.track_change = false;
            return (true, None);
        }

        let mut new_slot = -1;
        if ev.kind == EV_ABS && ev.code == ABS_MT_SLOT {
            new_slot = ev.value;
        }

        let mut action = None;
        if let Ok(slot) = usize::try_from(self.slot) {
            if slot < MAX_SLOTS {
                if ev.kind == EV_ABS {
                    match ev.code {
                        ABS_MT_POSITION_X => {
                            self.distance += (self.x[slot] - ev.value).abs();
                            self.x[slot] = ev.value;
                        }
                        ABS_MT_POSITION_Y => {
                            self.distance += (self.y[slot] - ev.value).abs();
                            self.y[slot] = ev.value;
                        }
                        ABS_MT_TRACKING_ID => {
                            if (self.track_id[slot] < 0) != (ev.value < 0) {
                                self.track_change = true;
                                self.track_id[slot] = ev.value;
                            }
                        }
                        _ => {}
                    }
                }

                if new_slot != -1 || ev.is_sync_report() {
                    if self.track_change || self.distance > 1 {
                        let touch = if self.track_change {
                            if self.track_id[slot] >= 0 {
                                Touch::Contact
                            } else {
                                Touch::Release
                            }
                        } else {
                            Touch::Move
                        };
                        let outcome = tracker.feed(slot, self.x[slot], self.y[slot], touch);
                        self.go_silent = outcome.tracking != 0;
                        action = outcome.action;
                    }
                    self.distance = 0;
                    self.track_change = false;
                }
            }
        }

        if new_slot != -1 {
            self.slot = new_slot;
        }

        if ev.is_sync_report() {
            self.silence = self.go_silent;
        }

        (!self.silence, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_stylus() -> TabletNormalizer {
        TabletNormalizer::new(TabletKind::Stylus, 0x1234, 0x0001, (0, 10000), (0, 10000))
            .expect("valid ranges")
    }

    fn make_monotouch() -> TabletNormalizer {
        TabletNormalizer::new(TabletKind::MonoTouch, 0x1234, 0x0001, (0, 4000), (0, 4000))
            .expect("valid ranges")
    }

    fn feed(
        tablet: &mut TabletNormalizer,
        tracker: &mut GestureTracker,
        events: &[InputEvent],
    ) -> Vec<InputEvent> {
        events
            .iter()
            .flat_map(|&e| tablet.handle_event(e, tracker).events)
            .collect()
    }

    #[test]
    fn test_degenerate_range_is_rejected() {
        let result = TabletNormalizer::new(TabletKind::Stylus, 0, 0, (100, 100), (0, 10));
        assert_eq!(result.err(), Some(GeometryError::DegenerateFrame));
    }

    #[test]
    fn test_coordinates_scale_to_canonical_range() {
        let mut tablet = make_stylus();
        let mut tracker = GestureTracker::new();

        let out = feed(
            &mut tablet,
            &mut tracker,
            &[
                InputEvent::abs(ABS_X, 5000),
                InputEvent::abs(ABS_Y, 10000),
            ],
        );
        assert_eq!(out[0], InputEvent::abs(ABS_X, 16383));
        assert_eq!(out[1], InputEvent::abs(ABS_Y, 32767));
    }

    #[test]
    fn test_wacom_quirk_overrides_reported_ranges() {
        // The probed range (0..4000) must be ignored for this panel.
        let mut tablet =
            TabletNormalizer::new(TabletKind::MonoTouch, 0x056a, 0x00ed, (0, 4000), (0, 4000))
                .expect("valid ranges");
        let mut tracker = GestureTracker::new();

        let out = feed(&mut tablet, &mut tracker, &[InputEvent::abs(ABS_X, 380)]);
        assert_eq!(out[0], InputEvent::abs(ABS_X, 0));
        let out = feed(&mut tablet, &mut tracker, &[InputEvent::abs(ABS_X, 3820)]);
        assert_eq!(out[0], InputEvent::abs(ABS_X, 32767));
    }

    #[test]
    fn test_pen_touch_becomes_left_button() {
        let mut tablet = make_stylus();
        let mut tracker = GestureTracker::new();

        let out = feed(
            &mut tablet,
            &mut tracker,
            &[
                InputEvent::key(BTN_TOOL_PEN, 1),
                InputEvent::key(BTN_TOUCH, 1),
            ],
        );

        // The tool event passes, then the touch goes out in both forms.
        assert!(out.contains(&InputEvent::key(BTN_TOOL_PEN, 1)));
        assert!(out.contains(&InputEvent::key(BTN_TOUCH, 1)));
        assert!(out.contains(&InputEvent::key(BTN_LEFT, 1)));
    }

    #[test]
    fn test_eraser_touch_becomes_right_button() {
        let mut tablet = make_stylus();
        let mut tracker = GestureTracker::new();

        let out = feed(
            &mut tablet,
            &mut tracker,
            &[
                InputEvent::key(BTN_TOOL_RUBBER, 1),
                InputEvent::key(BTN_TOUCH, 1),
            ],
        );
        assert!(out.contains(&InputEvent::key(BTN_RIGHT, 1)));
    }

    #[test]
    fn test_stylus_button_becomes_middle_button() {
        let mut tablet = make_stylus();
        let mut tracker = GestureTracker::new();

        let out = feed(&mut tablet, &mut tracker, &[InputEvent::key(BTN_STYLUS, 1)]);
        assert!(out.contains(&InputEvent::key(BTN_MIDDLE, 1)));
        assert!(out.contains(&InputEvent::key(BTN_STYLUS, 1)));
    }

    #[test]
    fn test_finger_press_defers_left_click_until_sync() {
        let mut tablet = make_monotouch();
        let mut tracker = GestureTracker::new();

        let out = feed(
            &mut tablet,
            &mut tracker,
            &[
                InputEvent::key(BTN_TOOL_FINGER, 1),
                InputEvent::key(BTN_TOUCH, 1),
                InputEvent::abs(ABS_X, 2000),
                InputEvent::abs(ABS_Y, 2000),
            ],
        );
        // No click before the packet completes.
        assert!(!out.contains(&InputEvent::key(BTN_LEFT, 1)));

        let out = feed(&mut tablet, &mut tracker, &[InputEvent::sync()]);
        assert_eq!(
            out,
            vec![
                InputEvent::sync(),
                InputEvent::key(BTN_LEFT, 1),
                InputEvent::sync(),
            ]
        );
    }

    #[test]
    fn test_finger_release_becomes_left_button_up() {
        let mut tablet = make_monotouch();
        let mut tracker = GestureTracker::new();

        feed(
            &mut tablet,
            &mut tracker,
            &[
                InputEvent::key(BTN_TOOL_FINGER, 1),
                InputEvent::key(BTN_TOUCH, 1),
                InputEvent::sync(),
            ],
        );

        let out = feed(&mut tablet, &mut tracker, &[InputEvent::key(BTN_TOUCH, 0)]);
        assert!(out.contains(&InputEvent::key(BTN_LEFT, 0)));
        assert!(out.contains(&InputEvent::key(BTN_TOUCH, 0)));
    }

    #[test]
    fn test_monotouch_abs_suppressed_while_pen_in_range() {
        let mut tablet = make_monotouch();
        let mut tracker = GestureTracker::new();

        feed(&mut tablet, &mut tracker, &[InputEvent::key(BTN_TOOL_PEN, 1)]);
        let out = feed(&mut tablet, &mut tracker, &[InputEvent::abs(ABS_X, 2000)]);
        assert!(out.is_empty());

        // Pen leaves range: finger positions flow again.
        feed(&mut tablet, &mut tracker, &[InputEvent::key(BTN_TOOL_PEN, 0)]);
        let out = feed(&mut tablet, &mut tracker, &[InputEvent::abs(ABS_X, 2000)]);
        assert!(!out.is_empty());
    }

    #[test]
    fn test_syn_dropped_discards_rest_of_packet() {
        let mut tablet = make_stylus();
        let mut tracker = GestureTracker::new();

        let out = feed(
            &mut tablet,
            &mut tracker,
            &[
                InputEvent::new(EV_SYN, SYN_DROPPED, 0),
                InputEvent::abs(ABS_X, 1000),
                InputEvent::abs(ABS_Y, 1000),
            ],
        );
        // The marker itself is forwarded so the consumer can discard the
        // partial packet; the stale positions are not.
        assert_eq!(out, vec![InputEvent::new(EV_SYN, SYN_DROPPED, 0)]);

        // The sync that ends the dropped packet resumes the flow.
        let out = feed(
            &mut tablet,
            &mut tracker,
            &[InputEvent::sync(), InputEvent::abs(ABS_X, 1000)],
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_two_finger_switch_gesture_recognized_and_silenced() {
        let mut tablet = make_monotouch();
        let mut tracker = GestureTracker::new();
        let max = 4000;

        // Finger 0 down at the right edge, mid-height.
        feed(
            &mut tablet,
            &mut tracker,
            &[
                InputEvent::abs(ABS_MT_SLOT, 0),
                InputEvent::abs(ABS_MT_POSITION_X, max - 10),
                InputEvent::abs(ABS_MT_POSITION_Y, max / 2),
                InputEvent::abs(ABS_MT_TRACKING_ID, 1),
                InputEvent::sync(),
            ],
        );
        // Finger 1 down beside it.
        feed(
            &mut tablet,
            &mut tracker,
            &[
                InputEvent::abs(ABS_MT_SLOT, 1),
                InputEvent::abs(ABS_MT_POSITION_X, max - 10),
                InputEvent::abs(ABS_MT_POSITION_Y, max / 2),
                InputEvent::abs(ABS_MT_TRACKING_ID, 2),
                InputEvent::sync(),
            ],
        );
        // Both fingers lift at the left edge.
        feed(
            &mut tablet,
            &mut tracker,
            &[
                InputEvent::abs(ABS_MT_SLOT, 0),
                InputEvent::abs(ABS_MT_POSITION_X, 10),
                InputEvent::abs(ABS_MT_POSITION_Y, max / 2),
                InputEvent::abs(ABS_MT_TRACKING_ID, -1),
                InputEvent::sync(),
            ],
        );
        let mut action = None;
        for ev in [
            InputEvent::abs(ABS_MT_SLOT, 1),
            InputEvent::abs(ABS_MT_POSITION_X, 10),
            InputEvent::abs(ABS_MT_POSITION_Y, max / 2),
            InputEvent::abs(ABS_MT_TRACKING_ID, -1),
            InputEvent::sync(),
        ] {
            let out = tablet.handle_event(ev, &mut tracker);
            if out.action.is_some() {
                action = out.action;
            }
        }

        assert_eq!(action, Some(GestureAction::SwitchRight));
    }
}
