//! Multitouch-to-single-touch flattening.
//!
//! Touch-capable pointer devices report multiple contact slots
//! (`ABS_MT_SLOT`) with per-slot positions and tracking ids.  Guests only
//! understand a single-touch mouse, so this stage:
//!
//! - forwards slot 0's `ABS_MT_POSITION_X/Y` as plain `ABS_X`/`ABS_Y`;
//! - turns slot 0's tracking-id appearing/disappearing into a synthetic
//!   `BTN_LEFT` down/up, deferred until after the current packet so the
//!   position lands before the click;
//! - discards events belonging to non-zero slots, flushing a pending sync
//!   first when the stream leaves slot 0 mid-packet.
//!
//! One flattener instance exists per touch-capable device slot.

use crate::event::codes::*;
use crate::event::InputEvent;

// MT axis codes outside the handled set are consumed without forwarding.
const ABS_MT_FIRST: u16 = 0x30;
const ABS_MT_LAST: u16 = 0x3a;

/// Per-device multitouch flattening state.
#[derive(Debug, Default)]
pub struct MultitouchFlattener {
    /// Currently selected contact slot.
    slot: i32,
    /// Whether slot 0 currently has a live contact.
    pressed: bool,
    /// Whether the current packet carried any slot-0 state.
    had_slot0: bool,
    /// Deferred synthetic click: `Some(true)` press, `Some(false)` release.
    defer: Option<bool>,
}

impl MultitouchFlattener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one raw event, returning the canonical events to forward.
    pub fn handle_event(&mut self, ev: InputEvent) -> Vec<InputEvent> {
        if self.slot != 0 {
            return self.handle_nonzero_slot(ev);
        }

        match ev.kind {
            EV_SYN => self.handle_sync(ev),
            EV_ABS => self.handle_abs(ev),
            _ => {
                self.had_slot0 = true;
                vec![ev]
            }
        }
    }

    fn handle_nonzero_slot(&mut self, ev: InputEvent) -> Vec<InputEvent> {
        if ev.is_sync_report() {
            self.slot = 0;
            self.had_slot0 = false;
        } else if ev.kind == EV_ABS && ev.code == ABS_MT_SLOT {
            self.slot = ev.value;
            if self.slot == 0 {
                self.had_slot0 = true;
            }
        }

        // A deferred click replaces whatever arrived while we sat in a
        // non-zero slot.
        match self.defer.take() {
            Some(down) => vec![
                InputEvent::key(BTN_LEFT, i32::from(down)),
                InputEvent::sync(),
            ],
            None => Vec::new(),
        }
    }

    fn handle_sync(&mut self, ev: InputEvent) -> Vec<InputEvent> {
        match ev.code {
            // Protocol-A contact terminator: promote to a packet terminator
            // and treat what follows as a secondary contact.
            SYN_MT_REPORT => {
                self.slot = 1;
                vec![InputEvent::sync()]
            }
            SYN_REPORT => {
                self.had_slot0 = false;
                match self.defer.take() {
                    Some(down) => vec![
                        InputEvent::sync(),
                        InputEvent::key(BTN_LEFT, i32::from(down)),
                        InputEvent::sync(),
                    ],
                    None => vec![ev],
                }
            }
            _ => vec![ev],
        }
    }

    fn handle_abs(&mut self, ev: InputEvent) -> Vec<InputEvent> {
        match ev.code {
            ABS_MT_POSITION_X => vec![InputEvent::abs(ABS_X, ev.value)],
            ABS_MT_POSITION_Y => vec![InputEvent::abs(ABS_Y, ev.value)],
            ABS_MT_TRACKING_ID => {
                let now_pressed = ev.value != -1;
                if self.pressed != now_pressed {
                    self.pressed = now_pressed;
                    self.had_slot0 = true;
                    self.defer = Some(now_pressed);
                    Vec::new()
                } else {
                    vec![ev]
                }
            }
            ABS_MT_SLOT => {
                self.slot = ev.value;
                if self.slot != 0 {
                    if self.had_slot0 {
                        // Flush the slot-0 half of the packet before the
                        // stream switches contacts.
                        return vec![InputEvent::sync()];
                    }
                    Vec::new()
                } else {
                    self.had_slot0 = true;
                    Vec::new()
                }
            }
            ABS_MT_FIRST..=ABS_MT_LAST => {
                self.had_slot0 = true;
                Vec::new()
            }
            _ => vec![ev],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(flat: &mut MultitouchFlattener, events: &[InputEvent]) -> Vec<InputEvent> {
        events
            .iter()
            .flat_map(|&e| flat.handle_event(e))
            .collect()
    }

    #[test]
    fn test_single_touch_flick_becomes_left_click() {
        // Arrange: protocol-B single contact on slot 0.
        let mut flat = MultitouchFlattener::new();

        // Act – finger down packet
        let out = feed(
            &mut flat,
            &[
                InputEvent::abs(ABS_MT_SLOT, 0),
                InputEvent::abs(ABS_MT_TRACKING_ID, 5),
                InputEvent::abs(ABS_MT_POSITION_X, 1000),
                InputEvent::abs(ABS_MT_POSITION_Y, 2000),
                InputEvent::sync(),
            ],
        );

        // Assert – positions first, then the deferred press after the sync
        assert_eq!(
            out,
            vec![
                InputEvent::abs(ABS_X, 1000),
                InputEvent::abs(ABS_Y, 2000),
                InputEvent::sync(),
                InputEvent::key(BTN_LEFT, 1),
                InputEvent::sync(),
            ]
        );

        // Act – finger up packet
        let out = feed(
            &mut flat,
            &[InputEvent::abs(ABS_MT_TRACKING_ID, -1), InputEvent::sync()],
        );

        // Assert
        assert_eq!(
            out,
            vec![
                InputEvent::sync(),
                InputEvent::key(BTN_LEFT, 0),
                InputEvent::sync(),
            ]
        );
    }

    #[test]
    fn test_plain_motion_passes_through() {
        let mut flat = MultitouchFlattener::new();
        // Contact already established
        flat.pressed = true;

        let out = feed(
            &mut flat,
            &[
                InputEvent::abs(ABS_MT_POSITION_X, 11),
                InputEvent::abs(ABS_MT_POSITION_Y, 22),
                InputEvent::sync(),
            ],
        );

        assert_eq!(
            out,
            vec![
                InputEvent::abs(ABS_X, 11),
                InputEvent::abs(ABS_Y, 22),
                InputEvent::sync(),
            ]
        );
    }

    #[test]
    fn test_second_finger_events_are_discarded() {
        let mut flat = MultitouchFlattener::new();
        flat.pressed = true;

        let out = feed(
            &mut flat,
            &[
                InputEvent::abs(ABS_MT_SLOT, 1),
                InputEvent::abs(ABS_MT_TRACKING_ID, 9),
                InputEvent::abs(ABS_MT_POSITION_X, 500),
                InputEvent::abs(ABS_MT_POSITION_Y, 600),
            ],
        );

        assert!(out.is_empty());
    }

    #[test]
    fn test_leaving_slot0_mid_packet_flushes_sync() {
        let mut flat = MultitouchFlattener::new();
        flat.pressed = true;

        let out = feed(
            &mut flat,
            &[
                InputEvent::abs(ABS_MT_POSITION_X, 100),
                InputEvent::abs(ABS_MT_SLOT, 1),
            ],
        );

        // The slot-0 position must be terminated before the switch.
        assert_eq!(
            out,
            vec![InputEvent::abs(ABS_X, 100), InputEvent::sync()]
        );
    }

    #[test]
    fn test_sync_report_returns_stream_to_slot0() {
        let mut flat = MultitouchFlattener::new();
        flat.pressed = true;

        feed(&mut flat, &[InputEvent::abs(ABS_MT_SLOT, 1)]);
        let out = feed(
            &mut flat,
            &[
                InputEvent::sync(),
                InputEvent::abs(ABS_MT_POSITION_X, 77),
            ],
        );

        assert_eq!(out, vec![InputEvent::abs(ABS_X, 77)]);
    }

    #[test]
    fn test_unchanged_tracking_id_passes_through() {
        let mut flat = MultitouchFlattener::new();
        flat.pressed = true;

        let out = feed(&mut flat, &[InputEvent::abs(ABS_MT_TRACKING_ID, 8)]);
        assert_eq!(out, vec![InputEvent::abs(ABS_MT_TRACKING_ID, 8)]);
    }

    #[test]
    fn test_touch_major_is_consumed() {
        let mut flat = MultitouchFlattener::new();
        let out = feed(&mut flat, &[InputEvent::abs(0x30, 12)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_key_events_pass_through_on_slot0() {
        let mut flat = MultitouchFlattener::new();
        let out = feed(&mut flat, &[InputEvent::key(BTN_TOUCH, 1)]);
        assert_eq!(out, vec![InputEvent::key(BTN_TOUCH, 1)]);
    }
}
