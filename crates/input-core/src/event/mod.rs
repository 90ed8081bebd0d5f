//! Canonical event model: an evdev-style (type, code, value) triple.
//!
//! Every stage of the pipeline — normalizers, the secure-mode gate, the
//! binding matcher, the routing arbiter, and the output transports — speaks
//! this one vocabulary.  Device timestamps are deliberately absent: the
//! daemon routes in arrival order and backends stamp delivery themselves.

use serde::{Deserialize, Serialize};

pub mod codes;

use codes::*;

/// Size of the per-key down/up status table kept by the routing arbiter.
pub const KEY_STATUS_SIZE: usize = 256;

/// One unit of input: a key transition, an axis motion, or a sync marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    /// Event class (`EV_KEY`, `EV_REL`, `EV_ABS`, `EV_SYN`, ...).
    pub kind: u16,
    /// Code within the class (`KEY_A`, `REL_X`, `ABS_MT_SLOT`, ...).
    pub code: u16,
    /// Key transition (1 down / 0 up / 2 autorepeat), axis delta, or
    /// absolute position.
    pub value: i32,
}

impl InputEvent {
    pub fn new(kind: u16, code: u16, value: i32) -> Self {
        Self { kind, code, value }
    }

    /// A key or button transition.
    pub fn key(code: u16, value: i32) -> Self {
        Self::new(EV_KEY, code, value)
    }

    /// A relative axis motion.
    pub fn rel(code: u16, value: i32) -> Self {
        Self::new(EV_REL, code, value)
    }

    /// An absolute axis sample.
    pub fn abs(code: u16, value: i32) -> Self {
        Self::new(EV_ABS, code, value)
    }

    /// A `SYN_REPORT` packet terminator.
    pub fn sync() -> Self {
        Self::new(EV_SYN, SYN_REPORT, 0)
    }

    /// True for the `SYN_REPORT` packet terminator.
    pub fn is_sync_report(&self) -> bool {
        self.kind == EV_SYN && self.code == SYN_REPORT
    }

    /// True for mouse-button key codes (`BTN_LEFT` .. `BTN_EXTRA`).
    pub fn is_mouse_button(&self) -> bool {
        self.kind == EV_KEY && (BTN_LEFT..=BTN_EXTRA).contains(&self.code)
    }

    /// True for key-down transitions, including autorepeat.
    pub fn is_key_down(&self) -> bool {
        self.kind == EV_KEY && self.value != 0
    }
}

/// True for the keyboard modifier codes tracked by shortcut filtering.
pub fn is_modifier(code: u16) -> bool {
    matches!(
        code,
        KEY_LEFTCTRL
            | KEY_RIGHTCTRL
            | KEY_LEFTSHIFT
            | KEY_RIGHTSHIFT
            | KEY_LEFTALT
            | KEY_RIGHTALT
            | KEY_LEFTMETA
            | KEY_RIGHTMETA
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_constructor_is_sync_report() {
        let ev = InputEvent::sync();
        assert!(ev.is_sync_report());
        assert_eq!(ev.kind, EV_SYN);
        assert_eq!(ev.value, 0);
    }

    #[test]
    fn test_mouse_button_range() {
        assert!(InputEvent::key(BTN_LEFT, 1).is_mouse_button());
        assert!(InputEvent::key(BTN_EXTRA, 0).is_mouse_button());
        assert!(!InputEvent::key(KEY_A, 1).is_mouse_button());
        assert!(!InputEvent::key(BTN_TOUCH, 1).is_mouse_button());
    }

    #[test]
    fn test_autorepeat_counts_as_key_down() {
        assert!(InputEvent::key(KEY_A, 2).is_key_down());
        assert!(!InputEvent::key(KEY_A, 0).is_key_down());
    }

    #[test]
    fn test_modifier_predicate_covers_both_sides() {
        assert!(is_modifier(KEY_LEFTCTRL));
        assert!(is_modifier(KEY_RIGHTMETA));
        assert!(!is_modifier(KEY_A));
        assert!(!is_modifier(BTN_LEFT));
    }
}
