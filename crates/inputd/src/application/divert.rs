//! Per-domain input diversion descriptors.
//!
//! A guest agent that shares an application window into another domain can
//! install diversion rules on its own domain:
//!
//! - A **keyboard filter**: a list of modifier+key chords that must be
//!   reflected back to the owning domain instead of reaching the focused
//!   guest (so the sharing VM still sees its own shortcuts).
//! - A **keyboard divert**: all keyboard input goes to a chosen target
//!   domain while the owner keeps the screen.
//! - A **mouse divert**: pointer events inside a source sub-frame of the
//!   owner's surface are rescaled into a destination frame and delivered to
//!   the target domain.
//!
//! The `focus_mode` bits refine pointer behaviour while a mouse divert is
//! active.

use input_core::codes::{KEY_LEFTALT, KEY_LEFTCTRL, KEY_RIGHTALT, KEY_RIGHTCTRL};
use input_core::Rect;
use thiserror::Error;

/// Hard cap on tracked modifier codes per domain.
pub const MAX_MODS: usize = 20;

/// A click inside the diverted frame moves keyboard focus to the target.
pub const FOCUS_MODE_KEY_FOLLOW_MOUSE: u32 = 1;
/// While a button is held, pointer events stick to the domain the press
/// started in, even across the frame boundary.
pub const FOCUS_MODE_CLICK_HOLD: u32 = 2;
/// Pointer events inside the frame are also cloned to the owning domain.
pub const FOCUS_MODE_CLONE_EVENTS: u32 = 4;
/// Highest valid focus-mode bit combination.
pub const FOCUS_MODE_MAX: u32 = 7;

/// Error type for diversion control operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DivertError {
    /// The calling domain is not registered.
    #[error("caller domain is not known to the daemon")]
    NoSourceId,

    /// The named target domain does not exist.
    #[error("no domain with uuid {uuid}")]
    BadUuid { uuid: String },

    /// A diversion frame has zero width or height.
    #[error("the {which} frame cannot have an area of zero")]
    BadFrame { which: &'static str },

    /// The keyboard filter cannot change while a keyboard divert is active.
    #[error("cannot set filter while filter is in use")]
    FilterBusy,

    /// The focus mode value exceeds [`FOCUS_MODE_MAX`].
    #[error("focus mode {mode} out of range 0..={FOCUS_MODE_MAX}")]
    FocusModeOutOfRange { mode: u32 },

    /// The per-domain modifier table is full.
    #[error("modifier table is full ({MAX_MODS} entries)")]
    TooManyModifiers,
}

/// One filtered chord: a modifier bitmask over the owner's modifier table
/// plus the action keycode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub mod_bits: u32,
    pub keycode: u16,
}

/// Diversion rules installed on one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivertInfo {
    /// Modifier codes referenced by `keylist` bitmasks.  Seeded with the
    /// alt/ctrl pairs so common chords share stable bit positions.
    pub modifiers: Vec<u16>,
    /// Filtered chords reflected back to the owner.
    pub keylist: Vec<KeyPair>,
    /// [`FOCUS_MODE_KEY_FOLLOW_MOUSE`] | [`FOCUS_MODE_CLICK_HOLD`] |
    /// [`FOCUS_MODE_CLONE_EVENTS`].
    pub focus_mode: u32,
    /// Keyboard divert target.
    pub key_domain: Option<u32>,
    /// Mouse divert target.
    pub mouse_domain: Option<u32>,
    /// Source sub-frame on the owner's surface, normalized.
    pub sframe: Rect,
    /// Destination frame on the target's surface, normalized.
    pub dframe: Rect,
}

impl Default for DivertInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl DivertInfo {
    pub fn new() -> Self {
        Self {
            modifiers: vec![KEY_LEFTALT, KEY_RIGHTALT, KEY_LEFTCTRL, KEY_RIGHTCTRL],
            keylist: Vec::new(),
            focus_mode: 0,
            key_domain: None,
            mouse_domain: None,
            sframe: Rect::new(0, 0, 0, 0),
            dframe: Rect::new(0, 0, 0, 0),
        }
    }

    /// Index of `code` in the modifier table, adding it if absent.
    ///
    /// # Errors
    ///
    /// [`DivertError::TooManyModifiers`] when the table holds [`MAX_MODS`]
    /// codes already.
    pub fn add_modifier(&mut self, code: u16) -> Result<usize, DivertError> {
        if let Some(idx) = self.modifiers.iter().position(|&m| m == code) {
            return Ok(idx);
        }
        if self.modifiers.len() >= MAX_MODS {
            return Err(DivertError::TooManyModifiers);
        }
        self.modifiers.push(code);
        Ok(self.modifiers.len() - 1)
    }

    /// Index of `code` in the modifier table, if present.
    pub fn modifier_index(&self, code: u16) -> Option<usize> {
        self.modifiers.iter().position(|&m| m == code)
    }

    /// The filtered chord matching `keycode` under `mod_bits`, if any.
    pub fn matching_pair(&self, keycode: u16, mod_bits: u32) -> Option<KeyPair> {
        self.keylist
            .iter()
            .copied()
            .find(|kp| kp.keycode == keycode && kp.mod_bits == mod_bits)
    }

    /// Replaces the keyboard filter from its flat wire encoding.
    ///
    /// The encoding is a list of keycodes where zero acts as a chord
    /// separator: within a chord, every code except the last is a modifier
    /// and the last is the action key.  `[CTRL, C, 0, CTRL, V]` filters
    /// Ctrl+C and Ctrl+V.
    ///
    /// # Errors
    ///
    /// [`DivertError::FilterBusy`] while a keyboard divert is active,
    /// [`DivertError::TooManyModifiers`] when a chord names more distinct
    /// modifiers than the table can hold.
    pub fn set_filter(&mut self, spec: &[u16]) -> Result<(), DivertError> {
        if self.key_domain.is_some() {
            return Err(DivertError::FilterBusy);
        }

        let mut keylist = Vec::new();
        let mut mod_bits: u32 = 0;

        for (i, &code) in spec.iter().enumerate() {
            if code == 0 {
                continue;
            }
            let is_last_in_chord = spec.get(i + 1).map_or(true, |&next| next == 0);
            if is_last_in_chord {
                keylist.push(KeyPair {
                    mod_bits,
                    keycode: code,
                });
                mod_bits = 0;
            } else {
                let idx = self.add_modifier(code)?;
                mod_bits |= 1 << idx;
            }
        }

        tracing::info!(shortcuts = keylist.len(), "keyboard filter installed");
        self.keylist = keylist;
        Ok(())
    }

    /// Validates and stores the mouse diversion frames, normalizing corner
    /// order per axis.
    ///
    /// # Errors
    ///
    /// [`DivertError::BadFrame`] when either frame has zero width or height.
    pub fn set_frames(&mut self, sframe: Rect, dframe: Rect) -> Result<(), DivertError> {
        if sframe.is_degenerate() {
            return Err(DivertError::BadFrame { which: "source" });
        }
        if dframe.is_degenerate() {
            return Err(DivertError::BadFrame { which: "destination" });
        }
        self.sframe = sframe.normalized();
        self.dframe = dframe.normalized();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use input_core::codes::*;

    #[test]
    fn test_new_seeds_alt_and_ctrl_modifiers() {
        let dv = DivertInfo::new();
        assert_eq!(
            dv.modifiers,
            vec![KEY_LEFTALT, KEY_RIGHTALT, KEY_LEFTCTRL, KEY_RIGHTCTRL]
        );
        assert!(dv.keylist.is_empty());
        assert_eq!(dv.focus_mode, 0);
    }

    #[test]
    fn test_add_modifier_reuses_existing_index() {
        let mut dv = DivertInfo::new();
        assert_eq!(dv.add_modifier(KEY_LEFTCTRL), Ok(2));
        assert_eq!(dv.add_modifier(KEY_LEFTSHIFT), Ok(4));
        // Repeated adds do not grow the table.
        assert_eq!(dv.add_modifier(KEY_LEFTSHIFT), Ok(4));
        assert_eq!(dv.modifiers.len(), 5);
    }

    #[test]
    fn test_add_modifier_rejects_overflow() {
        let mut dv = DivertInfo::new();
        for code in 200..216u16 {
            dv.add_modifier(code).expect("add");
        }
        assert_eq!(dv.modifiers.len(), MAX_MODS);
        assert_eq!(dv.add_modifier(250), Err(DivertError::TooManyModifiers));
    }

    #[test]
    fn test_set_filter_parses_separated_chords() {
        // Arrange: Ctrl+C and LeftAlt+Tab, zero-separated
        let mut dv = DivertInfo::new();
        let spec = [KEY_LEFTCTRL, KEY_C, 0, KEY_LEFTALT, KEY_TAB];

        // Act
        dv.set_filter(&spec).expect("set filter");

        // Assert: seeded table puts LeftAlt at bit 0, LeftCtrl at bit 2
        assert_eq!(dv.keylist.len(), 2);
        assert_eq!(
            dv.keylist[0],
            KeyPair { mod_bits: 1 << 2, keycode: KEY_C }
        );
        assert_eq!(
            dv.keylist[1],
            KeyPair { mod_bits: 1 << 0, keycode: KEY_TAB }
        );
    }

    #[test]
    fn test_set_filter_chord_without_modifiers() {
        let mut dv = DivertInfo::new();
        dv.set_filter(&[KEY_F]).expect("set filter");

        assert_eq!(dv.keylist, vec![KeyPair { mod_bits: 0, keycode: KEY_F }]);
    }

    #[test]
    fn test_set_filter_replaces_previous_list() {
        let mut dv = DivertInfo::new();
        dv.set_filter(&[KEY_LEFTCTRL, KEY_C]).expect("first");
        dv.set_filter(&[KEY_LEFTCTRL, KEY_V]).expect("second");

        assert_eq!(dv.keylist.len(), 1);
        assert_eq!(dv.keylist[0].keycode, KEY_V);
    }

    #[test]
    fn test_set_filter_busy_while_keyboard_diverted() {
        let mut dv = DivertInfo::new();
        dv.key_domain = Some(7);

        assert_eq!(dv.set_filter(&[KEY_C]), Err(DivertError::FilterBusy));
    }

    #[test]
    fn test_matching_pair_requires_exact_mod_bits() {
        let mut dv = DivertInfo::new();
        dv.set_filter(&[KEY_LEFTCTRL, KEY_C]).expect("set filter");
        let bits = 1 << 2;

        assert!(dv.matching_pair(KEY_C, bits).is_some());
        assert!(dv.matching_pair(KEY_C, 0).is_none());
        assert!(dv.matching_pair(KEY_V, bits).is_none());
    }

    #[test]
    fn test_set_frames_rejects_zero_area() {
        let mut dv = DivertInfo::new();
        let good = Rect::new(0, 0, 100, 100);
        let flat = Rect::new(5, 0, 5, 100);

        assert_eq!(
            dv.set_frames(flat, good),
            Err(DivertError::BadFrame { which: "source" })
        );
        assert_eq!(
            dv.set_frames(good, flat),
            Err(DivertError::BadFrame { which: "destination" })
        );
    }

    #[test]
    fn test_set_frames_normalizes_corner_order() {
        let mut dv = DivertInfo::new();
        dv.set_frames(Rect::new(100, 200, 0, 0), Rect::new(50, 50, 10, 10))
            .expect("set frames");

        assert_eq!(dv.sframe, Rect::new(0, 0, 100, 200));
        assert_eq!(dv.dframe, Rect::new(10, 10, 50, 50));
    }
}
