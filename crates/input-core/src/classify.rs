//! Capability-based classification of freshly opened event devices.
//!
//! Classification runs once per device at scan time.  The probe data
//! (device name, bus type, and the event/key/abs capability bitsets) comes
//! from the platform layer; the rules here are pure and ordered:
//!
//! 1. Name blacklist ("video bus", a known-bad USB touchpanel) rejects the
//!    device outright.
//! 2. Only the PS/2-class, USB, RS-232, and I2C bus families are considered
//!    at all.
//! 3. A name containing "keyboard", or a USB device exposing at least
//!    [`MIN_KEYBOARD_KEYS`] ordinary key codes, is a keyboard.
//! 4. ThinkPad extra buttons and lid switches get their own classes.
//! 5. A device with no absolute axes is a mouse.
//! 6. X/Y absolute axes plus a pressure axis on the internal PS/2 bus is a
//!    touchpad.
//! 7. X/Y absolute axes on USB/RS-232/I2C is a tablet, with the subtype
//!    taken from the pen/finger tool-button capability bits.
//! 8. Anything left is treated as a mouse.
//!
//! Misclassification is recoverable (the device just behaves oddly);
//! failure to probe is non-fatal and the device is retried on the next
//! hot-plug notification.

use tracing::debug;

use crate::event::codes::*;

/// Minimum number of plain key codes (below `KEY_CAPSLOCK`) a USB device
/// must expose to be promoted to keyboard without a name match.
pub const MIN_KEYBOARD_KEYS: usize = 40;

/// Device names rejected outright, compared case-insensitively.
const NAME_BLACKLIST: &[&str] = &["video bus", "e2i technology, inc. usb touchpanel"];

/// Result of classifying one event device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Keyboard,
    Mouse,
    Touchpad,
    Tablet(TabletKind),
    /// ThinkPad ACPI extra buttons (volume, brightness, ...).
    ThinkpadAcpi,
    /// Laptop lid switch, handled by a dedicated watcher.
    LidSwitch,
    /// Blacklisted or on an unsupported bus; never opened for events.
    Ignored,
}

/// Tablet subtype, derived from the tool-button capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletKind {
    /// Pen digitizer.
    Stylus,
    /// Single-contact touch screen.
    MonoTouch,
}

impl DeviceClass {
    /// Stable numeric tag carried in wire frames.
    pub fn as_tag(&self) -> u8 {
        match self {
            DeviceClass::Keyboard => 1,
            DeviceClass::Mouse => 2,
            DeviceClass::Touchpad => 3,
            DeviceClass::Tablet(TabletKind::Stylus) => 4,
            DeviceClass::Tablet(TabletKind::MonoTouch) => 5,
            DeviceClass::ThinkpadAcpi => 6,
            DeviceClass::LidSwitch => 7,
            DeviceClass::Ignored => 0,
        }
    }
}

/// Probe data for one event device, gathered by the platform layer.
#[derive(Debug, Clone, Default)]
pub struct DeviceCaps {
    /// Reported device name.
    pub name: String,
    /// Bus type (`BUS_USB`, `BUS_I8042`, ...).
    pub bus: u16,
    /// Vendor / product ids, used for per-device quirks.
    pub vendor: u16,
    pub product: u16,
    /// Supported event types, one bit per `EV_*` value.
    pub ev_bits: u32,
    /// Supported key codes, one bit per code.
    pub key_bits: Vec<u64>,
    /// Supported absolute axes, one bit per `ABS_*` value below 64.
    pub abs_bits: u64,
}

impl DeviceCaps {
    pub fn has_ev(&self, ev: u16) -> bool {
        self.ev_bits & (1 << ev) != 0
    }

    pub fn has_key(&self, code: u16) -> bool {
        let word = (code / 64) as usize;
        self.key_bits
            .get(word)
            .is_some_and(|w| w & (1 << (code % 64)) != 0)
    }

    pub fn has_abs(&self, code: u16) -> bool {
        code < 64 && self.abs_bits & (1 << code) != 0
    }

    /// Counts supported ordinary key codes below `KEY_CAPSLOCK`.
    fn plain_key_count(&self) -> usize {
        (0..KEY_CAPSLOCK).filter(|&c| self.has_key(c)).count()
    }
}

/// Classifies one probed device.  See the module docs for rule order.
pub fn classify(caps: &DeviceCaps) -> DeviceClass {
    let name = caps.name.to_lowercase();

    if NAME_BLACKLIST.iter().any(|bad| name.contains(bad)) {
        debug!(name = %caps.name, "device blacklisted");
        return DeviceClass::Ignored;
    }

    if !matches!(caps.bus, BUS_I8042 | BUS_USB | BUS_RS232 | BUS_I2C) {
        debug!(name = %caps.name, bus = caps.bus, "unsupported bus");
        return DeviceClass::Ignored;
    }

    if name.contains("keyboard")
        || (caps.bus == BUS_USB && caps.plain_key_count() >= MIN_KEYBOARD_KEYS)
    {
        return DeviceClass::Keyboard;
    }

    if name.contains("thinkpad extra buttons") {
        return DeviceClass::ThinkpadAcpi;
    }

    if name.contains("lid switch") {
        return DeviceClass::LidSwitch;
    }

    if !caps.has_ev(EV_ABS) {
        return DeviceClass::Mouse;
    }

    let has_xy = caps.has_abs(ABS_X) && caps.has_abs(ABS_Y);

    if has_xy && caps.bus == BUS_I8042 && caps.has_abs(ABS_PRESSURE) {
        return DeviceClass::Touchpad;
    }

    if has_xy && matches!(caps.bus, BUS_USB | BUS_RS232 | BUS_I2C) {
        let kind = if caps.has_key(BTN_TOOL_PEN) {
            TabletKind::Stylus
        } else if caps.has_key(BTN_TOOL_FINGER) {
            TabletKind::MonoTouch
        } else {
            TabletKind::MonoTouch
        };
        return DeviceClass::Tablet(kind);
    }

    DeviceClass::Mouse
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(name: &str, bus: u16) -> DeviceCaps {
        DeviceCaps {
            name: name.to_string(),
            bus,
            ev_bits: 1 << EV_KEY,
            key_bits: vec![0; 12],
            ..Default::default()
        }
    }

    fn set_key(caps: &mut DeviceCaps, code: u16) {
        let word = (code / 64) as usize;
        if caps.key_bits.len() <= word {
            caps.key_bits.resize(word + 1, 0);
        }
        caps.key_bits[word] |= 1 << (code % 64);
    }

    fn set_abs_xy(caps: &mut DeviceCaps) {
        caps.ev_bits |= 1 << EV_ABS;
        caps.abs_bits |= (1 << ABS_X) | (1 << ABS_Y);
    }

    // ── Blacklist and bus filtering ───────────────────────────────────────────

    #[test]
    fn test_video_bus_is_ignored() {
        let c = caps("Video Bus", BUS_USB);
        assert_eq!(classify(&c), DeviceClass::Ignored);
    }

    #[test]
    fn test_known_bad_touchpanel_is_ignored() {
        let c = caps("e2i Technology, Inc. USB Touchpanel", BUS_USB);
        assert_eq!(classify(&c), DeviceClass::Ignored);
    }

    #[test]
    fn test_unsupported_bus_is_ignored() {
        // Bluetooth (0x05) is not in the allowlist.
        let c = caps("BT Mouse", 0x05);
        assert_eq!(classify(&c), DeviceClass::Ignored);
    }

    // ── Keyboard rules ────────────────────────────────────────────────────────

    #[test]
    fn test_name_match_makes_keyboard() {
        let c = caps("AT Translated Set 2 keyboard", BUS_I8042);
        assert_eq!(classify(&c), DeviceClass::Keyboard);
    }

    #[test]
    fn test_keyboard_name_match_is_case_insensitive() {
        let c = caps("Dell USB Keyboard", BUS_USB);
        assert_eq!(classify(&c), DeviceClass::Keyboard);
    }

    #[test]
    fn test_usb_device_with_many_keys_is_keyboard() {
        let mut c = caps("Vendor Composite Device", BUS_USB);
        for code in KEY_ESC..KEY_ESC + MIN_KEYBOARD_KEYS as u16 {
            set_key(&mut c, code);
        }
        assert_eq!(classify(&c), DeviceClass::Keyboard);
    }

    #[test]
    fn test_usb_device_with_few_keys_is_not_keyboard() {
        let mut c = caps("Vendor Composite Device", BUS_USB);
        for code in KEY_ESC..KEY_ESC + 10 {
            set_key(&mut c, code);
        }
        assert_eq!(classify(&c), DeviceClass::Mouse);
    }

    #[test]
    fn test_i8042_device_with_many_keys_needs_name_match() {
        // The key-count promotion only applies to USB devices.
        let mut c = caps("Mystery Internal Device", BUS_I8042);
        for code in KEY_ESC..KEY_ESC + 60 {
            set_key(&mut c, code);
        }
        assert_eq!(classify(&c), DeviceClass::Mouse);
    }

    // ── Special devices ───────────────────────────────────────────────────────

    #[test]
    fn test_thinkpad_extra_buttons() {
        let c = caps("ThinkPad Extra Buttons", BUS_I8042);
        assert_eq!(classify(&c), DeviceClass::ThinkpadAcpi);
    }

    #[test]
    fn test_lid_switch() {
        let c = caps("Lid Switch", BUS_I8042);
        assert_eq!(classify(&c), DeviceClass::LidSwitch);
    }

    // ── Pointer rules ─────────────────────────────────────────────────────────

    #[test]
    fn test_no_abs_axes_is_mouse() {
        let c = caps("Generic PS/2 Mouse", BUS_I8042);
        assert_eq!(classify(&c), DeviceClass::Mouse);
    }

    #[test]
    fn test_i8042_with_pressure_is_touchpad() {
        let mut c = caps("SynPS/2 Synaptics TouchPad", BUS_I8042);
        set_abs_xy(&mut c);
        c.abs_bits |= 1 << ABS_PRESSURE;
        assert_eq!(classify(&c), DeviceClass::Touchpad);
    }

    #[test]
    fn test_i8042_abs_without_pressure_is_mouse() {
        let mut c = caps("SynPS/2 Something", BUS_I8042);
        set_abs_xy(&mut c);
        assert_eq!(classify(&c), DeviceClass::Mouse);
    }

    #[test]
    fn test_usb_abs_with_pen_tool_is_stylus_tablet() {
        let mut c = caps("Wacom Digitizer", BUS_USB);
        set_abs_xy(&mut c);
        set_key(&mut c, BTN_TOOL_PEN);
        assert_eq!(classify(&c), DeviceClass::Tablet(TabletKind::Stylus));
    }

    #[test]
    fn test_usb_abs_with_finger_tool_is_monotouch_tablet() {
        let mut c = caps("USB Touch Screen", BUS_USB);
        set_abs_xy(&mut c);
        set_key(&mut c, BTN_TOOL_FINGER);
        assert_eq!(classify(&c), DeviceClass::Tablet(TabletKind::MonoTouch));
    }

    #[test]
    fn test_usb_abs_without_tools_defaults_to_monotouch() {
        let mut c = caps("USB Touch Screen", BUS_USB);
        set_abs_xy(&mut c);
        assert_eq!(classify(&c), DeviceClass::Tablet(TabletKind::MonoTouch));
    }

    #[test]
    fn test_i2c_abs_is_tablet() {
        let mut c = caps("Elan Touchscreen", BUS_I2C);
        set_abs_xy(&mut c);
        set_key(&mut c, BTN_TOOL_FINGER);
        assert_eq!(classify(&c), DeviceClass::Tablet(TabletKind::MonoTouch));
    }

    #[test]
    fn test_pen_wins_over_finger_for_subtype() {
        let mut c = caps("Combo Digitizer", BUS_USB);
        set_abs_xy(&mut c);
        set_key(&mut c, BTN_TOOL_PEN);
        set_key(&mut c, BTN_TOOL_FINGER);
        assert_eq!(classify(&c), DeviceClass::Tablet(TabletKind::Stylus));
    }

    #[test]
    fn test_class_tags_are_distinct() {
        let tags = [
            DeviceClass::Keyboard,
            DeviceClass::Mouse,
            DeviceClass::Touchpad,
            DeviceClass::Tablet(TabletKind::Stylus),
            DeviceClass::Tablet(TabletKind::MonoTouch),
            DeviceClass::ThinkpadAcpi,
            DeviceClass::LidSwitch,
            DeviceClass::Ignored,
        ]
        .map(|c| c.as_tag());
        let mut sorted = tags;
        sorted.sort_unstable();
        sorted.windows(2).for_each(|w| assert_ne!(w[0], w[1]));
    }
}
