//! The focus arbiter: decides, for every raw event, which domain gets it.
//!
//! # Architecture
//!
//! Keyboard and mouse focus are tracked separately.  `keyb_dest` and
//! `mouse_dest` are the domains currently receiving keyboard and pointer
//! events; they usually agree, but seamless application sharing and
//! keyboard handover ("keyboard take/release") can split them.  When a
//! domain has installed a mouse divert, `mouse_parent` is the owning domain
//! and `mouse_dest` its target; `keyb_parent` plays the same role for
//! keyboard diverts.
//!
//! [`Arbiter::inject`] is the per-event entry point.  It is pure with
//! respect to I/O: instead of writing to sockets it appends deliveries,
//! LED writes, wake-ups, and switch requests to a [`RoutingOutput`] that
//! the engine drains.  That keeps the entire arbitration logic testable
//! without a transport.
//!
//! The pointer position is tracked here, in the canonical
//! `0..=32767` range, as a pair of floats so sub-unit relative motion
//! accumulates instead of vanishing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;

use input_core::codes::*;
use input_core::normalize::multitouch::MultitouchFlattener;
use input_core::{clamp_abs, FrameTransform, InputEvent, WireFrame, ABS_RANGE_MAX, KEY_STATUS_SIZE};

use crate::application::divert::{
    FOCUS_MODE_CLICK_HOLD, FOCUS_MODE_CLONE_EVENTS, FOCUS_MODE_KEY_FOLLOW_MOUSE, KeyPair,
};
use crate::application::registry::DomainRegistry;

// ── Wire constants ────────────────────────────────────────────────────────────

/// Slot byte for daemon-synthesized events that have no source device.
pub const INPUT_SLOT_DEFAULT: u8 = 0xff;

pub const DEV_TYPE_KEYBOARD: u8 = 0;
pub const DEV_TYPE_MOUSE: u8 = 1;
pub const DEV_TYPE_TOUCHPAD: u8 = 2;
pub const DEV_TYPE_TABLET: u8 = 3;

// ── Guest keyboard LED report bits ────────────────────────────────────────────

pub const LED_CODE_SCROLLLOCK: u8 = 0x01;
pub const LED_CODE_NUMLOCK: u8 = 0x02;
pub const LED_CODE_CAPSLOCK: u8 = 0x04;

// ── Tuning constants ──────────────────────────────────────────────────────────

const MAX_NUM_PRESSED: usize = 5;
const BUTTONS_SIZE: usize = 3;
const DEFAULT_RESOLUTION_X: i32 = 1920;
const DEFAULT_RESOLUTION_Y: i32 = 1080;
/// Relative deltas at or below these magnitudes use the damped speed
/// multipliers, giving fine motion more precision.
const MOUSE_DIV_THRESHOLD_1: f64 = 6000.0;
const MOUSE_DIV_THRESHOLD_2: f64 = 10000.0;

pub const MIN_MOUSE_SPEED_STEP: i32 = 1;
pub const MAX_MOUSE_SPEED_STEP: i32 = 10;
pub const DEFAULT_MOUSE_SPEED_STEP: i32 = 5;

/// Input gaps longer than this trigger a wake-up nudge on the next event.
const WAKE_GAP: Duration = Duration::from_secs(4);

// ── Inputs and outputs ────────────────────────────────────────────────────────

/// Which normalization pipeline produced an injected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Keyboard,
    Mouse,
    Touchpad,
    Tablet,
}

impl SourceKind {
    pub fn wire_code(self) -> u8 {
        match self {
            SourceKind::Keyboard => DEV_TYPE_KEYBOARD,
            SourceKind::Mouse => DEV_TYPE_MOUSE,
            SourceKind::Touchpad => DEV_TYPE_TOUCHPAD,
            SourceKind::Tablet => DEV_TYPE_TABLET,
        }
    }
}

/// A physical keyboard LED write requested by the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedUpdate {
    pub led: u16,
    pub on: bool,
}

/// Whole-focus switches the arbiter wants the switcher to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchRequest {
    /// A dedicated hardware button asked for the UI VM.
    ToUivm,
    /// The pointer hit a screen edge hard enough to consider an
    /// edge switch.  `x`/`y` are the tracked canonical pointer position.
    Edge { event: InputEvent, x: i32, y: i32 },
}

/// Everything one arbitration step asked the outside world to do.
#[derive(Debug, Default)]
pub struct RoutingOutput {
    /// Event deliveries, in order.
    pub frames: Vec<WireFrame>,
    /// Physical keyboard LED writes.
    pub leds: Vec<LedUpdate>,
    /// Domains that should be woken from S3.
    pub wake_domains: Vec<u32>,
    /// Focus switches for the switcher to run after this step.
    pub requests: Vec<SwitchRequest>,
}

impl RoutingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.leds.clear();
        self.wake_domains.clear();
        self.requests.clear();
    }

    /// Deliveries destined for one domain, for assertions in tests.
    pub fn frames_for(&self, domid: u32) -> Vec<&WireFrame> {
        self.frames.iter().filter(|f| f.domid == domid).collect()
    }
}

/// Arbiter tuning taken from the daemon configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingConfig {
    /// Pointer speed step, 1..=10; 5 is neutral.
    pub mouse_speed_step: i32,
    /// Keep the guest's numlock state across switches instead of forcing
    /// it off.
    pub numlock_restore_on_switch: bool,
    /// Minimum horizontal delta magnitude that can trigger an edge switch.
    pub switch_resistance: i32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mouse_speed_step: DEFAULT_MOUSE_SPEED_STEP,
            numlock_restore_on_switch: true,
            switch_resistance: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PressedButton {
    code: u16,
    slot: u8,
    domid: u32,
    x: i32,
    y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentChild {
    Unknown,
    Child,
    Parent,
}

// ── The arbiter ───────────────────────────────────────────────────────────────

/// Focus state and per-event routing.  One instance per daemon.
pub struct Arbiter {
    mouse_dest: Option<u32>,
    keyb_dest: Option<u32>,
    mouse_parent: Option<u32>,
    keyb_parent: Option<u32>,
    /// Set when pointer focus moved but the user has not yet clicked to
    /// commit keyboard focus to the same domain.
    keyb_waits_for_click: bool,
    /// Current modifier bitmask over the keyboard-divert owner's modifier
    /// table.
    keyb_modbits: u32,
    key_status: [bool; KEY_STATUS_SIZE],
    mouse_x: f64,
    mouse_y: f64,
    mouse_speed: f64,
    speed_threshold_1: f64,
    speed_threshold_2: f64,
    config: RoutingConfig,
    pressed: Vec<PressedButton>,
    buttons: [u32; BUTTONS_SIZE],
    mouse_button: u32,
    /// Click-hold latch: 0 idle, 1 held, 2 draining until the next sync.
    button_holding: u8,
    /// Domain pointer events stuck to while a click-hold is active.
    sticky_domid: Option<u32>,
    last_was_key: bool,
    last_activity: Option<Instant>,
    /// Per-PV-domain multitouch flatteners for the vkbd channel.
    flatteners: HashMap<u32, MultitouchFlattener>,
}

impl Arbiter {
    pub fn new(config: RoutingConfig) -> Self {
        let mut arbiter = Self {
            mouse_dest: None,
            keyb_dest: None,
            mouse_parent: None,
            keyb_parent: None,
            keyb_waits_for_click: false,
            keyb_modbits: 0,
            key_status: [false; KEY_STATUS_SIZE],
            mouse_x: 0.0,
            mouse_y: 0.0,
            mouse_speed: 0.0,
            speed_threshold_1: 0.0,
            speed_threshold_2: 0.0,
            config,
            pressed: Vec::new(),
            buttons: [0; BUTTONS_SIZE],
            mouse_button: 0,
            button_holding: 0,
            sticky_domid: None,
            last_was_key: true,
            last_activity: None,
            flatteners: HashMap::new(),
        };
        arbiter.compute_mouse_speed();
        arbiter
    }

    // ── Observers ─────────────────────────────────────────────────────────────

    pub fn mouse_dest(&self) -> Option<u32> {
        self.mouse_dest
    }

    pub fn keyb_dest(&self) -> Option<u32> {
        self.keyb_dest
    }

    pub fn mouse_parent(&self) -> Option<u32> {
        self.mouse_parent
    }

    pub fn keyb_waits_for_click(&self) -> bool {
        self.keyb_waits_for_click
    }

    pub fn mouse_pos(&self) -> (i32, i32) {
        (self.mouse_x as i32, self.mouse_y as i32)
    }

    pub fn key_down(&self, code: u16) -> bool {
        usize::from(code) < KEY_STATUS_SIZE && self.key_status[usize::from(code)]
    }

    // ── Configuration ─────────────────────────────────────────────────────────

    pub fn config(&self) -> RoutingConfig {
        self.config
    }

    pub fn set_numlock_restore_on_switch(&mut self, restore: bool) {
        self.config.numlock_restore_on_switch = restore;
    }

    pub fn switch_resistance(&self) -> i32 {
        self.config.switch_resistance
    }

    pub fn set_switch_resistance(&mut self, resistance: i32) {
        self.config.switch_resistance = resistance.max(0);
    }

    pub fn mouse_speed_step(&self) -> i32 {
        self.config.mouse_speed_step
    }

    pub fn set_mouse_speed_step(&mut self, step: i32) {
        self.config.mouse_speed_step = step.clamp(MIN_MOUSE_SPEED_STEP, MAX_MOUSE_SPEED_STEP);
        self.compute_mouse_speed();
    }

    fn compute_mouse_speed(&mut self) {
        let default_speed = 1.5;
        let increment = 0.25;
        let mult_1 = MOUSE_DIV_THRESHOLD_1 / f64::from(ABS_RANGE_MAX);
        let mult_2 = MOUSE_DIV_THRESHOLD_2 / f64::from(ABS_RANGE_MAX);

        self.mouse_speed = default_speed
            - f64::from(DEFAULT_MOUSE_SPEED_STEP - self.config.mouse_speed_step) * increment;
        self.speed_threshold_1 = mult_1 * self.mouse_speed;
        self.speed_threshold_2 = mult_2 * self.mouse_speed;
    }

    // ── Key status table ──────────────────────────────────────────────────────

    /// Records key up/down state.  The engine feeds every event through
    /// here before any gate can swallow it.
    pub fn update_key_status(&mut self, ev: &InputEvent) {
        if ev.kind == EV_KEY && usize::from(ev.code) < KEY_STATUS_SIZE {
            self.key_status[usize::from(ev.code)] = ev.value != 0;
        }
    }

    // ── Delivery ──────────────────────────────────────────────────────────────

    /// Delivers one event to a domain, flattening multitouch for PV guests.
    fn send(
        &mut self,
        reg: &DomainRegistry,
        domid: u32,
        slot: u8,
        dev_type: u8,
        ev: InputEvent,
        out: &mut RoutingOutput,
    ) {
        let Some(d) = reg.get(domid) else { return };

        if d.is_pv_domain {
            let flat = self
                .flatteners
                .entry(domid)
                .or_insert_with(MultitouchFlattener::new);
            for flattened in flat.handle_event(ev) {
                out.frames.push(WireFrame {
                    domid,
                    slot,
                    dev_type,
                    event: flattened,
                });
            }
        } else {
            out.frames.push(WireFrame {
                domid,
                slot,
                dev_type,
                event: ev,
            });
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Drops every reference to a departed domain.
    pub fn domain_gone(&mut self, domid: u32) {
        if self.mouse_dest == Some(domid) {
            info!("lost the mouse domain, ditching mouse events for now");
            self.mouse_dest = None;
        }
        if self.keyb_dest == Some(domid) {
            info!("lost the keyboard domain, ditching keyboard events for now");
            self.keyb_dest = None;
        }
        if self.keyb_parent == Some(domid) {
            self.keyb_parent = None;
            self.keyb_dest = None;
        }
        if self.mouse_parent == Some(domid) {
            self.mouse_parent = None;
            self.mouse_dest = None;
        }
        if self.sticky_domid == Some(domid) {
            self.sticky_domid = None;
        }
        self.pressed.retain(|p| p.domid != domid);
        self.flatteners.remove(&domid);
    }

    // ── Keyboard reset ────────────────────────────────────────────────────────

    /// Sends a key-up to the keyboard destination for every key the host
    /// still considers down, so no guest is left with a stuck key.
    pub fn keyboard_reset(
        &mut self,
        reset_mouse_domain: bool,
        reg: &DomainRegistry,
        out: &mut RoutingOutput,
    ) {
        let Some(kd) = self.keyb_dest else { return };

        info!("keyboard reset");
        for code in 0..KEY_STATUS_SIZE {
            if !self.key_status[code] {
                continue;
            }
            self.key_status[code] = false;
            let up = InputEvent::key(code as u16, 0);
            self.send(reg, kd, INPUT_SLOT_DEFAULT, DEV_TYPE_KEYBOARD, up, out);

            if reset_mouse_domain {
                if let Some(md) = self.mouse_dest {
                    if md != kd {
                        self.send(reg, md, INPUT_SLOT_DEFAULT, DEV_TYPE_KEYBOARD, up, out);
                    }
                }
            }
        }
    }

    // ── Keyboard filter ───────────────────────────────────────────────────────

    /// Replays a filtered chord into the divert owner: modifier downs, the
    /// action key down/up, modifier ups.
    fn send_keypair(
        &mut self,
        reg: &DomainRegistry,
        owner: u32,
        pair: KeyPair,
        out: &mut RoutingOutput,
    ) {
        let mods: Vec<u16> = match reg.get(owner).and_then(|d| d.divert.as_ref()) {
            Some(dv) => dv.modifiers.clone(),
            None => return,
        };

        for (i, &code) in mods.iter().enumerate() {
            if pair.mod_bits & (1 << i) != 0 {
                let down = InputEvent::key(code, 1);
                self.send(reg, owner, INPUT_SLOT_DEFAULT, DEV_TYPE_KEYBOARD, down, out);
            }
        }
        let down = InputEvent::key(pair.keycode, 1);
        self.send(reg, owner, INPUT_SLOT_DEFAULT, DEV_TYPE_KEYBOARD, down, out);

        let up = InputEvent::key(pair.keycode, 0);
        self.send(reg, owner, INPUT_SLOT_DEFAULT, DEV_TYPE_KEYBOARD, up, out);
        for (i, &code) in mods.iter().enumerate() {
            if pair.mod_bits & (1 << i) != 0 {
                let up = InputEvent::key(code, 0);
                self.send(reg, owner, INPUT_SLOT_DEFAULT, DEV_TYPE_KEYBOARD, up, out);
            }
        }
    }

    /// Runs a keyboard event against the divert owner's filter.  Returns
    /// true when the event was swallowed (and possibly reflected).
    fn filter_keys(
        &mut self,
        reg: &DomainRegistry,
        ev: &InputEvent,
        out: &mut RoutingOutput,
    ) -> bool {
        if ev.kind != EV_KEY {
            return false;
        }
        let Some(parent) = self.keyb_parent else {
            return false;
        };
        let Some(dv) = reg.get(parent).and_then(|d| d.divert.as_ref()) else {
            info!("keyboard filter: divert owner has no divert info");
            return false;
        };
        if dv.keylist.is_empty() {
            return false;
        }

        if let Some(idx) = dv.modifier_index(ev.code) {
            let mask = 1 << idx;
            if ev.value != 0 {
                self.keyb_modbits |= mask;
            } else {
                self.keyb_modbits &= !mask;
            }
        }

        if let Some(pair) = dv.matching_pair(ev.code, self.keyb_modbits) {
            if ev.value != 0 {
                self.send_keypair(reg, parent, pair, out);
            }
            return true;
        }
        false
    }

    // ── Focus plumbing ────────────────────────────────────────────────────────

    fn set_kbd_domain(&mut self, domid: u32, reg: &DomainRegistry) {
        let dv = reg.get(domid).and_then(|d| d.divert.as_ref());

        if let Some(target) = dv.and_then(|dv| dv.key_domain) {
            self.keyb_parent = Some(domid);
            self.keyb_modbits = 0;
            self.keyb_dest = Some(target);
            self.keyb_waits_for_click = true;
        } else {
            self.keyb_dest = Some(domid);
            self.keyb_modbits = 0;
            self.keyb_parent = None;
            if let Some(mouse_target) = dv.and_then(|dv| dv.mouse_domain) {
                if mouse_target != domid {
                    self.keyb_waits_for_click = true;
                }
            }
        }
    }

    fn set_mouse_domain(&mut self, domid: u32, reg: &DomainRegistry) {
        let dv = reg.get(domid).and_then(|d| d.divert.as_ref());

        if let Some(target) = dv.and_then(|dv| dv.mouse_domain) {
            self.mouse_dest = Some(target);
            self.mouse_parent = Some(domid);
            self.keyb_waits_for_click = true;
        } else {
            self.mouse_dest = Some(domid);
            self.mouse_parent = None;
        }
    }

    /// Moves pointer focus to `domid`, resolving its mouse divert.
    pub fn input_set_mouse(&mut self, domid: u32, reg: &DomainRegistry) {
        if self.keyb_waits_for_click {
            // We mouse-switched and never clicked in the last VM.
            if self.keyb_dest == Some(domid) {
                // We are just back where the keyboard is.
                self.keyb_waits_for_click = false;
            }
        } else {
            self.keyb_waits_for_click = true;
        }
        self.set_mouse_domain(domid, reg);
        info!(
            "mouse input now directed to domid {}",
            self.mouse_dest.map_or(-1, |d| d as i64)
        );
    }

    /// Moves keyboard focus to `domid`, resetting the previous holder.
    pub fn input_set_keyb(
        &mut self,
        domid: u32,
        reg: &mut DomainRegistry,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if self.keyb_dest.is_some() {
            // Reset the keyboard of the previous domain before changing the
            // keyboard destination.
            self.keyboard_reset(false, reg, out);

            // Numlock must go off after the reset's key-up events: pressing
            // numlock has no effect while Ctrl is down, and the reset is
            // what releases Ctrl during chord switches.
            if !self.config.numlock_restore_on_switch {
                self.turn_numlock_off(reg, now, out);
            }
        }
        self.keyb_waits_for_click = false;
        self.set_kbd_domain(domid, reg);
        info!(
            "keyboard input now directed to domid {}",
            self.keyb_dest.map_or(-1, |d| d as i64)
        );
    }

    /// Moves both keyboard and pointer focus to `domid`.
    pub fn input_set(
        &mut self,
        domid: u32,
        reg: &mut DomainRegistry,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if self.keyb_dest.is_some() {
            self.keyboard_reset(true, reg, out);
            if !self.config.numlock_restore_on_switch {
                self.turn_numlock_off(reg, now, out);
            }
        }
        self.keyb_waits_for_click = false;

        self.set_mouse_domain(domid, reg);
        self.set_kbd_domain(domid, reg);

        if self.mouse_dest == self.keyb_dest {
            info!(
                "all input now directed to domid {}",
                self.mouse_dest.map_or(-1, |d| d as i64)
            );
        } else {
            info!(
                "keyboard input now directed to domid {}",
                self.keyb_dest.map_or(-1, |d| d as i64)
            );
            info!(
                "mouse input now directed to domid {}",
                self.mouse_dest.map_or(-1, |d| d as i64)
            );
        }
        reg.touch_last_input(domid, now);
    }

    /// Re-resolves pointer focus after `domid`'s mouse divert changed.
    pub fn sync_mouse_domain(
        &mut self,
        domid: u32,
        reg: &DomainRegistry,
        out: &mut RoutingOutput,
    ) {
        if self.mouse_parent == Some(domid) || self.mouse_dest == Some(domid) {
            self.input_set_mouse(domid, reg);
        }
        // If a button is held and the press was inside the new frame,
        // repeat the press in the target.
        self.dup_mouse_clicks(reg, out);
    }

    /// Re-resolves keyboard focus after `domid`'s keyboard divert changed.
    pub fn sync_kbd_domain(
        &mut self,
        domid: u32,
        reg: &mut DomainRegistry,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if self.keyb_parent == Some(domid) || self.keyb_dest == Some(domid) {
            self.input_set_keyb(domid, reg, now, out);
        }
    }

    // ── Keyboard handover ─────────────────────────────────────────────────────

    /// Gives the keyboard to `domid` without moving pointer focus.
    pub fn give_keyboard(
        &mut self,
        domid: u32,
        reg: &mut DomainRegistry,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if self.keyb_dest == Some(domid) {
            return;
        }

        // A keyboard-take from a second VM can arrive before the release
        // from the first; reset the split keyboard holder here.
        if self.keyb_dest != self.mouse_dest {
            self.keyboard_reset(false, reg, out);
        }
        if !self.config.numlock_restore_on_switch {
            self.turn_numlock_off(reg, now, out);
        }

        self.keyb_dest = Some(domid);
        self.keyb_parent = None;
        self.keyb_modbits = 0;

        if let Some(d) = reg.get(domid) {
            self.led_code(reg, d.keyboard_led_code, domid, out);
        }
        info!(
            "keyboard now directed to domid {} (mouse is on {})",
            domid,
            self.mouse_dest.map_or(-1, |d| d as i64)
        );
    }

    /// Returns the keyboard from `domid` back to the pointer destination.
    pub fn return_keyboard(
        &mut self,
        domid: u32,
        reg: &mut DomainRegistry,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if self.keyb_dest != Some(domid) {
            return;
        }

        if self.keyb_dest != self.mouse_dest {
            self.keyboard_reset(false, reg, out);
        }
        if !self.config.numlock_restore_on_switch {
            self.turn_numlock_off(reg, now, out);
        }

        self.keyb_dest = self.mouse_dest;
        self.keyb_parent = None;
        self.keyb_modbits = 0;

        if let Some(kd) = self.keyb_dest {
            if let Some(d) = reg.get(kd) {
                self.led_code(reg, d.keyboard_led_code, kd, out);
            }
        }
        info!(
            "keyboard now returned to domid {} (mouse is on {})",
            self.keyb_dest.map_or(-1, |d| d as i64),
            self.mouse_dest.map_or(-1, |d| d as i64)
        );
    }

    /// On behalf of `domid`, gives the keyboard to `new_dest` – immediately
    /// when `domid` holds pointer focus, otherwise deferred until it does.
    pub fn give_keyboard_from_domain(
        &mut self,
        domid: u32,
        new_dest: u32,
        reg: &mut DomainRegistry,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if domid == new_dest {
            return;
        }
        if reg.get(domid).is_none() || reg.get(new_dest).is_none() {
            return;
        }

        if self.mouse_dest == Some(domid) {
            self.give_keyboard(new_dest, reg, now, out);
            return;
        }

        if let Some(d) = reg.get_mut(domid) {
            d.prev_keyb_domid = Some(new_dest);
            info!("for domain {domid}, setting keyboard domain to {new_dest}");
        }
    }

    /// On behalf of `domid`, releases the keyboard from `prev_dest`.
    pub fn return_keyboard_to_domain(
        &mut self,
        domid: u32,
        prev_dest: u32,
        reg: &mut DomainRegistry,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if domid == prev_dest {
            return;
        }
        if reg.get(prev_dest).is_none() {
            return;
        }

        if self.mouse_dest == Some(domid) {
            self.return_keyboard(prev_dest, reg, now, out);
            return;
        }

        if let Some(d) = reg.get_mut(domid) {
            if d.prev_keyb_domid == Some(prev_dest) {
                d.prev_keyb_domid = None;
                info!("for domain {domid}, release keyboard from domain {prev_dest}");
            }
        }
    }

    /// Remembers the current split keyboard holder on `domid` so a later
    /// switch back can restore it.
    pub fn save_prev_keyb_domain(&mut self, domid: u32, reg: &mut DomainRegistry) {
        let (Some(kd), Some(md)) = (self.keyb_dest, self.mouse_dest) else {
            return;
        };
        let Some(d) = reg.get_mut(domid) else { return };

        if kd != md {
            d.prev_keyb_domid = Some(kd);
            info!("for domain {domid}, saving previous keyboard domain as {kd}");
        } else {
            d.prev_keyb_domid = None;
        }
    }

    /// Restores the keyboard holder previously saved on `domid`, if it is
    /// still running.
    pub fn restore_prev_keyb_domain(
        &mut self,
        domid: u32,
        reg: &mut DomainRegistry,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        let Some(prev) = reg.get(domid).and_then(|d| d.prev_keyb_domid) else {
            return;
        };
        if reg.get(prev).is_none() {
            return;
        }
        info!("for domain {domid}, restore keyboard to domain {prev}");
        self.give_keyboard(prev, reg, now, out);
    }

    // ── Numlock and LEDs ──────────────────────────────────────────────────────

    /// Injects a numlock toggle into the keyboard destination when its LED
    /// report says numlock is on.
    pub fn turn_numlock_off(
        &mut self,
        reg: &mut DomainRegistry,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        let Some(kd) = self.keyb_dest else { return };
        let Some(d) = reg.get_mut(kd) else { return };

        if d.keyboard_led_code & LED_CODE_NUMLOCK != LED_CODE_NUMLOCK {
            return;
        }
        d.keyboard_led_code &= !LED_CODE_NUMLOCK;
        let led_code = d.keyboard_led_code;

        self.inject(
            reg,
            InputEvent::key(KEY_NUMLOCK, 1),
            INPUT_SLOT_DEFAULT,
            SourceKind::Keyboard,
            now,
            out,
        );
        self.inject(
            reg,
            InputEvent::key(KEY_NUMLOCK, 0),
            INPUT_SLOT_DEFAULT,
            SourceKind::Keyboard,
            now,
            out,
        );
        self.led_code(reg, led_code, kd, out);
    }

    /// Mirrors a guest's LED report onto the physical keyboards, but only
    /// while that guest holds the keyboard.
    pub fn led_code(
        &self,
        _reg: &DomainRegistry,
        led_code: u8,
        domid: u32,
        out: &mut RoutingOutput,
    ) {
        if self.keyb_dest != Some(domid) {
            return;
        }
        out.leds.push(LedUpdate {
            led: LED_SCROLLL,
            on: led_code & LED_CODE_SCROLLLOCK == LED_CODE_SCROLLLOCK,
        });
        out.leds.push(LedUpdate {
            led: LED_NUML,
            on: led_code & LED_CODE_NUMLOCK == LED_CODE_NUMLOCK,
        });
        out.leds.push(LedUpdate {
            led: LED_CAPSL,
            on: led_code & LED_CODE_CAPSLOCK == LED_CODE_CAPSLOCK,
        });
    }

    // ── Attention nudge ───────────────────────────────────────────────────────

    /// Sends a Ctrl press/release pair to `domid` so its agent notices
    /// activity.  Skipped when that domain already owns the pointer.
    pub fn wiggle_ctrl_key(&mut self, domid: u32, reg: &DomainRegistry, out: &mut RoutingOutput) {
        if self.mouse_dest.is_none() || self.mouse_dest == Some(domid) {
            return;
        }
        self.send(
            reg,
            domid,
            INPUT_SLOT_DEFAULT,
            DEV_TYPE_KEYBOARD,
            InputEvent::key(KEY_LEFTCTRL, 1),
            out,
        );
        self.send(
            reg,
            domid,
            INPUT_SLOT_DEFAULT,
            DEV_TYPE_KEYBOARD,
            InputEvent::key(KEY_LEFTCTRL, 0),
            out,
        );
        info!("wiggle ctrl key domid:{domid}");
    }

    // ── Pointer position ──────────────────────────────────────────────────────

    pub fn set_mouse_pos(&mut self, x: i32, y: i32) {
        self.mouse_x = f64::from(x);
        self.mouse_y = f64::from(y);
    }

    /// Repositions the pointer inside `domid` at the tracked coordinates.
    pub fn domain_set_mouse(&mut self, domid: u32, reg: &DomainRegistry, out: &mut RoutingOutput) {
        let (x, y) = self.mouse_pos();
        self.domain_set_mouse_pos(domid, x, y, reg, out);
    }

    pub fn domain_set_mouse_pos(
        &mut self,
        domid: u32,
        x: i32,
        y: i32,
        reg: &DomainRegistry,
        out: &mut RoutingOutput,
    ) {
        info!("set mouse pos domid:{domid} x:{x} y:{y}");
        self.send(
            reg,
            domid,
            INPUT_SLOT_DEFAULT,
            DEV_TYPE_MOUSE,
            InputEvent::abs(ABS_X, x),
            out,
        );
        self.send(
            reg,
            domid,
            INPUT_SLOT_DEFAULT,
            DEV_TYPE_MOUSE,
            InputEvent::abs(ABS_Y, y),
            out,
        );
        self.send(
            reg,
            domid,
            INPUT_SLOT_DEFAULT,
            DEV_TYPE_MOUSE,
            InputEvent::sync(),
            out,
        );
    }

    /// Rescales the tracked pointer when the focused guest's desktop
    /// resolution changes, so the cursor stays put on screen.
    pub fn handle_resolution_change(
        &mut self,
        domid: u32,
        xres: i32,
        yres: i32,
        reg: &mut DomainRegistry,
        out: &mut RoutingOutput,
    ) {
        if self.mouse_dest != Some(domid) {
            return;
        }
        let Some(d) = reg.get(domid) else { return };
        if !d.supports_abs() {
            return;
        }
        if (d.desktop_xres == 0 && d.desktop_yres == 0)
            || (d.desktop_xres == xres && d.desktop_yres == yres)
        {
            return;
        }

        if d.desktop_xres != xres {
            self.mouse_x = clamp_abs(self.mouse_x * f64::from(d.desktop_xres) / f64::from(xres));
        }
        if d.desktop_yres != yres {
            self.mouse_y = clamp_abs(self.mouse_y * f64::from(d.desktop_yres) / f64::from(yres));
        }
        self.domain_set_mouse(domid, reg, out);
    }

    fn speed_mult(&self, reg: &DomainRegistry, ev: &InputEvent, kind: SourceKind) -> f64 {
        if kind != SourceKind::Mouse || ev.kind != EV_REL {
            return 1.0;
        }
        let Some(md) = self.mouse_dest.and_then(|id| reg.get(id)) else {
            return 1.0;
        };
        if md.desktop_xres == 0 && md.desktop_yres == 0 {
            return self.mouse_speed;
        }
        if ev.value.abs() <= 2 {
            self.speed_threshold_1
        } else if ev.value.abs() <= 5 {
            self.speed_threshold_2
        } else {
            self.mouse_speed
        }
    }

    fn track_mouse_position(&mut self, reg: &DomainRegistry, ev: &InputEvent, kind: SourceKind) {
        if let Some(md) = self.mouse_dest.and_then(|id| reg.get(id)) {
            let xres = if md.desktop_xres != 0 { md.desktop_xres } else { DEFAULT_RESOLUTION_X };
            let yres = if md.desktop_yres != 0 { md.desktop_yres } else { DEFAULT_RESOLUTION_Y };

            if ev.kind == EV_REL {
                match ev.code {
                    REL_X => {
                        if kind == SourceKind::Touchpad {
                            self.mouse_x += f64::from(ev.value * (ABS_RANGE_MAX / xres));
                        } else {
                            self.mouse_x += f64::from(ev.value)
                                * md.rel_x_mult
                                * self.speed_mult(reg, ev, kind);
                        }
                        self.mouse_x = clamp_abs(self.mouse_x);
                    }
                    REL_Y => {
                        if kind == SourceKind::Touchpad {
                            self.mouse_y += f64::from(ev.value * (ABS_RANGE_MAX / yres));
                        } else {
                            self.mouse_y += f64::from(ev.value)
                                * md.rel_y_mult
                                * self.speed_mult(reg, ev, kind);
                        }
                        self.mouse_y = clamp_abs(self.mouse_y);
                    }
                    _ => {}
                }
            }
        }

        if ev.kind == EV_KEY && (BTN_MISC..BTN_JOYSTICK).contains(&ev.code) {
            let key = usize::from(ev.code - BTN_MISC);
            let word = key / 32;
            if word >= BUTTONS_SIZE {
                return;
            }
            if ev.value != 0 {
                self.buttons[word] |= 1 << (key % 32);
                if self.buttons[word] != 0 {
                    self.mouse_button |= 1 << word;
                }
            } else {
                self.buttons[word] &= !(1 << (key % 32));
                if self.buttons[word] == 0 {
                    self.mouse_button &= !(1 << word);
                }
            }
        }
    }

    // ── Diverted pointer helpers ──────────────────────────────────────────────

    /// True when the tracked pointer lies outside the divert owner's
    /// source frame.
    fn mouse_outside_frame(&self, reg: &DomainRegistry) -> bool {
        let Some(dv) = self
            .mouse_parent
            .and_then(|id| reg.get(id))
            .and_then(|d| d.divert.as_ref())
        else {
            return true;
        };
        !dv.sframe.contains(self.mouse_x as i32, self.mouse_y as i32)
    }

    /// Rescales an absolute event from the source frame into the target's
    /// destination frame.
    fn scale_pointer_event(&self, reg: &DomainRegistry, ev: &mut InputEvent) {
        if ev.kind != EV_ABS {
            return;
        }
        let Some(dv) = self
            .mouse_parent
            .and_then(|id| reg.get(id))
            .and_then(|d| d.divert.as_ref())
        else {
            return;
        };
        let Ok(transform) = FrameTransform::new(dv.sframe, dv.dframe) else {
            return;
        };
        if ev.code == ABS_X || ev.code == ABS_MT_POSITION_X {
            ev.value = transform.apply_x(ev.value);
        } else if ev.code == ABS_Y || ev.code == ABS_MT_POSITION_Y {
            ev.value = transform.apply_y(ev.value);
        }
    }

    /// After a divert frame change, re-press held buttons in the new
    /// target when the original press landed inside the source frame.
    fn dup_mouse_clicks(&mut self, reg: &DomainRegistry, out: &mut RoutingOutput) {
        let Some(md) = self.mouse_dest else { return };
        let Some(dv) = self
            .mouse_parent
            .and_then(|id| reg.get(id))
            .and_then(|d| d.divert.as_ref())
        else {
            return;
        };
        let sframe = dv.sframe;

        let existing = self.pressed.clone();
        for press in &existing {
            if press.domid == md {
                continue;
            }
            if self.pressed.len() >= MAX_NUM_PRESSED {
                break;
            }
            let already = existing
                .iter()
                .any(|p| p.domid == md && p.code == press.code);
            let inside = press.x > sframe.x1
                && press.x < sframe.x2
                && press.y > sframe.y1
                && press.y < sframe.y2;
            if !already && inside {
                self.pressed.push(PressedButton {
                    domid: md,
                    ..*press
                });
                let down = InputEvent::key(press.code, 1);
                self.send(reg, md, press.slot, DEV_TYPE_MOUSE, down, out);
            }
        }
    }

    /// Tracks button presses per domain so a release always reaches the
    /// domain the press went to, even after focus moved.  Returns true
    /// when the release was redirected and must not be delivered again.
    fn check_mouse_keys(
        &mut self,
        reg: &DomainRegistry,
        domid: u32,
        slot: u8,
        ev: &InputEvent,
        out: &mut RoutingOutput,
    ) -> bool {
        if !(BTN_MISC..BTN_JOYSTICK).contains(&ev.code) {
            return false;
        }

        if ev.value != 0 {
            if self.pressed.len() < MAX_NUM_PRESSED {
                self.pressed.push(PressedButton {
                    code: ev.code,
                    slot,
                    domid,
                    x: self.mouse_x as i32,
                    y: self.mouse_y as i32,
                });
            }
            return false;
        }

        let Some(idx) = self
            .pressed
            .iter()
            .position(|p| p.code == ev.code && p.slot == slot)
        else {
            return false;
        };
        let press = self.pressed.remove(idx);
        if press.domid != domid {
            self.send(reg, press.domid, slot, DEV_TYPE_MOUSE, *ev, out);
            return true;
        }
        false
    }

    fn convert_rel_to_abs(&self, ev: &mut InputEvent) {
        if ev.kind != EV_REL {
            return;
        }
        match ev.code {
            REL_X => {
                ev.kind = EV_ABS;
                ev.code = ABS_X;
                ev.value = self.mouse_x as i32;
            }
            REL_Y => {
                ev.kind = EV_ABS;
                ev.code = ABS_Y;
                ev.value = self.mouse_y as i32;
            }
            _ => {}
        }
    }

    // ── Event classification ──────────────────────────────────────────────────

    fn event_is_keyboard(&mut self, kind: SourceKind, ev: &InputEvent) -> bool {
        if kind != SourceKind::Keyboard {
            self.last_was_key = false;
            return false;
        }
        if (ev.kind == EV_KEY && ev.code < BTN_MOUSE)
            || (ev.kind == EV_MSC && ev.code == MSC_SCAN)
        {
            self.last_was_key = true;
            return true;
        }
        if ev.kind == EV_SYN {
            // Sync markers belong to whatever stream preceded them.
            return self.last_was_key;
        }
        self.last_was_key = false;
        false
    }

    fn code_is_meta_key(&self, code: u16) -> bool {
        const META_KEYS: [u16; 7] = [
            KEY_LEFTCTRL,
            KEY_LEFTALT,
            KEY_LEFTMETA,
            KEY_RIGHTCTRL,
            KEY_RIGHTALT,
            KEY_RIGHTMETA,
            KEY_SYSRQ,
        ];
        META_KEYS
            .iter()
            .any(|&m| code == m || self.key_down(m))
    }

    /// True when a completed chord ends with this key-down.
    fn completes_chord(&self, ev: &InputEvent, chords: &[&[u16]]) -> bool {
        if ev.kind != EV_KEY {
            return false;
        }
        'chord: for chord in chords {
            let (last, held) = match chord.split_last() {
                Some(split) => split,
                None => continue,
            };
            for &code in held {
                if !self.key_down(code) {
                    continue 'chord;
                }
            }
            if ev.code == *last {
                return true;
            }
        }
        false
    }

    /// Split-focus keyboard gate: everything but pointer traffic and
    /// guest-switching chords goes to the keyboard destination.
    fn seamless_keyboard_ok(&self, ev: &InputEvent) -> bool {
        if self.key_down(KEY_LEFTMETA) || self.key_down(KEY_RIGHTMETA) {
            return false;
        }
        // No pointer traffic to the application-sharing VM.
        if ev.kind == EV_REL
            || ev.kind == EV_ABS
            || (ev.kind == EV_KEY && (BTN_MOUSE..=BTN_GEAR_UP).contains(&ev.code))
        {
            return false;
        }
        !self.completes_chord(
            ev,
            &[
                &[KEY_RIGHTALT, KEY_TAB],
                &[KEY_LEFTALT, KEY_TAB],
                &[KEY_LEFTCTRL, KEY_ESC],
                &[KEY_RIGHTCTRL, KEY_ESC],
            ],
        )
    }

    /// Split-focus mouse gate: pointer traffic, sync markers, and held
    /// meta modifiers go to the pointer destination.
    fn seamless_mouse_ok(&self, ev: &InputEvent) -> bool {
        if self.completes_chord(
            ev,
            &[
                &[KEY_LEFTCTRL, KEY_LEFTALT, KEY_DELETE],
                &[KEY_RIGHTCTRL, KEY_LEFTALT, KEY_DELETE],
                &[KEY_LEFTCTRL, KEY_RIGHTALT, KEY_DELETE],
                &[KEY_RIGHTCTRL, KEY_RIGHTALT, KEY_DELETE],
            ],
        ) {
            return false;
        }
        if self.code_is_meta_key(ev.code) {
            return true;
        }
        ev.kind == EV_REL
            || ev.kind == EV_ABS
            || (ev.kind == EV_KEY && (BTN_MOUSE..=BTN_GEAR_UP).contains(&ev.code))
            || ev.is_sync_report()
    }

    fn cant_print_screen(&self, reg: &DomainRegistry) -> bool {
        let blocked = |id: Option<u32>| {
            id.and_then(|d| reg.get(d))
                .map_or(false, |d| d.cant_print_screen)
        };
        blocked(self.mouse_dest) || blocked(self.keyb_dest)
    }

    // ── Injection ─────────────────────────────────────────────────────────────

    /// Routes one event to the focused guest(s).
    ///
    /// This is the per-event hot path.  The caller has already run the
    /// event through the secure-mode gate and the binding matcher.
    pub fn inject(
        &mut self,
        reg: &mut DomainRegistry,
        mut ev: InputEvent,
        slot: u8,
        kind: SourceKind,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        // After an input gap, nudge the primary VM and wake sleeping
        // destinations before routing anything.
        if matches!(ev.kind, EV_KEY | EV_REL | EV_ABS) {
            let expired = self
                .last_activity
                .map_or(true, |t| now.duration_since(t) > WAKE_GAP);
            if expired {
                if let Some(pvm) = reg.pvm().map(|d| d.domid) {
                    self.wiggle_ctrl_key(pvm, reg, out);
                    out.wake_domains.push(pvm);
                }
                if let Some(md) = self.mouse_dest {
                    out.wake_domains.push(md);
                }
                if let Some(kd) = self.keyb_dest {
                    out.wake_domains.push(kd);
                }
            }
            self.last_activity = Some(now);
        }

        let mut dest = self.mouse_dest;

        if self.event_is_keyboard(kind, &ev) {
            if self.filter_keys(reg, &ev, out) {
                return;
            }

            if ev.kind == EV_KEY && ev.code == KEY_SYSRQ && self.cant_print_screen(reg) {
                info!("print screen disallowed for focused domain, ignoring event");
                return;
            }

            if ev.kind == EV_MSC && ev.code == MSC_SCAN {
                // Scancode 0xAD is the dedicated home button on slate
                // hardware: switch to the UI VM and swallow.
                if ev.value == 0xAD {
                    out.requests.push(SwitchRequest::ToUivm);
                    return;
                }
            } else if ev.kind == EV_KEY && ev.code == KEY_SWITCHVIDEOMODE {
                if let Some(kd) = self.keyb_dest {
                    let is_pv = reg.get(kd).map_or(false, |d| d.is_pv_domain);
                    if !is_pv {
                        // HVM guests expect Meta+P for display mode cycling.
                        let meta = InputEvent::key(KEY_LEFTMETA, ev.value);
                        let p = InputEvent::key(KEY_P, ev.value);
                        self.send(reg, kd, slot, DEV_TYPE_KEYBOARD, meta, out);
                        self.send(reg, kd, slot, DEV_TYPE_KEYBOARD, p, out);
                    }
                }
            }

            if self.keyb_dest.is_some() {
                dest = self.keyb_dest;
            }
            if dest.is_none() {
                return;
            }
        } else {
            self.track_mouse_position(reg, &ev, kind);

            let Some(md) = self.mouse_dest else { return };

            let mut val = 0;
            if ev.kind == EV_REL {
                if ev.code == REL_X {
                    val = ev.value;
                }
                if reg.get(md).map_or(false, |d| d.supports_abs()) {
                    self.convert_rel_to_abs(&mut ev);
                }
            }

            let click = ev.kind == EV_KEY
                && self.keyb_waits_for_click
                && matches!(ev.code, BTN_LEFT | BTN_RIGHT | BTN_MIDDLE);

            let mut parentchild = ParentChild::Unknown;
            let mut focus_mode = 0;

            if let Some(parent) = self.mouse_parent {
                focus_mode = reg
                    .get(parent)
                    .and_then(|d| d.divert.as_ref())
                    .map_or(0, |dv| dv.focus_mode);

                if ev.is_sync_report() && self.button_holding == 2 {
                    self.button_holding = 0;
                }
                if focus_mode & FOCUS_MODE_CLICK_HOLD != 0 && self.mouse_button != 0 {
                    self.button_holding = 1;
                } else if self.button_holding != 0 {
                    self.button_holding = 2;
                }

                if self.button_holding != 0 {
                    if self.sticky_domid == Some(parent) {
                        parentchild = ParentChild::Parent;
                    } else if self.sticky_domid == dest {
                        parentchild = ParentChild::Child;
                    }
                }

                if parentchild == ParentChild::Unknown {
                    parentchild = if self.mouse_outside_frame(reg) {
                        ParentChild::Parent
                    } else {
                        ParentChild::Child
                    };
                }

                if parentchild == ParentChild::Parent {
                    dest = Some(parent);
                } else if click && focus_mode & FOCUS_MODE_KEY_FOLLOW_MOUSE != 0 {
                    if let Some(dv) = reg.get_mut(parent).and_then(|d| d.divert.as_mut()) {
                        dv.key_domain = dest;
                    }
                    self.sync_kbd_domain(parent, reg, now, out);
                }

                if ev.kind == EV_KEY {
                    if let Some(d) = dest {
                        if self.check_mouse_keys(reg, d, slot, &ev, out) {
                            return;
                        }
                    }
                }
                self.sticky_domid = dest;
            } else if click {
                // The keyboard is in another castle; a click brings it back.
                self.input_set_keyb(md, reg, now, out);
                dest = self.mouse_dest;
            }

            if parentchild == ParentChild::Child {
                if focus_mode & FOCUS_MODE_CLONE_EVENTS != 0 {
                    if let Some(parent) = self.mouse_parent {
                        self.send(reg, parent, slot, kind.wire_code(), ev, out);
                    }
                }
                self.scale_pointer_event(reg, &mut ev);
            } else if val.abs() > self.config.switch_resistance {
                // An edge switch needs the last event to be a large-enough
                // X movement.
                out.requests.push(SwitchRequest::Edge {
                    event: ev,
                    x: self.mouse_x as i32,
                    y: self.mouse_y as i32,
                });
            }
        }

        // Split focus: keyboard and pointer live in different domains and
        // the split is click-committed.
        if let (Some(kd), Some(md)) = (self.keyb_dest, self.mouse_dest) {
            if kd != md && !self.keyb_waits_for_click {
                if self.seamless_keyboard_ok(&ev) {
                    self.send(reg, kd, slot, kind.wire_code(), ev, out);
                }
                if self.seamless_mouse_ok(&ev) {
                    self.send(reg, md, slot, kind.wire_code(), ev, out);
                }
                return;
            }
        }

        if let Some(d) = dest {
            self.send(reg, d, slot, kind.wire_code(), ev, out);
        }
    }
}
