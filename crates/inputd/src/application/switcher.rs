//! Whole-focus switches between guest domains.
//!
//! A switch has two halves: the display handover (asking the display
//! backend to make the target's surface visible) and the input handover
//! (retargeting the arbiter).  The switcher sequences both and remembers
//! which domain currently owns the screen so edge switching and teardown
//! can reason about it.
//!
//! Switch triggers:
//!
//! - keyboard chords (Ctrl+digit, Meta+Alt for next slot), registered as
//!   [`SwitcherAction`] tags on the daemon's binding set,
//! - the pointer pushing past a screen edge ([`Switcher::switch_on_mouse`]),
//! - platform events (domain death, guest S3 entry).

use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use input_core::codes::{
    EV_ABS, KEY_0, KEY_1, KEY_BACKSPACE, KEY_LEFTALT, KEY_LEFTCTRL, KEY_LEFTMETA, KEY_RIGHTALT,
    KEY_RIGHTCTRL,
};
use input_core::{BindingSet, InputEvent, ABS_RANGE_MAX, ABS_RANGE_MIN};

use crate::application::registry::{DomainRegistry, UIVM_SLOT};
use crate::application::routing::{Arbiter, RoutingOutput};

/// Slot sentinel: edge-switch to whichever domain last owned the screen.
pub const MOUSE_SWITCH_PREV: i32 = -2;

/// Error type for switch operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SwitchError {
    /// Re-entered while a previous switch was still talking to the
    /// display backend.
    #[error("switching already in progress")]
    InProgress,

    #[error("domain {domid} is not registered")]
    UnknownDomain { domid: u32 },

    #[error("no domain occupies slot {slot}")]
    AbsentSlot { slot: i32 },

    /// The display backend declined to show the surface and no fallback
    /// (disabled surface, primary VM) applied.
    #[error("display backend refused to show domain {domid}")]
    SurfaceRejected { domid: u32 },
}

/// Seam to the display plane.  The daemon's transport implements this
/// against the display manager; tests record the calls.
pub trait DisplayBackend {
    /// Makes `domid`'s surface visible.  Returns false when the display
    /// manager declines.
    fn set_visible(&mut self, domid: u32, force: bool) -> bool;

    /// Announces a completed focus change so guests and the UI can react.
    fn focus_changed(&mut self, lost: Option<u32>, gained: u32);
}

/// Switcher tuning taken from the daemon configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitcherConfig {
    /// Master switch for pointer edge switching.
    pub enabled: bool,
    /// Mouse-triggered switches also move the keyboard.
    pub keyboard_follows_mouse: bool,
    /// Skip the display backend when the target already owns the screen.
    pub self_switch_disabled: bool,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keyboard_follows_mouse: false,
            self_switch_disabled: true,
        }
    }
}

/// Binding tags the switcher registers on the daemon's chord matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitcherAction {
    GoToSlot(i32),
    /// Hold-to-force variant: switch away even from a guest that is not
    /// responding to the display handover.
    ForceGoToSlot(i32),
    GoToNext,
    /// Ctrl+Alt+Backspace: re-authenticate, or lock when no auth context
    /// is pending.
    AuthOrLock,
}

/// Registers the standard switching chords.
///
/// Each slot gets a left-Ctrl and a right-Ctrl chord, both with a force
/// escalation.  Ctrl+Alt+Backspace is accepted with either hand and in
/// either modifier order.
pub fn register_bindings(bindings: &mut BindingSet<SwitcherAction>) {
    for slot in 0..10i32 {
        let digit = if slot == 0 {
            KEY_0
        } else {
            KEY_1 + (slot as u16 - 1)
        };
        bindings.add_with_force(
            &[KEY_LEFTCTRL, digit],
            SwitcherAction::GoToSlot(slot),
            Some(SwitcherAction::ForceGoToSlot(slot)),
        );
        bindings.add_with_force(
            &[KEY_RIGHTCTRL, digit],
            SwitcherAction::GoToSlot(slot),
            Some(SwitcherAction::ForceGoToSlot(slot)),
        );
    }

    bindings.add(&[KEY_LEFTMETA, KEY_LEFTALT], SwitcherAction::GoToNext);

    let attention: [[u16; 3]; 4] = [
        [KEY_LEFTCTRL, KEY_LEFTALT, KEY_BACKSPACE],
        [KEY_LEFTALT, KEY_LEFTCTRL, KEY_BACKSPACE],
        [KEY_RIGHTCTRL, KEY_RIGHTALT, KEY_BACKSPACE],
        [KEY_RIGHTALT, KEY_RIGHTCTRL, KEY_BACKSPACE],
    ];
    for chord in &attention {
        bindings.add(chord, SwitcherAction::AuthOrLock);
    }
}

/// Video adapter class of a slot, for edge-switch sanity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoAdapter {
    DomainGone,
    Default,
    Intel,
    Other,
}

/// Focus owner bookkeeping and the switch state machine.
pub struct Switcher {
    /// Domain whose input focus the switcher last established.
    current: Option<u32>,
    /// Domain whose surface the display backend last showed.
    surface_current: Option<u32>,
    /// Guard against re-entry while the display handover is in flight.
    switching: bool,
    config: SwitcherConfig,
}

impl Switcher {
    pub fn new(config: SwitcherConfig) -> Self {
        Self {
            current: None,
            surface_current: None,
            switching: false,
            config,
        }
    }

    pub fn current(&self) -> Option<u32> {
        self.current
    }

    pub fn surface_current(&self) -> Option<u32> {
        self.surface_current
    }

    /// The focused domid, 0 when nothing is focused.
    pub fn get_focus(&self) -> u32 {
        self.current.unwrap_or(0)
    }

    pub fn config(&self) -> SwitcherConfig {
        self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// Forgets the surface owner without touching input focus.
    pub fn unfocus_gpu(&mut self) {
        self.surface_current = None;
    }

    // ── Display handover ──────────────────────────────────────────────────────

    /// Shows `domid`'s surface.  Returns true when the surface is (or
    /// already was) visible.
    pub fn switch_graphic(
        &mut self,
        domid: u32,
        force: bool,
        display: &mut dyn DisplayBackend,
    ) -> bool {
        if self.config.self_switch_disabled && self.surface_current == Some(domid) {
            return true;
        }
        let shown = display.set_visible(domid, force);
        if shown {
            self.surface_current = Some(domid);
        }
        shown
    }

    // ── The switch itself ─────────────────────────────────────────────────────

    /// Switches display and input focus to `domid`.
    ///
    /// With `mouse_switch` the keyboard stays put until the user clicks
    /// (unless configured to follow).  `force` is passed through to the
    /// display backend for unresponsive guests.
    ///
    /// # Errors
    ///
    /// See [`SwitchError`].
    pub fn switch(
        &mut self,
        domid: u32,
        mouse_switch: bool,
        force: bool,
        reg: &mut DomainRegistry,
        arbiter: &mut Arbiter,
        display: &mut dyn DisplayBackend,
        now: Instant,
        out: &mut RoutingOutput,
    ) -> Result<(), SwitchError> {
        if self.switching {
            // A second switch request can arrive while the display
            // handover blocks; honouring it would desync the shown and
            // focused domains.
            warn!("switching already in progress");
            return Err(SwitchError::InProgress);
        }
        self.switching = true;
        let result = self.do_switch(domid, mouse_switch, force, reg, arbiter, display, now, out);
        self.switching = false;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn do_switch(
        &mut self,
        domid: u32,
        mouse_switch: bool,
        force: bool,
        reg: &mut DomainRegistry,
        arbiter: &mut Arbiter,
        display: &mut dyn DisplayBackend,
        now: Instant,
        out: &mut RoutingOutput,
    ) -> Result<(), SwitchError> {
        let Some(d) = reg.get(domid) else {
            return Err(SwitchError::UnknownDomain { domid });
        };
        let (is_pvm, in_s3, disabled_surface, supports_abs) =
            (d.is_pvm, d.is_in_s3, d.disabled_surface, d.supports_abs());

        if !arbiter.keyb_waits_for_click() {
            // When the keyboard was shared out of the current VM, remember
            // its holder so a switch back can restore it.
            if let Some(cur) = self.current {
                arbiter.save_prev_keyb_domain(cur, reg);
            }
        }

        if in_s3 {
            out.wake_domains.push(domid);
        }
        if disabled_surface {
            info!(domid, "switch target has a disabled surface");
        }

        if !mouse_switch && supports_abs {
            arbiter.domain_set_mouse(domid, reg, out);
        }

        let shown = disabled_surface || self.switch_graphic(domid, force, display) || is_pvm;
        if !shown {
            return Err(SwitchError::SurfaceRejected { domid });
        }

        let lost = self.current;
        self.current = Some(domid);

        if mouse_switch && !self.config.keyboard_follows_mouse {
            arbiter.input_set_mouse(domid, reg);
        } else {
            arbiter.input_set(domid, reg, now, out);

            // For an application-viewing VM, restore the keyboard to the
            // domain that held it when we last switched away.
            if reg.get(domid).map_or(true, |d| d.divert.is_none()) {
                arbiter.restore_prev_keyb_domain(domid, reg, now, out);
            }
        }

        display.focus_changed(lost, domid);

        // Mirror the LEDs of whichever domain ended up with the keyboard.
        let led_domid = reg
            .get(domid)
            .and_then(|d| d.prev_keyb_domid)
            .filter(|&prev| reg.get(prev).is_some())
            .unwrap_or(domid);
        if let Some(holder) = reg.get(led_domid) {
            arbiter.led_code(reg, holder.keyboard_led_code, led_domid, out);
        }

        Ok(())
    }

    // ── Slot navigation ───────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn switch_to_slot(
        &mut self,
        slot: i32,
        mouse_switch: bool,
        force: bool,
        reg: &mut DomainRegistry,
        arbiter: &mut Arbiter,
        display: &mut dyn DisplayBackend,
        now: Instant,
        out: &mut RoutingOutput,
    ) -> Result<(), SwitchError> {
        let Some(domid) = reg.with_slot(slot).map(|d| d.domid) else {
            info!(slot, "request to switch to absent slot");
            return Err(SwitchError::AbsentSlot { slot });
        };
        info!(slot, force, "request to switch to slot");
        self.switch(domid, mouse_switch, force, reg, arbiter, display, now, out)
    }

    /// Chord handler: switch to a slot.
    pub fn go_to_slot(
        &mut self,
        slot: i32,
        reg: &mut DomainRegistry,
        arbiter: &mut Arbiter,
        display: &mut dyn DisplayBackend,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        info!(slot, "go to slot");
        let _ = self.switch_to_slot(slot, false, false, reg, arbiter, display, now, out);
    }

    /// Held-chord handler: force-switch to a slot.  Blocked while an
    /// authentication dialog is up, so a stuck secure screen cannot be
    /// escaped by holding the chord.
    #[allow(clippy::too_many_arguments)]
    pub fn force_go_to_slot(
        &mut self,
        slot: i32,
        auth_active: bool,
        reg: &mut DomainRegistry,
        arbiter: &mut Arbiter,
        display: &mut dyn DisplayBackend,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if auth_active {
            info!("auth in progress, keyboard switching is blocked");
            return;
        }
        let _ = self.switch_to_slot(slot, false, true, reg, arbiter, display, now, out);
    }

    /// Chord handler: switch to the next occupied slot, skipping the
    /// UI VM.  A no-op while the UI VM itself is focused.
    pub fn go_to_next(
        &mut self,
        reg: &mut DomainRegistry,
        arbiter: &mut Arbiter,
        display: &mut dyn DisplayBackend,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        info!("request to switch to next slot");
        let Some(cur) = self.current else { return };
        let Some(cur_slot) = reg.get(cur).map(|d| d.slot) else {
            return;
        };
        if cur_slot == UIVM_SLOT {
            return;
        }

        for step in 1..10 {
            let slot = (cur_slot + step).rem_euclid(10);
            if slot == UIVM_SLOT {
                continue;
            }
            if reg.with_slot(slot).is_some() {
                info!(slot, "new slot");
                let _ = self.switch_to_slot(slot, false, false, reg, arbiter, display, now, out);
                return;
            }
        }
    }

    // ── Platform events ───────────────────────────────────────────────────────

    /// A guest entered S3: move focus to the UI VM unless the sleeper is
    /// the primary VM or not focused anyway.
    pub fn s3(
        &mut self,
        domid: u32,
        reg: &mut DomainRegistry,
        arbiter: &mut Arbiter,
        display: &mut dyn DisplayBackend,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if reg.pvm().map(|d| d.domid) == Some(domid) {
            return;
        }
        if self.current != Some(domid) {
            return;
        }
        if let Some(uivm) = reg.uivm().map(|d| d.domid) {
            let _ = self.switch(uivm, false, false, reg, arbiter, display, now, out);
        }
    }

    /// A domain died.  When it owned the screen, fall back to the UI VM.
    pub fn domain_gone(
        &mut self,
        domid: u32,
        reg: &mut DomainRegistry,
        arbiter: &mut Arbiter,
        display: &mut dyn DisplayBackend,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if self.current == Some(domid) {
            self.current = None;
        }
        if self.surface_current != Some(domid) {
            return;
        }
        self.surface_current = None;
        if let Some(uivm) = reg.uivm().map(|d| d.domid) {
            let _ = self.switch(uivm, false, false, reg, arbiter, display, now, out);
        }
    }

    // ── Edge switching ────────────────────────────────────────────────────────

    fn slot_adapter(&self, slot: i32, reg: &DomainRegistry) -> VideoAdapter {
        let Some(d) = reg.with_slot(slot) else {
            return VideoAdapter::DomainGone;
        };
        let Some(name) = d.active_adapter.as_deref() else {
            return VideoAdapter::Default;
        };
        let lower = name.to_ascii_lowercase();
        if name.is_empty() || lower.contains("xen") {
            VideoAdapter::Default
        } else if lower.contains("intel") {
            VideoAdapter::Intel
        } else {
            VideoAdapter::Other
        }
    }

    /// An edge switch only makes sense when at least one side drives its
    /// own display hardware; two guests on the shared plane cannot be
    /// flipped by the display backend.
    fn switch_makes_sense(&self, from_slot: i32, to_slot: i32, reg: &DomainRegistry) -> bool {
        let from = self.slot_adapter(from_slot, reg);
        let to = self.slot_adapter(to_slot, reg);

        !(from == VideoAdapter::DomainGone
            || to == VideoAdapter::DomainGone
            || (from == VideoAdapter::Intel && to == VideoAdapter::Intel)
            || (from == VideoAdapter::Intel && to == VideoAdapter::Default)
            || (from == VideoAdapter::Default && to == VideoAdapter::Intel)
            || (from == VideoAdapter::Default && to == VideoAdapter::Default))
    }

    /// Pointer hit a screen edge: switch to the configured neighbour slot
    /// and carry the pointer across, entering from the opposite edge.
    #[allow(clippy::too_many_arguments)]
    pub fn switch_on_mouse(
        &mut self,
        event: &InputEvent,
        x: i32,
        y: i32,
        reg: &mut DomainRegistry,
        arbiter: &mut Arbiter,
        display: &mut dyn DisplayBackend,
        now: Instant,
        out: &mut RoutingOutput,
    ) {
        if event.kind != EV_ABS {
            return;
        }
        let Some(cur) = self.current else { return };
        let Some(d) = reg.get(cur) else { return };
        if !d.supports_abs() {
            return;
        }
        if x > ABS_RANGE_MIN && x < ABS_RANGE_MAX {
            return;
        }
        if !self.config.enabled {
            return;
        }

        let cur_slot = d.slot;
        let neighbors = d.mouse_switch;

        let (mut slot, entry_x) = if x == ABS_RANGE_MIN {
            let Some(slot) = neighbors.left else { return };
            info!(from = cur_slot, to = slot, "pointer at the left edge");
            (slot, ABS_RANGE_MAX - 1)
        } else {
            let Some(slot) = neighbors.right else { return };
            info!(from = cur_slot, to = slot, "pointer at the right edge");
            (slot, ABS_RANGE_MIN + 1)
        };

        if slot == MOUSE_SWITCH_PREV {
            let Some(surface) = self.surface_current else {
                return;
            };
            let Some(prev) = reg.get(surface) else { return };
            slot = prev.slot;
        }
        if slot < 0 {
            return;
        }
        if slot != cur_slot && !self.switch_makes_sense(cur_slot, slot, reg) {
            info!(
                from = cur_slot,
                to = slot,
                "mouse switch between these slots does not make sense, aborting"
            );
            return;
        }

        // Park the pointer in the bottom-left corner before switching so a
        // failed switch does not leave it pinned to the edge.
        arbiter.domain_set_mouse_pos(cur, ABS_RANGE_MIN, ABS_RANGE_MAX, reg, out);

        if self
            .switch_to_slot(slot, true, false, reg, arbiter, display, now, out)
            .is_ok()
        {
            if let Some(domid) = reg.with_slot(slot).map(|d| d.domid) {
                // Enter from the opposite edge at the same height.
                arbiter.set_mouse_pos(entry_x, y);
                arbiter.domain_set_mouse(domid, reg, out);
            }
        }
    }
}
