//! Slot incumbency and domain-death bookkeeping.
//!
//! Domains occupy numbered display slots.  When a domain reboots it briefly
//! disappears and comes back in the same slot; yanking focus to the UI VM
//! for every reboot would be jarring, so the platform announces an expected
//! death and this module swallows the disappearance if it happens inside
//! the window.  An *unexpected* death of the primary VM still forces focus
//! back to the UI VM.
//!
//! The module also decides whether a freshly attached domain should be
//! focused immediately: the primary VM always is, and so is a domain whose
//! UUID matches the last focus owner (restoring focus across a reboot).

use std::time::{Duration, Instant};

use tracing::info;
use uuid::Uuid;

use crate::application::registry::Domain;

/// Number of tracked display slots.
pub const NSLOTS: usize = 11;

/// How long after an announced death a disappearance counts as expected.
pub const DEATH_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    domid: Option<u32>,
    death_window: Option<Instant>,
    pvm: bool,
}

/// Per-slot incumbency state plus the remembered focus owner.
#[derive(Debug, Default)]
pub struct FocusSlots {
    slots: [SlotState; NSLOTS],
    /// UUID of the last domain a completed switch focused.
    focus_uuid: Option<Uuid>,
}

impl FocusSlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_index(slot: i32) -> Option<usize> {
        usize::try_from(slot).ok().filter(|&s| s < NSLOTS)
    }

    /// The platform announced that the domain in `slot` is about to go
    /// away on purpose (reboot, planned shutdown).
    pub fn expect_death(&mut self, slot: i32, now: Instant) {
        if let Some(idx) = Self::slot_index(slot) {
            self.slots[idx].death_window = Some(now);
        }
    }

    /// Cancels a pending death announcement for `slot`.
    pub fn dont_expect_death(&mut self, slot: i32) {
        if let Some(idx) = Self::slot_index(slot) {
            self.slots[idx].death_window = None;
        }
    }

    fn expecting_death(&self, idx: usize, now: Instant) -> bool {
        match self.slots[idx].death_window {
            Some(announced) => now.duration_since(announced) <= DEATH_WINDOW,
            None => false,
        }
    }

    /// Records the focus owner after a completed switch, so the same
    /// guest regains focus when it comes back from a reboot.
    pub fn remember_focus(&mut self, uuid: Uuid) {
        self.focus_uuid = Some(uuid);
    }

    pub fn focus_uuid(&self) -> Option<Uuid> {
        self.focus_uuid
    }

    /// A domain appeared (or re-announced itself) in its slot.  Returns
    /// true when the caller should focus it right away.
    pub fn update_domain(&mut self, d: &Domain) -> bool {
        let Some(idx) = Self::slot_index(d.slot) else {
            return false;
        };

        let slot = &mut self.slots[idx];
        if slot.domid != Some(d.domid) || slot.pvm != d.is_pvm {
            info!(
                slot = d.slot,
                last_domid = slot.domid.map_or(-1, |id| id as i64),
                new_domid = d.domid,
                last_was_pvm = slot.pvm,
                new_is_pvm = d.is_pvm,
                "new incumbent for slot"
            );
        }

        // The domain is alive again, cancel any pending reboot window.
        slot.death_window = None;
        slot.domid = Some(d.domid);
        slot.pvm = d.is_pvm;

        let take_focus = d.is_pvm || self.focus_uuid == Some(d.uuid);
        if take_focus {
            info!(uuid = %d.uuid, domid = d.domid, "focus switch on domain creation");
        }
        take_focus
    }

    /// A domain died.  Returns true when focus must fall back to the
    /// UI VM: an unannounced primary-VM death.
    pub fn domain_gone(&mut self, d: &Domain, now: Instant) -> bool {
        if !d.is_pvm {
            return false;
        }
        info!("a primary vm died");

        let Some(idx) = Self::slot_index(d.slot) else {
            return false;
        };

        if self.expecting_death(idx, now) {
            info!("the death was announced, holding focus");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_domain(domid: u32, slot: i32, pvm: bool) -> Domain {
        let mut d = Domain::new(domid, slot, Uuid::new_v4());
        d.is_pvm = pvm;
        d
    }

    #[test]
    fn test_pvm_takes_focus_on_creation() {
        let mut slots = FocusSlots::new();
        assert!(slots.update_domain(&make_domain(4, 1, true)));
    }

    #[test]
    fn test_ordinary_guest_does_not_take_focus() {
        let mut slots = FocusSlots::new();
        assert!(!slots.update_domain(&make_domain(4, 1, false)));
    }

    #[test]
    fn test_remembered_focus_uuid_takes_focus_back() {
        let mut slots = FocusSlots::new();
        let d = make_domain(4, 1, false);
        slots.remember_focus(d.uuid);

        // Same uuid, new domid, as after a reboot.
        let mut reborn = d.clone();
        reborn.domid = 9;
        assert!(slots.update_domain(&reborn));
    }

    #[test]
    fn test_unannounced_pvm_death_forces_uivm() {
        let mut slots = FocusSlots::new();
        let d = make_domain(4, 1, true);
        slots.update_domain(&d);

        assert!(slots.domain_gone(&d, Instant::now()));
    }

    #[test]
    fn test_announced_death_holds_focus() {
        let mut slots = FocusSlots::new();
        let d = make_domain(4, 1, true);
        slots.update_domain(&d);
        let t0 = Instant::now();

        slots.expect_death(d.slot, t0);

        assert!(!slots.domain_gone(&d, t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_stale_announcement_expires() {
        let mut slots = FocusSlots::new();
        let d = make_domain(4, 1, true);
        slots.update_domain(&d);
        let t0 = Instant::now();

        slots.expect_death(d.slot, t0);

        assert!(slots.domain_gone(&d, t0 + DEATH_WINDOW + Duration::from_secs(1)));
    }

    #[test]
    fn test_reappearing_cancels_announcement() {
        let mut slots = FocusSlots::new();
        let d = make_domain(4, 1, true);
        let t0 = Instant::now();
        slots.expect_death(d.slot, t0);

        // The domain came back: the pending window must not swallow a
        // later real death.
        slots.update_domain(&d);

        assert!(slots.domain_gone(&d, t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_non_pvm_death_never_forces_uivm() {
        let mut slots = FocusSlots::new();
        let d = make_domain(4, 1, false);
        slots.update_domain(&d);

        assert!(!slots.domain_gone(&d, Instant::now()));
    }

    #[test]
    fn test_out_of_range_slot_is_ignored() {
        let mut slots = FocusSlots::new();
        assert!(!slots.update_domain(&make_domain(4, -1, true)));
        assert!(!slots.update_domain(&make_domain(4, NSLOTS as i32, true)));
    }
}
