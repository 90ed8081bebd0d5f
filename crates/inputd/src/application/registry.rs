//! In-memory registry of running guest domains.
//!
//! Every guest the daemon can route input into has one [`Domain`] entry
//! holding its input-relevant attributes: which display slot it occupies,
//! whether its pointer backend accepts absolute coordinates, the keyboard
//! LED state last reported by the guest, and any diversion rules its agent
//! has installed.
//!
//! Domains reference each other (diversion targets, saved keyboard owners)
//! by `domid`, never by index, so a stale reference simply fails the lookup
//! after the target is gone.

use std::time::Instant;

use thiserror::Error;
use uuid::Uuid;

use crate::application::divert::DivertInfo;

/// Hard cap on concurrently tracked domains.
pub const NDOMAIN_MAX: usize = 20;

/// Display slot reserved for the UI VM.
pub const UIVM_SLOT: i32 = 0;

/// Error type for registry mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("domain table is full ({NDOMAIN_MAX} entries)")]
    TableFull,

    #[error("domain {domid} is already registered")]
    DuplicateDomid { domid: u32 },
}

/// Neighbouring slots for mouse edge switching, as configured per domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseSwitchNeighbors {
    /// Slot to switch to when the pointer pushes past the left screen edge.
    pub left: Option<i32>,
    /// Slot to switch to when the pointer pushes past the right screen edge.
    pub right: Option<i32>,
}

/// One running guest domain and its input-relevant state.
#[derive(Debug, Clone)]
pub struct Domain {
    pub domid: u32,
    /// Display slot (0 = UI VM).
    pub slot: i32,
    pub uuid: Uuid,
    /// Primary VM flag: this domain owns the physical display hardware.
    pub is_pvm: bool,
    /// Paravirtualized guests receive events over the vkbd channel and need
    /// multitouch flattening.
    pub is_pv_domain: bool,
    /// The guest's pointer backend accepts absolute coordinates.
    pub abs_enabled: bool,
    /// Keyboard lock-LED bits last reported by the guest.
    pub keyboard_led_code: u8,
    /// Keyboard owner to restore when this domain regains focus.
    pub prev_keyb_domid: Option<u32>,
    pub mouse_switch: MouseSwitchNeighbors,
    pub last_input_event: Option<Instant>,
    pub is_in_s3: bool,
    /// The domain's display surface was administratively disabled.
    pub disabled_surface: bool,
    /// Guest desktop resolution, 0 when unreported.
    pub desktop_xres: i32,
    pub desktop_yres: i32,
    /// Relative motion multipliers applied before canonical-range tracking.
    pub rel_x_mult: f64,
    pub rel_y_mult: f64,
    /// Screenshots of this domain's surface are administratively blocked.
    pub cant_print_screen: bool,
    /// Name of the guest's active display adapter, as reported by its
    /// video driver.  `None` until the guest reports one.
    pub active_adapter: Option<String>,
    /// Diversion rules installed by the in-guest agent, if any.
    pub divert: Option<DivertInfo>,
}

impl Domain {
    /// A domain with neutral defaults; callers set slot/uuid/flags after.
    pub fn new(domid: u32, slot: i32, uuid: Uuid) -> Self {
        Self {
            domid,
            slot,
            uuid,
            is_pvm: false,
            is_pv_domain: false,
            abs_enabled: false,
            keyboard_led_code: 0,
            prev_keyb_domid: None,
            mouse_switch: MouseSwitchNeighbors::default(),
            last_input_event: None,
            is_in_s3: false,
            disabled_surface: false,
            desktop_xres: 0,
            desktop_yres: 0,
            rel_x_mult: 1.0,
            rel_y_mult: 1.0,
            cant_print_screen: false,
            active_adapter: None,
            divert: None,
        }
    }

    /// True when this domain can consume absolute pointer events.
    /// The UI VM always can.
    pub fn supports_abs(&self) -> bool {
        self.abs_enabled || self.slot == UIVM_SLOT
    }
}

/// Bounded table of all tracked domains, keyed by domid.
///
/// A `Vec` rather than a map: the table never exceeds [`NDOMAIN_MAX`]
/// entries and linear scans keep slot/uuid lookups trivial.
#[derive(Debug, Default)]
pub struct DomainRegistry {
    domains: Vec<Domain>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new domain.
    ///
    /// # Errors
    ///
    /// [`RegistryError::TableFull`] when [`NDOMAIN_MAX`] domains are already
    /// tracked, [`RegistryError::DuplicateDomid`] when the domid exists.
    pub fn insert(&mut self, domain: Domain) -> Result<(), RegistryError> {
        if self.get(domain.domid).is_some() {
            return Err(RegistryError::DuplicateDomid { domid: domain.domid });
        }
        if self.domains.len() >= NDOMAIN_MAX {
            return Err(RegistryError::TableFull);
        }
        self.domains.push(domain);
        Ok(())
    }

    /// Removes and returns a domain.  Dangling references held by other
    /// domains are scrubbed by [`Self::scrub_references`], which teardown
    /// runs separately so subsystems can inspect the departed entry first.
    pub fn remove(&mut self, domid: u32) -> Option<Domain> {
        let idx = self.domains.iter().position(|d| d.domid == domid)?;
        Some(self.domains.remove(idx))
    }

    pub fn get(&self, domid: u32) -> Option<&Domain> {
        self.domains.iter().find(|d| d.domid == domid)
    }

    pub fn get_mut(&mut self, domid: u32) -> Option<&mut Domain> {
        self.domains.iter_mut().find(|d| d.domid == domid)
    }

    pub fn with_slot(&self, slot: i32) -> Option<&Domain> {
        self.domains.iter().find(|d| d.slot == slot)
    }

    pub fn with_slot_mut(&mut self, slot: i32) -> Option<&mut Domain> {
        self.domains.iter_mut().find(|d| d.slot == slot)
    }

    /// First domain on `slot` other than `not_domid`; used when replacing a
    /// dying domain that still occupies its slot.
    pub fn with_slot_and_not_domid(&self, slot: i32, not_domid: u32) -> Option<&Domain> {
        self.domains
            .iter()
            .find(|d| d.slot == slot && d.domid != not_domid)
    }

    pub fn with_uuid(&self, uuid: &Uuid) -> Option<&Domain> {
        self.domains.iter().find(|d| &d.uuid == uuid)
    }

    pub fn uivm(&self) -> Option<&Domain> {
        self.with_slot(UIVM_SLOT)
    }

    /// The primary VM, if one is running.
    pub fn pvm(&self) -> Option<&Domain> {
        self.domains.iter().find(|d| d.is_pvm)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Domain> {
        self.domains.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Domain> {
        self.domains.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Clears every reference other domains still hold to `gone`: diversion
    /// targets and saved keyboard owners.
    pub fn scrub_references(&mut self, gone: u32) {
        for d in &mut self.domains {
            if d.prev_keyb_domid == Some(gone) {
                d.prev_keyb_domid = None;
            }
            if let Some(dv) = d.divert.as_mut() {
                if dv.key_domain == Some(gone) {
                    dv.key_domain = None;
                }
                if dv.mouse_domain == Some(gone) {
                    dv.mouse_domain = None;
                }
            }
        }
    }

    /// Stamps the domain's last-input time, used by the idle lock timer.
    pub fn touch_last_input(&mut self, domid: u32, now: Instant) {
        if let Some(d) = self.get_mut(domid) {
            d.last_input_event = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_domain(domid: u32, slot: i32) -> Domain {
        Domain::new(domid, slot, Uuid::new_v4())
    }

    #[test]
    fn test_insert_and_lookup_by_domid_slot_uuid() {
        // Arrange
        let mut reg = DomainRegistry::new();
        let d = make_domain(5, 2);
        let uuid = d.uuid;

        // Act
        reg.insert(d).expect("insert");

        // Assert
        assert_eq!(reg.get(5).map(|d| d.slot), Some(2));
        assert_eq!(reg.with_slot(2).map(|d| d.domid), Some(5));
        assert_eq!(reg.with_uuid(&uuid).map(|d| d.domid), Some(5));
    }

    #[test]
    fn test_duplicate_domid_is_rejected() {
        let mut reg = DomainRegistry::new();
        reg.insert(make_domain(5, 1)).expect("first insert");

        let result = reg.insert(make_domain(5, 3));
        assert_eq!(result, Err(RegistryError::DuplicateDomid { domid: 5 }));
    }

    #[test]
    fn test_table_full_is_rejected() {
        let mut reg = DomainRegistry::new();
        for i in 0..NDOMAIN_MAX {
            reg.insert(make_domain(i as u32, i as i32)).expect("insert");
        }

        let result = reg.insert(make_domain(999, 99));
        assert_eq!(result, Err(RegistryError::TableFull));
    }

    #[test]
    fn test_uivm_is_slot_zero() {
        let mut reg = DomainRegistry::new();
        reg.insert(make_domain(7, 3)).expect("insert");
        reg.insert(make_domain(1, UIVM_SLOT)).expect("insert");

        assert_eq!(reg.uivm().map(|d| d.domid), Some(1));
    }

    #[test]
    fn test_uivm_supports_abs_without_flag() {
        let uivm = make_domain(1, UIVM_SLOT);
        let hvm = make_domain(2, 1);

        assert!(uivm.supports_abs());
        assert!(!hvm.supports_abs());
    }

    #[test]
    fn test_with_slot_and_not_domid_skips_the_named_domain() {
        let mut reg = DomainRegistry::new();
        reg.insert(make_domain(4, 2)).expect("insert");
        reg.insert(make_domain(9, 2)).expect("insert");

        assert_eq!(reg.with_slot_and_not_domid(2, 4).map(|d| d.domid), Some(9));
        assert!(reg.with_slot_and_not_domid(2, 4).map(|d| d.domid) != Some(4));
    }

    #[test]
    fn test_scrub_references_clears_divert_targets_and_saved_keyboard() {
        // Arrange: domain 4 diverts into domain 9 and saved it as keyboard owner
        let mut reg = DomainRegistry::new();
        let mut d = make_domain(4, 1);
        let mut dv = DivertInfo::new();
        dv.key_domain = Some(9);
        dv.mouse_domain = Some(9);
        d.divert = Some(dv);
        d.prev_keyb_domid = Some(9);
        reg.insert(d).expect("insert");

        // Act
        reg.scrub_references(9);

        // Assert
        let d = reg.get(4).expect("domain 4");
        assert_eq!(d.prev_keyb_domid, None);
        let dv = d.divert.as_ref().expect("divert info");
        assert_eq!(dv.key_domain, None);
        assert_eq!(dv.mouse_domain, None);
    }

    #[test]
    fn test_remove_returns_the_domain() {
        let mut reg = DomainRegistry::new();
        reg.insert(make_domain(3, 1)).expect("insert");

        let removed = reg.remove(3).expect("removed");
        assert_eq!(removed.domid, 3);
        assert!(reg.get(3).is_none());
        assert!(reg.remove(3).is_none());
    }
}
