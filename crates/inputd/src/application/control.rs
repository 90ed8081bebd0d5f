//! The daemon's control surface.
//!
//! Guest agents and the UI talk to the daemon over a control channel; this
//! module models that surface transport-free.  [`ControlRequest`] is the
//! full vocabulary of calls, [`ControlResponse`] the reply payloads, and
//! the diversion family (the only calls with real logic beyond a field
//! write) is implemented here as caller-gated operations on the registry
//! and the arbiter.  The engine dispatches requests, because some of them
//! reach components only it owns (the switcher, the display backend).
//!
//! Diversion calls act on the *calling* domain: a guest can only install
//! rules on itself.  Every such call therefore needs a resolved caller
//! domid and fails with [`DivertError::NoSourceId`] otherwise.

use std::time::Instant;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use input_core::Rect;

use crate::application::divert::{DivertError, DivertInfo, FOCUS_MODE_MAX};
use crate::application::registry::DomainRegistry;
use crate::application::routing::{Arbiter, RoutingOutput};
use crate::application::switcher::SwitchError;

/// One call on the control surface.  The transport resolves the caller
/// domain and hands the decoded request to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Forward pointer events inside `sframe` of the caller's surface into
    /// `dframe` on the domain named by `uuid`.
    DivertMouseFocus {
        uuid: Uuid,
        sframe: Rect,
        dframe: Rect,
    },
    /// Install the caller's shortcut filter (zero-separated chord list).
    SetKeyboardFilter { spec: Vec<u16> },
    /// Send all keyboard input to the domain named by `uuid` while the
    /// caller keeps the screen.
    DivertKeyboardFocus { uuid: Uuid },
    StopMouseDivert,
    StopKeyboardDivert,
    /// Nudge the domain named by `uuid` with a Ctrl press/release.
    Touch { uuid: Uuid },
    /// Set the caller's divert focus-mode bits.
    FocusMode { mode: u32 },
    GetFocusDomid,
    /// Switch whole focus to a display slot.
    SwitchFocus { slot: i32, force: bool },
    GetMouseSpeed,
    SetMouseSpeed { step: i32 },
    GetNumlockRestore,
    SetNumlockRestore { on: bool },
    GetTouchpadTapToClick,
    SetTouchpadTapToClick { on: bool },
    GetTouchpadScrolling,
    SetTouchpadScrolling { on: bool },
    /// Pointer wiggle threshold for keyboard-follows-mouse handover.
    GetSwitchResistance,
    SetSwitchResistance { resistance: i32 },
    /// Lock the screen.  `can_switch_out` keeps the slot chords usable
    /// while locked.
    Lock { can_switch_out: bool },
    /// Enter or leave secure credential entry.
    SecureMode { on: bool },
    /// The UI focused its credential control; start collecting keystrokes.
    CollectPassword,
    /// Install the authentication context for the next secure session.
    AuthSetContext {
        user: String,
        title: String,
        flags: u32,
    },
    /// A new guest wants input service.
    AttachDomain {
        domid: u32,
        uuid: Uuid,
        slot: i32,
        pvm: bool,
    },
    DetachDomain { domid: u32 },
    /// The domain announced an orderly reboot; its upcoming disappearance
    /// must not yank focus to the UI VM.
    ExpectDeath { domid: u32 },
    /// The reboot turned into a real shutdown; the next disappearance is
    /// treated as final again.
    CancelExpectedDeath { domid: u32 },
    /// A guest entered or left S3 sleep.
    PowerStateChanged { domid: u32, asleep: bool },
    /// The focused guest's desktop resolution changed.
    ResolutionChanged { domid: u32, xres: i32, yres: i32 },
}

/// Reply payload for a control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResponse {
    Ok,
    Domid(u32),
    Speed(i32),
    Flag(bool),
    Resistance(i32),
}

/// Error type for control calls.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error(transparent)]
    Divert(#[from] DivertError),

    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error("cannot attach domain {domid}")]
    AttachFailed { domid: u32 },
}

/// The caller's diversion rules, created on first use.
fn divert_info_mut(reg: &mut DomainRegistry, caller: u32) -> Result<&mut DivertInfo, DivertError> {
    let d = reg.get_mut(caller).ok_or(DivertError::NoSourceId)?;
    Ok(d.divert.get_or_insert_with(DivertInfo::new))
}

fn domid_for_uuid(reg: &DomainRegistry, uuid: &Uuid) -> Result<u32, DivertError> {
    reg.with_uuid(uuid)
        .map(|d| d.domid)
        .ok_or_else(|| DivertError::BadUuid {
            uuid: uuid.to_string(),
        })
}

/// Installs a mouse divert from the caller into the target domain and
/// re-resolves pointer focus.
pub fn divert_mouse_focus(
    reg: &mut DomainRegistry,
    arbiter: &mut Arbiter,
    caller: u32,
    uuid: &Uuid,
    sframe: Rect,
    dframe: Rect,
    out: &mut RoutingOutput,
) -> Result<(), DivertError> {
    if reg.get(caller).is_none() {
        return Err(DivertError::NoSourceId);
    }
    let target = domid_for_uuid(reg, uuid)?;

    info!(from = caller, to = target, "mouse divert installed");
    let dv = divert_info_mut(reg, caller)?;
    dv.set_frames(sframe, dframe)?;
    dv.mouse_domain = Some(target);

    arbiter.sync_mouse_domain(caller, reg, out);
    Ok(())
}

/// Replaces the caller's shortcut filter.
pub fn set_keyboard_filter(
    reg: &mut DomainRegistry,
    caller: u32,
    spec: &[u16],
) -> Result<(), DivertError> {
    divert_info_mut(reg, caller)?.set_filter(spec)
}

/// Installs a keyboard divert from the caller into the target domain and
/// re-resolves keyboard focus.
pub fn divert_keyboard_focus(
    reg: &mut DomainRegistry,
    arbiter: &mut Arbiter,
    caller: u32,
    uuid: &Uuid,
    now: Instant,
    out: &mut RoutingOutput,
) -> Result<(), DivertError> {
    if reg.get(caller).is_none() {
        return Err(DivertError::NoSourceId);
    }
    let target = domid_for_uuid(reg, uuid)?;

    info!(from = caller, to = target, "keyboard divert installed");
    divert_info_mut(reg, caller)?.key_domain = Some(target);

    arbiter.sync_kbd_domain(caller, reg, now, out);
    Ok(())
}

pub fn stop_mouse_divert(
    reg: &mut DomainRegistry,
    arbiter: &mut Arbiter,
    caller: u32,
    out: &mut RoutingOutput,
) -> Result<(), DivertError> {
    let d = reg.get_mut(caller).ok_or(DivertError::NoSourceId)?;
    if let Some(dv) = d.divert.as_mut() {
        dv.mouse_domain = None;
    }
    arbiter.sync_mouse_domain(caller, reg, out);
    Ok(())
}

pub fn stop_keyboard_divert(
    reg: &mut DomainRegistry,
    arbiter: &mut Arbiter,
    caller: u32,
    now: Instant,
    out: &mut RoutingOutput,
) -> Result<(), DivertError> {
    let d = reg.get_mut(caller).ok_or(DivertError::NoSourceId)?;
    if let Some(dv) = d.divert.as_mut() {
        dv.key_domain = None;
    }
    arbiter.sync_kbd_domain(caller, reg, now, out);
    Ok(())
}

/// Pokes the target domain with a Ctrl press/release so its screensaver
/// sees activity.
pub fn touch(
    reg: &mut DomainRegistry,
    arbiter: &mut Arbiter,
    uuid: &Uuid,
    out: &mut RoutingOutput,
) -> Result<(), DivertError> {
    let target = domid_for_uuid(reg, uuid)?;
    arbiter.wiggle_ctrl_key(target, reg, out);
    Ok(())
}

/// Sets the caller's divert focus-mode bits.
pub fn focus_mode(reg: &mut DomainRegistry, caller: u32, mode: u32) -> Result<(), DivertError> {
    if mode > FOCUS_MODE_MAX {
        return Err(DivertError::FocusModeOutOfRange { mode });
    }
    divert_info_mut(reg, caller)?.focus_mode = mode;
    Ok(())
}
