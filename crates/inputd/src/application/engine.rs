//! The daemon's event loop.
//!
//! One engine task owns the registry, the arbiter, the switcher, the slot
//! table, and the secure-mode gate, and consumes every [`EngineMsg`]: raw
//! device events, normalizer timers, the once-a-second housekeeping tick,
//! hotplug notices, and control calls.  Running everything on one task
//! keeps the routing state free of locks.
//!
//! Per raw event the pipeline is: key-status bookkeeping, the secure-mode
//! gate, the per-device normalizer, the chord matchers, and finally the
//! arbiter.  Touchpads and tablets run their normalizer even while secure
//! mode is up, because the pointer must stay alive on the login screen.
//!
//! The engine talks to the outside world through injected ports only:
//! [`OutputTransport`] for event delivery, [`DisplayBackend`] for the
//! display plane, [`CredentialSink`] for authentication, [`LedSink`] for
//! keyboard LEDs, and [`DomainWaker`] for S3 wake-up.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use input_core::codes::{
    EV_KEY, KEY_FN_F8, KEY_HELP, KEY_LEFTSHIFT, KEY_PROG2, KEY_RIGHTSHIFT,
};
use input_core::normalize::tablet::TabletNormalizer;
use input_core::normalize::touchpad::{
    TouchpadConfig, TouchpadOut, TouchpadPipeline, TAP_DRAG_TIMEOUT,
};
use input_core::{BindingSet, DeviceClass, GestureAction, GestureTracker, InputEvent, WireFrame};

use crate::application::control::{self, ControlError, ControlRequest, ControlResponse};
use crate::application::divert::DivertError;
use crate::application::focus_slots::FocusSlots;
use crate::application::registry::{Domain, DomainRegistry, UIVM_SLOT};
use crate::application::routing::{
    Arbiter, RoutingConfig, RoutingOutput, SourceKind, SwitchRequest, INPUT_SLOT_DEFAULT,
};
use crate::application::secure::{
    CredentialSink, SecureInput, AUTH_FLAG_CANNOT_CANCEL, AUTH_FLAG_LOCK,
};
use crate::application::switcher::{
    self, DisplayBackend, Switcher, SwitcherAction, SwitcherConfig,
};

/// Engine inbox depth.  Device reads block once the engine falls this far
/// behind, which is preferable to unbounded buffering of stale input.
pub const CHANNEL_CAPACITY: usize = 256;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Delivery port for routed events.  Infrastructure implements this over
/// the guest event socket; tests record the frames.
#[async_trait]
pub trait OutputTransport: Send {
    async fn deliver(&mut self, frame: WireFrame);
}

/// Physical keyboard LED write-back.
pub trait LedSink: Send {
    fn set_led(&mut self, led: u16, on: bool);
}

/// Wakes guests from S3 sleep.
pub trait DomainWaker: Send {
    fn wake(&mut self, domid: u32);
}

/// Persists runtime setting changes so they survive a daemon restart.
/// Paths use the slash-keyed vocabulary of the config store
/// (`/mouse/speed`, `/switcher/resistance`, ...).
pub trait SettingsStore: Send {
    fn write_setting(&mut self, path: &str, value: &str);
}

/// The engine's injected infrastructure.
pub struct EnginePorts {
    pub transport: Box<dyn OutputTransport>,
    pub display: Box<dyn DisplayBackend + Send>,
    pub credentials: Box<dyn CredentialSink + Send>,
    pub leds: Box<dyn LedSink>,
    pub waker: Box<dyn DomainWaker>,
    pub settings: Box<dyn SettingsStore>,
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Per-device normalizer chosen by the classifier at probe time.
#[derive(Debug)]
pub enum Normalizer {
    None,
    Touchpad(TouchpadPipeline),
    Tablet(TabletNormalizer),
}

#[derive(Debug)]
pub enum HotplugEvent {
    Added {
        slot: u8,
        class: DeviceClass,
        normalizer: Normalizer,
    },
    Removed {
        slot: u8,
    },
}

/// Everything the engine task consumes.
pub enum EngineMsg {
    /// One raw event from the device in `slot`.
    Device { slot: u8, event: InputEvent },
    /// The deferred-tap timer for a touchpad fired.  Stale generations
    /// are ignored.
    TapTimer { slot: u8, gen: u64 },
    /// The corner-autoscroll timer for a touchpad fired.
    AutoscrollTick { slot: u8, gen: u64 },
    /// Once-a-second housekeeping: held-chord escalation, the idle lock
    /// countdown, and the revert-to-auth nag.
    ForceTick,
    Hotplug(HotplugEvent),
    /// A decoded control call; the reply goes back to the transport.
    Control {
        caller: Option<u32>,
        request: ControlRequest,
        reply: oneshot::Sender<Result<ControlResponse, ControlError>>,
    },
    Shutdown,
}

/// Chords handled by the engine itself rather than the switcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceAction {
    /// Dedicated touchpad-off key on some laptop keyboards.
    TouchpadOff,
    TouchpadOn,
}

fn register_device_bindings(bindings: &mut BindingSet<DeviceAction>) {
    bindings.add(&[KEY_PROG2], DeviceAction::TouchpadOff);
    bindings.add(&[KEY_HELP], DeviceAction::TouchpadOn);
}

struct DeviceEntry {
    class: DeviceClass,
    touchpad: Option<TouchpadPipeline>,
    tablet: Option<TabletNormalizer>,
    /// Timer generations; a fired timer with a stale generation is a
    /// cancelled one.
    tap_gen: u64,
    autoscroll_gen: u64,
}

/// Engine tuning derived from the daemon configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub routing: RoutingConfig,
    pub switcher: SwitcherConfig,
    pub touchpad: TouchpadConfig,
    /// Idle seconds before the screen locks; 0 disables the lock timer.
    pub lock_timeout_secs: u32,
    /// User the idle lock authenticates against.
    pub platform_user: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            switcher: SwitcherConfig::default(),
            touchpad: TouchpadConfig::default(),
            lock_timeout_secs: 0,
            platform_user: String::new(),
        }
    }
}

// ── The engine ────────────────────────────────────────────────────────────────

pub struct Engine {
    registry: DomainRegistry,
    arbiter: Arbiter,
    switcher: Switcher,
    focus_slots: FocusSlots,
    secure: SecureInput,
    switch_bindings: BindingSet<SwitcherAction>,
    device_bindings: BindingSet<DeviceAction>,
    gesture: GestureTracker,
    devices: HashMap<u8, DeviceEntry>,

    transport: Box<dyn OutputTransport>,
    display: Box<dyn DisplayBackend + Send>,
    credentials: Box<dyn CredentialSink + Send>,
    leds: Box<dyn LedSink>,
    waker: Box<dyn DomainWaker>,
    settings: Box<dyn SettingsStore>,

    /// Edge switching as configured, restored when a lock ends.
    edge_switching_configured: bool,
    /// Live touchpad settings, pushed to every touchpad pipeline.
    touchpad_config: TouchpadConfig,
    lock_timeout_secs: u32,
    platform_user: String,
    idle_secs: u32,
    started: Instant,
    out: RoutingOutput,
    tx: mpsc::Sender<EngineMsg>,
    rx: mpsc::Receiver<EngineMsg>,
}

impl Engine {
    pub fn new(config: EngineConfig, ports: EnginePorts) -> (Self, mpsc::Sender<EngineMsg>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut switch_bindings = BindingSet::new();
        switcher::register_bindings(&mut switch_bindings);
        let mut device_bindings = BindingSet::new();
        register_device_bindings(&mut device_bindings);

        let engine = Self {
            registry: DomainRegistry::new(),
            arbiter: Arbiter::new(config.routing),
            switcher: Switcher::new(config.switcher),
            focus_slots: FocusSlots::new(),
            secure: SecureInput::new(),
            switch_bindings,
            device_bindings,
            gesture: GestureTracker::new(),
            devices: HashMap::new(),
            transport: ports.transport,
            display: ports.display,
            credentials: ports.credentials,
            leds: ports.leds,
            waker: ports.waker,
            settings: ports.settings,
            edge_switching_configured: config.switcher.enabled,
            touchpad_config: config.touchpad,
            lock_timeout_secs: config.lock_timeout_secs,
            platform_user: config.platform_user,
            idle_secs: 0,
            started: Instant::now(),
            out: RoutingOutput::new(),
            tx: tx.clone(),
            rx,
        };
        (engine, tx)
    }

    /// Runs until [`EngineMsg::Shutdown`] or the last sender is dropped.
    pub async fn run(mut self) {
        info!("input engine started");

        let tick_tx = self.tx.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if tick_tx.send(EngineMsg::ForceTick).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = self.rx.recv().await {
            let now = Instant::now();
            match msg {
                EngineMsg::Device { slot, event } => self.handle_device_event(slot, event, now),
                EngineMsg::TapTimer { slot, gen } => self.handle_tap_timer(slot, gen, now),
                EngineMsg::AutoscrollTick { slot, gen } => {
                    self.handle_autoscroll_tick(slot, gen, now);
                }
                EngineMsg::ForceTick => self.handle_tick(now),
                EngineMsg::Hotplug(ev) => self.handle_hotplug(ev),
                EngineMsg::Control {
                    caller,
                    request,
                    reply,
                } => {
                    let result = self.handle_control(caller, request, now);
                    let _ = reply.send(result);
                }
                EngineMsg::Shutdown => break,
            }
            self.service_switch_requests(now);
            self.flush().await;
        }

        ticker.abort();
        info!("input engine stopped");
    }

    // ── Device events ─────────────────────────────────────────────────────────

    fn handle_device_event(&mut self, slot: u8, ev: InputEvent, now: Instant) {
        self.idle_secs = 0;
        self.arbiter.update_key_status(&ev);

        let intercepted = self.secure_intercept(&ev, now);

        let Some(class) = self.devices.get(&slot).map(|e| e.class) else {
            warn!(slot, "event from unknown device slot");
            return;
        };

        match class {
            // Pointer normalizers run even under secure mode so the
            // cursor keeps moving on the login screen.
            DeviceClass::Touchpad => {
                let t = now.duration_since(self.started);
                let outs = self
                    .devices
                    .get_mut(&slot)
                    .and_then(|e| e.touchpad.as_mut())
                    .map(|p| p.handle_event(ev, t))
                    .unwrap_or_default();
                self.apply_touchpad_outputs(slot, outs, now);
            }
            DeviceClass::Tablet(_) => {
                let out = self
                    .devices
                    .get_mut(&slot)
                    .and_then(|e| e.tablet.as_mut())
                    .map(|n| n.handle_event(ev, &mut self.gesture));
                if let Some(out) = out {
                    for e in out.events {
                        self.arbiter.inject(
                            &mut self.registry,
                            e,
                            slot,
                            SourceKind::Tablet,
                            now,
                            &mut self.out,
                        );
                    }
                    if let Some(action) = out.action {
                        self.dispatch_gesture(action, now);
                    }
                }
            }
            // ACPI extra buttons stay host-side.
            DeviceClass::ThinkpadAcpi => {
                if !intercepted
                    && ev.kind == EV_KEY
                    && ev.code == KEY_FN_F8
                    && ev.value == 1
                {
                    self.toggle_touchpads();
                }
            }
            DeviceClass::Keyboard | DeviceClass::LidSwitch => {
                if !intercepted {
                    self.bindings_or_inject(ev, slot, SourceKind::Keyboard, now);
                }
            }
            DeviceClass::Mouse => {
                if !intercepted {
                    self.bindings_or_inject(ev, slot, SourceKind::Mouse, now);
                }
            }
            DeviceClass::Ignored => {}
        }

        if let Some(focused) = self.switcher.current() {
            self.registry.touch_last_input(focused, now);
        }
    }

    /// Secure-mode interception.  Returns true when the original event
    /// must not reach any guest; masked echoes have then already been
    /// injected.
    fn secure_intercept(&mut self, ev: &InputEvent, now: Instant) -> bool {
        let uivm_focused = match self.registry.uivm() {
            Some(uivm) => uivm.domid == self.switcher.get_focus(),
            None => true,
        };
        if !self.secure.applies_to(ev, uivm_focused) {
            return false;
        }

        // Chords still work on the ordinary secure dialog; the lock
        // screen disables them.
        if !self.secure.locked() && self.feed_bindings(*ev, now) {
            return true;
        }

        let shift =
            self.arbiter.key_down(KEY_LEFTSHIFT) || self.arbiter.key_down(KEY_RIGHTSHIFT);
        let echoes = self.secure.process_key(ev, shift, &mut *self.credentials);
        for echo in echoes {
            self.arbiter.inject(
                &mut self.registry,
                echo,
                INPUT_SLOT_DEFAULT,
                SourceKind::Keyboard,
                now,
                &mut self.out,
            );
        }
        true
    }

    fn feed_bindings(&mut self, ev: InputEvent, now: Instant) -> bool {
        if let Some(action) = self.switch_bindings.feed(ev) {
            self.dispatch_switch(action, now);
            return true;
        }
        if let Some(action) = self.device_bindings.feed(ev) {
            self.dispatch_device(action);
            return true;
        }
        false
    }

    fn bindings_or_inject(&mut self, ev: InputEvent, slot: u8, kind: SourceKind, now: Instant) {
        if self.feed_bindings(ev, now) {
            return;
        }
        // Keyboards are interchangeable; everything downstream sees them
        // as one logical device.
        let slot = if kind == SourceKind::Keyboard {
            INPUT_SLOT_DEFAULT
        } else {
            slot
        };
        self.arbiter
            .inject(&mut self.registry, ev, slot, kind, now, &mut self.out);
    }

    // ── Chord and gesture dispatch ────────────────────────────────────────────

    fn dispatch_switch(&mut self, action: SwitcherAction, now: Instant) {
        match action {
            SwitcherAction::GoToSlot(slot) => {
                self.switcher.go_to_slot(
                    slot,
                    &mut self.registry,
                    &mut self.arbiter,
                    &mut *self.display,
                    now,
                    &mut self.out,
                );
            }
            SwitcherAction::ForceGoToSlot(slot) => {
                self.switcher.force_go_to_slot(
                    slot,
                    self.secure.auth_active(),
                    &mut self.registry,
                    &mut self.arbiter,
                    &mut *self.display,
                    now,
                    &mut self.out,
                );
            }
            SwitcherAction::GoToNext => {
                self.switcher.go_to_next(
                    &mut self.registry,
                    &mut self.arbiter,
                    &mut *self.display,
                    now,
                    &mut self.out,
                );
            }
            SwitcherAction::AuthOrLock => {
                if self.secure.auth_active() {
                    self.force_auth(now);
                } else {
                    self.lock(false, now);
                }
            }
        }
        self.remember_focus();
    }

    fn dispatch_device(&mut self, action: DeviceAction) {
        for entry in self.devices.values_mut() {
            if let Some(pipeline) = entry.touchpad.as_mut() {
                match action {
                    DeviceAction::TouchpadOff => pipeline.disable(),
                    DeviceAction::TouchpadOn => pipeline.enable(),
                }
            }
        }
    }

    fn apply_touchpad_config(&mut self) {
        let config = self.touchpad_config;
        for entry in self.devices.values_mut() {
            if let Some(pipeline) = entry.touchpad.as_mut() {
                pipeline.set_config(config);
            }
        }
    }

    fn toggle_touchpads(&mut self) {
        info!("touchpad toggle button");
        for entry in self.devices.values_mut() {
            if let Some(pipeline) = entry.touchpad.as_mut() {
                pipeline.toggle();
            }
        }
    }

    fn dispatch_gesture(&mut self, action: GestureAction, now: Instant) {
        info!(?action, "gesture recognized");
        match action {
            GestureAction::ShowUi => {
                if let Some(uivm) = self.registry.uivm().map(|d| d.domid) {
                    let _ = self.switcher.switch(
                        uivm,
                        false,
                        false,
                        &mut self.registry,
                        &mut self.arbiter,
                        &mut *self.display,
                        now,
                        &mut self.out,
                    );
                }
            }
            GestureAction::SwitchRight => {
                self.switcher.go_to_next(
                    &mut self.registry,
                    &mut self.arbiter,
                    &mut *self.display,
                    now,
                    &mut self.out,
                );
            }
            GestureAction::SwitchLeft => self.go_to_prev(now),
            // The tracker handles stand-back internally.
            GestureAction::StandBack => {}
        }
        self.remember_focus();
    }

    /// Counterpart of the switcher's next-slot scan, walking downwards.
    fn go_to_prev(&mut self, now: Instant) {
        let Some(cur) = self.switcher.current() else {
            return;
        };
        let Some(cur_slot) = self.registry.get(cur).map(|d| d.slot) else {
            return;
        };
        if cur_slot == UIVM_SLOT {
            return;
        }
        for step in 1..10 {
            let slot = (cur_slot - step).rem_euclid(10);
            if slot == UIVM_SLOT {
                continue;
            }
            if self.registry.with_slot(slot).is_some() {
                self.switcher.go_to_slot(
                    slot,
                    &mut self.registry,
                    &mut self.arbiter,
                    &mut *self.display,
                    now,
                    &mut self.out,
                );
                return;
            }
        }
    }

    // ── Touchpad timers ───────────────────────────────────────────────────────

    fn apply_touchpad_outputs(&mut self, slot: u8, outs: Vec<TouchpadOut>, now: Instant) {
        for out in outs {
            match out {
                TouchpadOut::Event(ev) => self.arbiter.inject(
                    &mut self.registry,
                    ev,
                    slot,
                    SourceKind::Touchpad,
                    now,
                    &mut self.out,
                ),
                TouchpadOut::ArmTapTimer => self.arm_tap_timer(slot),
                TouchpadOut::CancelTapTimer => {
                    if let Some(entry) = self.devices.get_mut(&slot) {
                        entry.tap_gen += 1;
                    }
                }
                TouchpadOut::ArmAutoscroll => self.arm_autoscroll(slot),
                TouchpadOut::CancelAutoscroll => {
                    if let Some(entry) = self.devices.get_mut(&slot) {
                        entry.autoscroll_gen += 1;
                    }
                }
            }
        }
    }

    fn arm_tap_timer(&mut self, slot: u8) {
        let Some(entry) = self.devices.get_mut(&slot) else {
            return;
        };
        entry.tap_gen += 1;
        let gen = entry.tap_gen;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TAP_DRAG_TIMEOUT).await;
            let _ = tx.send(EngineMsg::TapTimer { slot, gen }).await;
        });
    }

    fn arm_autoscroll(&mut self, slot: u8) {
        let Some(entry) = self.devices.get_mut(&slot) else {
            return;
        };
        entry.autoscroll_gen += 1;
        let gen = entry.autoscroll_gen;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(input_core::normalize::touchpad::AUTOSCROLL_INTERVAL).await;
            let _ = tx.send(EngineMsg::AutoscrollTick { slot, gen }).await;
        });
    }

    fn handle_tap_timer(&mut self, slot: u8, gen: u64, now: Instant) {
        let outs = match self.devices.get_mut(&slot) {
            Some(entry) if entry.tap_gen == gen => entry
                .touchpad
                .as_mut()
                .map(|p| p.tap_timer_fired())
                .unwrap_or_default(),
            _ => return,
        };
        self.apply_touchpad_outputs(slot, outs, now);
    }

    fn handle_autoscroll_tick(&mut self, slot: u8, gen: u64, now: Instant) {
        let outs = match self.devices.get_mut(&slot) {
            Some(entry) if entry.autoscroll_gen == gen => entry
                .touchpad
                .as_mut()
                .map(|p| p.autoscroll_tick())
                .unwrap_or_default(),
            _ => return,
        };
        let cancelled = outs.contains(&TouchpadOut::CancelAutoscroll);
        self.apply_touchpad_outputs(slot, outs, now);
        if !cancelled {
            // Keep scrolling until the finger leaves the corner.
            self.rearm_autoscroll(slot, gen);
        }
    }

    fn rearm_autoscroll(&mut self, slot: u8, gen: u64) {
        let Some(entry) = self.devices.get(&slot) else {
            return;
        };
        if entry.autoscroll_gen != gen {
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(input_core::normalize::touchpad::AUTOSCROLL_INTERVAL).await;
            let _ = tx.send(EngineMsg::AutoscrollTick { slot, gen }).await;
        });
    }

    // ── Housekeeping tick ─────────────────────────────────────────────────────

    fn handle_tick(&mut self, now: Instant) {
        for action in self.switch_bindings.tick() {
            self.dispatch_switch(action, now);
        }
        for action in self.device_bindings.tick() {
            self.dispatch_device(action);
        }

        if self.secure.secure_mode() {
            if self.secure.locked() {
                self.revert_to_auth(now);
            }
        } else if self.lock_timeout_secs > 0 {
            self.idle_secs += 1;
            if self.idle_secs >= self.lock_timeout_secs {
                info!(idle = self.idle_secs, "idle timeout reached");
                self.idle_secs = 0;
                self.lock(false, now);
            }
        }
    }

    // ── Lock and secure mode ──────────────────────────────────────────────────

    fn lock(&mut self, can_switch_out: bool, now: Instant) {
        if self.secure.secure_mode() {
            return;
        }
        info!(can_switch_out, "locking the screen");
        if !can_switch_out {
            self.switcher.set_enabled(false);
        }
        if !self.secure.auth_active() {
            let flags = if can_switch_out {
                AUTH_FLAG_LOCK
            } else {
                AUTH_FLAG_LOCK | AUTH_FLAG_CANNOT_CANCEL
            };
            let user = self.platform_user.clone();
            self.secure.set_context(&user, "", flags);
        }
        self.enter_secure(now);
    }

    fn force_auth(&mut self, now: Instant) {
        info!("bringing the authentication dialog back to the front");
        self.enter_secure(now);
        self.revert_to_auth(now);
    }

    fn enter_secure(&mut self, now: Instant) {
        if self.secure.set_secure(true, &mut *self.credentials) {
            info!("secure input mode on");
            self.revert_to_auth(now);
        }
    }

    fn leave_secure(&mut self) {
        if self.secure.set_secure(false, &mut *self.credentials) {
            info!("secure input mode off");
            self.switcher.set_enabled(self.edge_switching_configured);
        }
    }

    /// While the lock screen is up, keep pulling focus back to the UI VM.
    /// A primary VM without PV drivers cannot hand the display back, so
    /// it is left alone.
    fn revert_to_auth(&mut self, now: Instant) {
        let Some(uivm) = self.registry.uivm().map(|d| d.domid) else {
            return;
        };
        let focused = self.switcher.get_focus();
        if focused == uivm {
            return;
        }
        if let Some(d) = self.registry.get(focused) {
            if d.is_pvm && !d.is_pv_domain {
                return;
            }
        }
        let _ = self.switcher.switch(
            uivm,
            false,
            false,
            &mut self.registry,
            &mut self.arbiter,
            &mut *self.display,
            now,
            &mut self.out,
        );
    }

    // ── Control calls ─────────────────────────────────────────────────────────

    fn handle_control(
        &mut self,
        caller: Option<u32>,
        request: ControlRequest,
        now: Instant,
    ) -> Result<ControlResponse, ControlError> {
        let caller_id = caller.ok_or(DivertError::NoSourceId);
        match request {
            ControlRequest::DivertMouseFocus {
                uuid,
                sframe,
                dframe,
            } => {
                control::divert_mouse_focus(
                    &mut self.registry,
                    &mut self.arbiter,
                    caller_id?,
                    &uuid,
                    sframe,
                    dframe,
                    &mut self.out,
                )?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::SetKeyboardFilter { spec } => {
                control::set_keyboard_filter(&mut self.registry, caller_id?, &spec)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::DivertKeyboardFocus { uuid } => {
                control::divert_keyboard_focus(
                    &mut self.registry,
                    &mut self.arbiter,
                    caller_id?,
                    &uuid,
                    now,
                    &mut self.out,
                )?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::StopMouseDivert => {
                control::stop_mouse_divert(
                    &mut self.registry,
                    &mut self.arbiter,
                    caller_id?,
                    &mut self.out,
                )?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::StopKeyboardDivert => {
                control::stop_keyboard_divert(
                    &mut self.registry,
                    &mut self.arbiter,
                    caller_id?,
                    now,
                    &mut self.out,
                )?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::Touch { uuid } => {
                control::touch(&mut self.registry, &mut self.arbiter, &uuid, &mut self.out)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::FocusMode { mode } => {
                control::focus_mode(&mut self.registry, caller_id?, mode)?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::GetFocusDomid => Ok(ControlResponse::Domid(self.switcher.get_focus())),
            ControlRequest::SwitchFocus { slot, force } => {
                if force {
                    self.switcher.force_go_to_slot(
                        slot,
                        self.secure.auth_active(),
                        &mut self.registry,
                        &mut self.arbiter,
                        &mut *self.display,
                        now,
                        &mut self.out,
                    );
                } else {
                    self.switcher.go_to_slot(
                        slot,
                        &mut self.registry,
                        &mut self.arbiter,
                        &mut *self.display,
                        now,
                        &mut self.out,
                    );
                }
                self.remember_focus();
                Ok(ControlResponse::Ok)
            }
            ControlRequest::GetMouseSpeed => {
                Ok(ControlResponse::Speed(self.arbiter.mouse_speed_step()))
            }
            ControlRequest::SetMouseSpeed { step } => {
                self.arbiter.set_mouse_speed_step(step);
                // Persist the clamped value, not the raw request.
                self.settings
                    .write_setting("/mouse/speed", &self.arbiter.mouse_speed_step().to_string());
                Ok(ControlResponse::Ok)
            }
            ControlRequest::GetNumlockRestore => Ok(ControlResponse::Flag(
                self.arbiter.config().numlock_restore_on_switch,
            )),
            ControlRequest::SetNumlockRestore { on } => {
                self.arbiter.set_numlock_restore_on_switch(on);
                self.settings
                    .write_setting("/keyboard/numlock-restore-on-switch", &on.to_string());
                Ok(ControlResponse::Ok)
            }
            ControlRequest::GetTouchpadTapToClick => Ok(ControlResponse::Flag(
                self.touchpad_config.tap_to_click_enabled,
            )),
            ControlRequest::SetTouchpadTapToClick { on } => {
                self.touchpad_config.tap_to_click_enabled = on;
                self.apply_touchpad_config();
                self.settings
                    .write_setting("/touchpad/tap-to-click-enabled", &on.to_string());
                Ok(ControlResponse::Ok)
            }
            ControlRequest::GetTouchpadScrolling => Ok(ControlResponse::Flag(
                self.touchpad_config.scrolling_enabled,
            )),
            ControlRequest::SetTouchpadScrolling { on } => {
                self.touchpad_config.scrolling_enabled = on;
                self.apply_touchpad_config();
                self.settings
                    .write_setting("/touchpad/scrolling-enabled", &on.to_string());
                Ok(ControlResponse::Ok)
            }
            ControlRequest::GetSwitchResistance => Ok(ControlResponse::Resistance(
                self.arbiter.switch_resistance(),
            )),
            ControlRequest::SetSwitchResistance { resistance } => {
                self.arbiter.set_switch_resistance(resistance);
                self.settings.write_setting(
                    "/switcher/resistance",
                    &self.arbiter.switch_resistance().to_string(),
                );
                Ok(ControlResponse::Ok)
            }
            ControlRequest::Lock { can_switch_out } => {
                self.lock(can_switch_out, now);
                Ok(ControlResponse::Ok)
            }
            ControlRequest::SecureMode { on } => {
                if on {
                    self.enter_secure(now);
                } else {
                    self.leave_secure();
                }
                Ok(ControlResponse::Ok)
            }
            ControlRequest::CollectPassword => {
                self.secure.start_collection(&mut *self.credentials);
                Ok(ControlResponse::Ok)
            }
            ControlRequest::AuthSetContext { user, title, flags } => {
                self.secure.set_context(&user, &title, flags);
                Ok(ControlResponse::Ok)
            }
            ControlRequest::AttachDomain {
                domid,
                uuid,
                slot,
                pvm,
            } => self.attach_domain(domid, uuid, slot, pvm, now),
            ControlRequest::DetachDomain { domid } => {
                self.domain_gone(domid, now);
                Ok(ControlResponse::Ok)
            }
            ControlRequest::ExpectDeath { domid } => {
                if let Some(d) = self.registry.get(domid) {
                    self.focus_slots.expect_death(d.slot, now);
                }
                Ok(ControlResponse::Ok)
            }
            ControlRequest::CancelExpectedDeath { domid } => {
                if let Some(d) = self.registry.get(domid) {
                    self.focus_slots.dont_expect_death(d.slot);
                }
                Ok(ControlResponse::Ok)
            }
            ControlRequest::PowerStateChanged { domid, asleep } => {
                if let Some(d) = self.registry.get_mut(domid) {
                    d.is_in_s3 = asleep;
                }
                if asleep {
                    self.switcher.s3(
                        domid,
                        &mut self.registry,
                        &mut self.arbiter,
                        &mut *self.display,
                        now,
                        &mut self.out,
                    );
                    self.remember_focus();
                }
                Ok(ControlResponse::Ok)
            }
            ControlRequest::ResolutionChanged { domid, xres, yres } => {
                self.arbiter.handle_resolution_change(
                    domid,
                    xres,
                    yres,
                    &mut self.registry,
                    &mut self.out,
                );
                if let Some(d) = self.registry.get_mut(domid) {
                    d.desktop_xres = xres;
                    d.desktop_yres = yres;
                }
                Ok(ControlResponse::Ok)
            }
        }
    }

    // ── Domain lifecycle ──────────────────────────────────────────────────────

    fn attach_domain(
        &mut self,
        domid: u32,
        uuid: uuid::Uuid,
        slot: i32,
        pvm: bool,
        now: Instant,
    ) -> Result<ControlResponse, ControlError> {
        if self.registry.get(domid).is_none() {
            info!(domid, slot, pvm, "attaching domain");
            let mut d = Domain::new(domid, slot, uuid);
            d.is_pvm = pvm;
            self.registry
                .insert(d)
                .map_err(|_| ControlError::AttachFailed { domid })?;
        }

        let take_focus = {
            let d = self
                .registry
                .get(domid)
                .ok_or(ControlError::AttachFailed { domid })?;
            self.focus_slots.update_domain(d)
        };
        self.registry.touch_last_input(domid, now);

        if take_focus {
            let _ = self.switcher.switch(
                domid,
                false,
                false,
                &mut self.registry,
                &mut self.arbiter,
                &mut *self.display,
                now,
                &mut self.out,
            );
            self.remember_focus();
        }
        Ok(ControlResponse::Ok)
    }

    fn domain_gone(&mut self, domid: u32, now: Instant) {
        let Some(d) = self.registry.get(domid).cloned() else {
            return;
        };
        info!(domid, "domain is gone");

        let fall_back = self.focus_slots.domain_gone(&d, now);
        self.arbiter.domain_gone(domid);
        self.switcher.domain_gone(
            domid,
            &mut self.registry,
            &mut self.arbiter,
            &mut *self.display,
            now,
            &mut self.out,
        );
        if fall_back {
            if let Some(uivm) = self.registry.uivm().map(|u| u.domid).filter(|&u| u != domid) {
                let _ = self.switcher.switch(
                    uivm,
                    false,
                    false,
                    &mut self.registry,
                    &mut self.arbiter,
                    &mut *self.display,
                    now,
                    &mut self.out,
                );
            }
        }

        self.registry.scrub_references(domid);
        self.registry.remove(domid);
        self.remember_focus();
    }

    fn remember_focus(&mut self) {
        let uuid = self
            .switcher
            .current()
            .and_then(|domid| self.registry.get(domid))
            .map(|d| d.uuid);
        if let Some(uuid) = uuid {
            self.focus_slots.remember_focus(uuid);
        }
    }

    // ── Hotplug ───────────────────────────────────────────────────────────────

    fn handle_hotplug(&mut self, ev: HotplugEvent) {
        match ev {
            HotplugEvent::Added {
                slot,
                class,
                normalizer,
            } => {
                info!(slot, ?class, "device added");
                let (mut touchpad, tablet) = match normalizer {
                    Normalizer::Touchpad(p) => (Some(p), None),
                    Normalizer::Tablet(t) => (None, Some(t)),
                    Normalizer::None => (None, None),
                };
                // Runtime setting changes win over the scan-time defaults.
                if let Some(pipeline) = touchpad.as_mut() {
                    pipeline.set_config(self.touchpad_config);
                }
                self.devices.insert(
                    slot,
                    DeviceEntry {
                        class,
                        touchpad,
                        tablet,
                        tap_gen: 0,
                        autoscroll_gen: 0,
                    },
                );
            }
            HotplugEvent::Removed { slot } => {
                info!(slot, "device removed");
                self.devices.remove(&slot);
            }
        }
    }

    // ── Output ────────────────────────────────────────────────────────────────

    fn service_switch_requests(&mut self, now: Instant) {
        let requests = std::mem::take(&mut self.out.requests);
        for request in requests {
            match request {
                SwitchRequest::ToUivm => {
                    if let Some(uivm) = self.registry.uivm().map(|d| d.domid) {
                        let _ = self.switcher.switch(
                            uivm,
                            false,
                            false,
                            &mut self.registry,
                            &mut self.arbiter,
                            &mut *self.display,
                            now,
                            &mut self.out,
                        );
                    }
                }
                SwitchRequest::Edge { event, x, y } => {
                    self.switcher.switch_on_mouse(
                        &event,
                        x,
                        y,
                        &mut self.registry,
                        &mut self.arbiter,
                        &mut *self.display,
                        now,
                        &mut self.out,
                    );
                }
            }
            self.remember_focus();
        }
    }

    async fn flush(&mut self) {
        for domid in std::mem::take(&mut self.out.wake_domains) {
            self.waker.wake(domid);
            if let Some(d) = self.registry.get_mut(domid) {
                d.is_in_s3 = false;
            }
        }
        for led in std::mem::take(&mut self.out.leds) {
            self.leds.set_led(led.led, led.on);
        }
        for frame in std::mem::take(&mut self.out.frames) {
            // Sleeping guests get nothing; the wake path clears the flag
            // before anything is queued for them.
            if self.registry.get(frame.domid).is_some_and(|d| d.is_in_s3) {
                continue;
            }
            self.transport.deliver(frame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::secure::{AuthField, Credentials};
    use input_core::codes::{KEY_2, KEY_A, KEY_H, KEY_LEFTCTRL, KEY_SPACE};
    use uuid::Uuid;

    const UIVM: u32 = 1;
    const GUEST: u32 = 4;

    struct NullTransport;

    #[async_trait]
    impl OutputTransport for NullTransport {
        async fn deliver(&mut self, _frame: WireFrame) {}
    }

    #[derive(Default)]
    struct FakeDisplay {
        visible: Vec<(u32, bool)>,
    }

    impl DisplayBackend for FakeDisplay {
        fn set_visible(&mut self, domid: u32, force: bool) -> bool {
            self.visible.push((domid, force));
            true
        }

        fn focus_changed(&mut self, _lost: Option<u32>, _gained: u32) {}
    }

    #[derive(Default)]
    struct NullCreds;

    impl CredentialSink for NullCreds {
        fn field_focused(&mut self, _field: AuthField) {}
        fn username_changed(&mut self, _username: &str) {}
        fn cancelled(&mut self, _hide_window: bool) {}
        fn submitted(&mut self, _credentials: Credentials) {}
    }

    struct NullLeds;

    impl LedSink for NullLeds {
        fn set_led(&mut self, _led: u16, _on: bool) {}
    }

    struct NullWaker;

    impl DomainWaker for NullWaker {
        fn wake(&mut self, _domid: u32) {}
    }

    struct NullSettings;

    impl SettingsStore for NullSettings {
        fn write_setting(&mut self, _path: &str, _value: &str) {}
    }

    #[derive(Clone, Default)]
    struct SharedSettings {
        writes: std::sync::Arc<std::sync::Mutex<Vec<(String, String)>>>,
    }

    impl SharedSettings {
        fn writes(&self) -> Vec<(String, String)> {
            self.writes.lock().expect("lock").clone()
        }
    }

    impl SettingsStore for SharedSettings {
        fn write_setting(&mut self, path: &str, value: &str) {
            self.writes
                .lock()
                .expect("lock")
                .push((path.to_string(), value.to_string()));
        }
    }

    fn make_engine(config: EngineConfig) -> Engine {
        let ports = EnginePorts {
            transport: Box::new(NullTransport),
            display: Box::new(FakeDisplay::default()),
            credentials: Box::new(NullCreds),
            leds: Box::new(NullLeds),
            waker: Box::new(NullWaker),
            settings: Box::new(NullSettings),
        };
        Engine::new(config, ports).0
    }

    fn attach(engine: &mut Engine, domid: u32, slot: i32, pvm: bool) {
        engine
            .handle_control(
                None,
                ControlRequest::AttachDomain {
                    domid,
                    uuid: Uuid::new_v4(),
                    slot,
                    pvm,
                },
                Instant::now(),
            )
            .expect("attach");
    }

    fn add_keyboard(engine: &mut Engine, slot: u8) {
        engine.handle_hotplug(HotplugEvent::Added {
            slot,
            class: DeviceClass::Keyboard,
            normalizer: Normalizer::None,
        });
    }

    fn press(engine: &mut Engine, slot: u8, code: u16) {
        let now = Instant::now();
        engine.handle_device_event(slot, InputEvent::key(code, 1), now);
        engine.handle_device_event(slot, InputEvent::key(code, 0), now);
    }

    #[test]
    fn test_attach_pvm_takes_focus() {
        let mut engine = make_engine(EngineConfig::default());
        attach(&mut engine, UIVM, 0, false);

        attach(&mut engine, GUEST, 1, true);

        assert_eq!(engine.switcher.current(), Some(GUEST));
    }

    #[test]
    fn test_keyboard_event_reaches_focused_domain() {
        let mut engine = make_engine(EngineConfig::default());
        attach(&mut engine, UIVM, 0, false);
        attach(&mut engine, GUEST, 1, true);
        add_keyboard(&mut engine, 3);

        press(&mut engine, 3, KEY_A);

        let frames = engine.out.frames_for(GUEST);
        assert!(frames.iter().any(|f| f.event.code == KEY_A));
    }

    #[test]
    fn test_slot_chord_switches_focus() {
        let mut engine = make_engine(EngineConfig::default());
        attach(&mut engine, UIVM, 0, false);
        attach(&mut engine, GUEST, 2, false);
        add_keyboard(&mut engine, 3);

        // Ctrl+2 selects slot 2.
        let now = Instant::now();
        engine.handle_device_event(3, InputEvent::key(KEY_LEFTCTRL, 1), now);
        engine.handle_device_event(3, InputEvent::key(KEY_2, 1), now);

        assert_eq!(engine.switcher.current(), Some(GUEST));
    }

    #[test]
    fn test_secure_mode_swallows_keys() {
        let mut engine = make_engine(EngineConfig::default());
        attach(&mut engine, UIVM, 0, false);
        add_keyboard(&mut engine, 3);
        let now = Instant::now();
        engine
            .handle_control(
                None,
                ControlRequest::SwitchFocus {
                    slot: 0,
                    force: false,
                },
                now,
            )
            .expect("switch");
        engine
            .handle_control(
                None,
                ControlRequest::AuthSetContext {
                    user: "alice".into(),
                    title: "log in".into(),
                    flags: 0,
                },
                now,
            )
            .expect("context");
        engine
            .handle_control(None, ControlRequest::SecureMode { on: true }, now)
            .expect("secure on");
        engine
            .handle_control(None, ControlRequest::CollectPassword, now)
            .expect("collect");
        engine.out.clear();

        press(&mut engine, 3, KEY_H);

        // Only the masked echo reaches the UI VM.
        assert!(engine.out.frames.iter().all(|f| f.event.code != KEY_H));
        assert!(engine
            .out
            .frames
            .iter()
            .any(|f| f.event.code == KEY_SPACE && f.domid == UIVM));
    }

    #[test]
    fn test_detached_focused_domain_falls_back_to_uivm() {
        let mut engine = make_engine(EngineConfig::default());
        attach(&mut engine, UIVM, 0, false);
        attach(&mut engine, GUEST, 1, true);
        assert_eq!(engine.switcher.current(), Some(GUEST));

        engine
            .handle_control(
                None,
                ControlRequest::DetachDomain { domid: GUEST },
                Instant::now(),
            )
            .expect("detach");

        assert_eq!(engine.switcher.current(), Some(UIVM));
        assert!(engine.registry.get(GUEST).is_none());
    }

    #[test]
    fn test_announced_pvm_death_holds_focus() {
        let mut engine = make_engine(EngineConfig::default());
        attach(&mut engine, UIVM, 0, false);
        attach(&mut engine, GUEST, 1, true);
        attach(&mut engine, 9, 2, false);
        let now = Instant::now();
        engine
            .handle_control(
                None,
                ControlRequest::SwitchFocus {
                    slot: 2,
                    force: false,
                },
                now,
            )
            .expect("switch");

        engine
            .handle_control(None, ControlRequest::ExpectDeath { domid: GUEST }, now)
            .expect("announce");
        engine
            .handle_control(None, ControlRequest::DetachDomain { domid: GUEST }, now)
            .expect("detach");

        // The reboot was announced, the other guest keeps the screen.
        assert_eq!(engine.switcher.current(), Some(9));
    }

    #[test]
    fn test_cancelled_death_announcement_forces_uivm_again() {
        let mut engine = make_engine(EngineConfig::default());
        attach(&mut engine, UIVM, 0, false);
        attach(&mut engine, GUEST, 1, true);
        attach(&mut engine, 9, 2, false);
        let now = Instant::now();
        engine
            .handle_control(
                None,
                ControlRequest::SwitchFocus {
                    slot: 2,
                    force: false,
                },
                now,
            )
            .expect("switch");

        engine
            .handle_control(None, ControlRequest::ExpectDeath { domid: GUEST }, now)
            .expect("announce");
        engine
            .handle_control(
                None,
                ControlRequest::CancelExpectedDeath { domid: GUEST },
                now,
            )
            .expect("cancel");
        engine
            .handle_control(None, ControlRequest::DetachDomain { domid: GUEST }, now)
            .expect("detach");

        assert_eq!(engine.switcher.current(), Some(UIVM));
    }

    #[test]
    fn test_idle_timeout_locks_the_screen() {
        let mut engine = make_engine(EngineConfig {
            lock_timeout_secs: 2,
            ..EngineConfig::default()
        });
        attach(&mut engine, UIVM, 0, false);
        let now = Instant::now();

        engine.handle_tick(now);
        assert!(!engine.secure.secure_mode());
        engine.handle_tick(now);

        assert!(engine.secure.secure_mode());
        assert!(engine.secure.locked());
    }

    #[test]
    fn test_input_resets_idle_countdown() {
        let mut engine = make_engine(EngineConfig {
            lock_timeout_secs: 2,
            ..EngineConfig::default()
        });
        attach(&mut engine, UIVM, 0, false);
        add_keyboard(&mut engine, 3);
        let now = Instant::now();

        engine.handle_tick(now);
        press(&mut engine, 3, KEY_A);
        engine.handle_tick(now);

        assert!(!engine.secure.secure_mode());
    }

    #[test]
    fn test_unknown_caller_cannot_install_diverts() {
        let mut engine = make_engine(EngineConfig::default());
        attach(&mut engine, UIVM, 0, false);

        let result = engine.handle_control(
            None,
            ControlRequest::DivertKeyboardFocus {
                uuid: Uuid::new_v4(),
            },
            Instant::now(),
        );

        assert_eq!(
            result,
            Err(ControlError::Divert(DivertError::NoSourceId))
        );
    }

    #[test]
    fn test_sleeping_domain_gets_no_frames() {
        let mut engine = make_engine(EngineConfig::default());
        attach(&mut engine, UIVM, 0, false);
        attach(&mut engine, GUEST, 1, true);
        add_keyboard(&mut engine, 3);
        engine
            .handle_control(
                None,
                ControlRequest::PowerStateChanged {
                    domid: GUEST,
                    asleep: true,
                },
                Instant::now(),
            )
            .expect("power state");

        // Sleep moved focus to the UI VM.
        assert_eq!(engine.switcher.current(), Some(UIVM));
    }

    #[test]
    fn test_setting_changes_are_written_to_the_store() {
        let store = SharedSettings::default();
        let ports = EnginePorts {
            transport: Box::new(NullTransport),
            display: Box::new(FakeDisplay::default()),
            credentials: Box::new(NullCreds),
            leds: Box::new(NullLeds),
            waker: Box::new(NullWaker),
            settings: Box::new(store.clone()),
        };
        let mut engine = Engine::new(EngineConfig::default(), ports).0;
        let now = Instant::now();

        engine
            .handle_control(None, ControlRequest::SetMouseSpeed { step: 99 }, now)
            .expect("speed");
        engine
            .handle_control(None, ControlRequest::SetNumlockRestore { on: false }, now)
            .expect("numlock");

        // The clamped value is what goes to disk.
        let writes = store.writes();
        assert!(writes.contains(&("/mouse/speed".to_string(), "10".to_string())));
        assert!(writes.contains(&(
            "/keyboard/numlock-restore-on-switch".to_string(),
            "false".to_string()
        )));
    }
}
