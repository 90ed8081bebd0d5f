//! Touchpad packet decoding: taps, drags, edge scrolling, pointer deltas.
//!
//! A PS/2-class touchpad reports absolute finger position and pressure.
//! This pipeline assembles one packet per sync boundary and synthesizes the
//! relative-motion, click, and scroll events a guest expects from a mouse:
//!
//! - a pressure hysteresis (distinct down/up thresholds) decides whether a
//!   finger is touching;
//! - a tap finite state machine distinguishes taps, double taps, and
//!   tap-then-drag, using a deferred-click timer to keep a tap-drag from
//!   looking like a double click;
//! - the right edge acts as a vertical scroll strip, with inertial corner
//!   autoscroll driven by a repeating timer once the finger parks in a
//!   corner while scrolling;
//! - pointer deltas come from a 4-sample position history through a
//!   fixed-weight finite-difference estimator, scaled by the physical
//!   diagonal and the configured speed;
//! - clickpads (left button only) synthesize a right click for presses in
//!   the bottom-right quadrant of the click strip.
//!
//! The pipeline is pure with respect to time: it receives packet timestamps
//! from the caller and expresses timers as [`TouchpadOut`] requests; the
//! engine owns the actual timers and calls [`TouchpadPipeline::tap_timer_fired`]
//! / [`TouchpadPipeline::autoscroll_tick`] when they fire.

use std::time::Duration;

use tracing::info;

use crate::event::codes::*;
use crate::event::InputEvent;

const BTN_TASK: u16 = 0x117;
const NUM_BUTTONS: u16 = BTN_TASK - BTN_LEFT;

const MOVE_MULT: f64 = 0.02;
const SCROLL_MULT: f64 = 0.04;
const PRESSURE_UP_MULT: f64 = 0.12;
const PRESSURE_DOWN_MULT: f64 = 0.098;
const HISTORY_LEN: usize = 4;
const MIN_PACKET_COUNT_MOVE: i32 = 3;

/// Reference diagonal resolution the speed curve is calibrated against.
const DEFAULT_DIAG: f64 = 5024.0;

/// Deferred-tap disambiguation window.
pub const TAP_DRAG_TIMEOUT: Duration = Duration::from_micros(180_000);
/// Corner autoscroll repeat interval.
pub const AUTOSCROLL_INTERVAL: Duration = Duration::from_micros(200_000);

// Button-mask encoding: bit pair per button, down bit then up bit.
const LEFT_DOWN: u32 = 0x01;
const LEFT_UP: u32 = 0x02;
const RIGHT_DOWN: u32 = 0x04;
const RIGHT_UP: u32 = 0x08;

/// One output of the pipeline: either a canonical event to forward or a
/// timer request for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchpadOut {
    Event(InputEvent),
    /// Arm (or re-arm) the one-shot tap-drag timer.
    ArmTapTimer,
    CancelTapTimer,
    /// Arm (or push back) the autoscroll timer.
    ArmAutoscroll,
    CancelAutoscroll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapState {
    Start,
    Touch,
    Move,
    SingleTapPending,
    PossibleDrag,
    Drag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScrollDir {
    Up,
    Down,
}

// Edge classification as a plain bitmask.
const NO_EDGE: u8 = 0;
const RIGHT_EDGE: u8 = 1;
const BOTTOM_EDGE: u8 = 2;
const TOP_EDGE: u8 = 4;

/// Per-device geometry and thresholds, derived once from the probed axis
/// ranges.
#[derive(Debug, Clone)]
pub struct TouchpadLimits {
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
    pub min_pressure: i32,
    pub max_pressure: i32,
    right_edge: i32,
    bottom_edge: i32,
    top_edge: i32,
    tap_move: i32,
    no_x: i32,
    no_y: i32,
    no_pressure: i32,
    scroll_dist_vert: i32,
    speed: f64,
    is_clickpad: bool,
    clickpad_left_button_max_x: i32,
}

impl TouchpadLimits {
    /// Builds the limits from probed axis ranges and button capabilities.
    ///
    /// A device reporting a left button but neither right nor middle is a
    /// clickpad.
    pub fn new(
        x: (i32, i32),
        y: (i32, i32),
        pressure: (i32, i32),
        has_right_button: bool,
        has_middle_button: bool,
        has_left_button: bool,
    ) -> Self {
        const DEFAULT_EDGE_MULT: f64 = 0.17;
        const EDGE_MULT_LOW_RES: f64 = 0.20;
        const CLICKPAD_BOTTOM_EDGE_MULT: f64 = 0.20;
        const CLICKPAD_LEFT_BUTTON_MAXX_MULT: f64 = 0.50;

        let (min_x, max_x) = x;
        let (min_y, max_y) = y;
        let (min_pressure, max_pressure) = pressure;

        let is_clickpad = has_left_button && !has_right_button && !has_middle_button;

        let width = (max_x - min_x).abs() as f64;
        let height = (max_y - min_y).abs() as f64;
        let diag = (width * width + height * height).sqrt();
        let tap_move = (diag * MOVE_MULT) as i32;

        let edge_mult = if diag < DEFAULT_DIAG {
            EDGE_MULT_LOW_RES
        } else {
            DEFAULT_EDGE_MULT
        };

        let right_edge = max_x - (width * edge_mult) as i32;
        let top_edge = min_y + (height * edge_mult) as i32;
        let bottom_edge = if is_clickpad {
            max_y - (height * CLICKPAD_BOTTOM_EDGE_MULT) as i32
        } else {
            max_y - (height * edge_mult) as i32
        };

        let clickpad_left_button_max_x = if is_clickpad {
            min_x + (width * CLICKPAD_LEFT_BUTTON_MAXX_MULT) as i32
        } else {
            min_x - 1
        };

        Self {
            min_x,
            max_x,
            min_y,
            max_y,
            min_pressure,
            max_pressure,
            right_edge,
            bottom_edge,
            top_edge,
            tap_move,
            no_x: min_x - 1,
            no_y: min_y - 1,
            no_pressure: min_pressure - 1,
            scroll_dist_vert: (diag * SCROLL_MULT) as i32,
            speed: 0.15,
            is_clickpad,
            clickpad_left_button_max_x,
        }
    }

    pub fn is_clickpad(&self) -> bool {
        self.is_clickpad
    }

    /// Folds the configured speed (1..=10, default 5) into the physical
    /// speed multiplier derived from the diagonal.
    pub fn apply_config_speed(&mut self, config_speed: i32) {
        const DEFAULT_SPEED: f64 = 0.15;
        const MIN_SPEED: f64 = 0.1;
        const MAX_SPEED: f64 = 0.9;
        const DEFAULT_CONFIG_SPEED: i32 = 5;
        const MIN_CONFIG_SPEED: i32 = 1;
        const MAX_CONFIG_SPEED: i32 = 10;

        let width = (self.max_x - self.min_x).abs() as f64;
        let height = (self.max_y - self.min_y).abs() as f64;
        let diag = (width * width + height * height).sqrt();

        self.speed = DEFAULT_SPEED;
        if diag > 0.0 && (diag as i32) != DEFAULT_DIAG as i32 {
            self.speed = ((DEFAULT_SPEED * DEFAULT_DIAG) / diag).clamp(MIN_SPEED, MAX_SPEED);
        }

        let mut speed = config_speed;
        if !(MIN_CONFIG_SPEED..=MAX_CONFIG_SPEED).contains(&speed) {
            info!(speed, "touchpad speed out of range, using default");
            speed = DEFAULT_CONFIG_SPEED;
        }
        if speed == DEFAULT_CONFIG_SPEED {
            return;
        }

        let units = self.speed / DEFAULT_CONFIG_SPEED as f64;
        self.speed += units * (speed - DEFAULT_CONFIG_SPEED) as f64;
    }

    fn detect_edge(&self, x: i32, y: i32) -> u8 {
        let mut edge = NO_EDGE;
        if x > self.right_edge {
            edge |= RIGHT_EDGE;
        }
        if y > self.bottom_edge {
            edge |= BOTTOM_EDGE;
        } else if y < self.top_edge {
            edge |= TOP_EDGE;
        }
        edge
    }
}

/// User-facing configuration toggles.
#[derive(Debug, Clone, Copy)]
pub struct TouchpadConfig {
    pub tap_to_click_enabled: bool,
    pub scrolling_enabled: bool,
    pub speed: i32,
}

impl Default for TouchpadConfig {
    fn default() -> Self {
        Self {
            tap_to_click_enabled: true,
            scrolling_enabled: true,
            speed: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Packet {
    x: i32,
    y: i32,
    pressure: i32,
    button_mask: u32,
    timestamp: Duration,
    finger_touching: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct HistoryRec {
    x: i32,
    y: i32,
    timestamp: Duration,
}

/// One touchpad device's transient pipeline state.
#[derive(Debug)]
pub struct TouchpadPipeline {
    limits: TouchpadLimits,
    config: TouchpadConfig,

    packet: Packet,
    sync_received: bool,

    last_x: i32,
    last_y: i32,
    last_finger_touching: bool,
    finger_latch: bool,

    tap_state: TapState,
    touch_on_x: i32,
    touch_on_y: i32,
    touch_on_edge: u8,

    history: [HistoryRec; HISTORY_LEN],
    history_index: i32,
    packet_count_move: i32,
    frac_x: f64,
    frac_y: f64,

    vert_scroll_on: bool,
    scroll_y: i32,
    scroll_packet_count: i32,
    autoscroll_yspd: f64,
    autoscroll_y: f64,
    autoscroll_armed: bool,
    current_scroll: ScrollDir,

    clickpad_button_down_x: i32,
    clickpad_pressed: bool,

    disabled: bool,
}

impl TouchpadPipeline {
    pub fn new(mut limits: TouchpadLimits, config: TouchpadConfig) -> Self {
        limits.apply_config_speed(config.speed);
        Self {
            packet: Packet {
                x: limits.no_x,
                y: limits.no_y,
                pressure: limits.no_pressure,
                ..Packet::default()
            },
            sync_received: true,
            last_x: 0,
            last_y: 0,
            last_finger_touching: false,
            finger_latch: false,
            tap_state: TapState::Start,
            touch_on_x: 0,
            touch_on_y: 0,
            touch_on_edge: NO_EDGE,
            history: [HistoryRec::default(); HISTORY_LEN],
            history_index: -1,
            packet_count_move: 0,
            frac_x: 0.0,
            frac_y: 0.0,
            vert_scroll_on: false,
            scroll_y: 0,
            scroll_packet_count: 0,
            autoscroll_yspd: 0.0,
            autoscroll_y: 0.0,
            autoscroll_armed: false,
            current_scroll: ScrollDir::Down,
            clickpad_button_down_x: -1,
            clickpad_pressed: false,
            disabled: false,
            limits,
            config,
        }
    }

    /// Replaces the configuration (tap/scroll toggles, speed).
    pub fn set_config(&mut self, config: TouchpadConfig) {
        self.config = config;
        self.limits.apply_config_speed(config.speed);
    }

    /// Disables everything but physical button clicks.
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    /// Re-enables the touchpad, resetting transient state.
    pub fn enable(&mut self) {
        let limits = self.limits.clone();
        let config = self.config;
        let disabled = false;
        *self = Self::new(limits, config);
        self.disabled = disabled;
    }

    pub fn toggle(&mut self) {
        if self.disabled {
            self.enable();
        } else {
            self.disable();
        }
    }

    /// Feeds one raw event; `now` is the event timestamp.
    pub fn handle_event(&mut self, ev: InputEvent, now: Duration) -> Vec<TouchpadOut> {
        if self.sync_received {
            self.packet = Packet {
                x: self.limits.no_x,
                y: self.limits.no_y,
                pressure: self.limits.no_pressure,
                ..Packet::default()
            };
            self.sync_received = false;
        }

        if ev.is_sync_report() {
            self.packet.timestamp = now;
            self.sync_received = true;
            return self.process_packet();
        }

        match ev.kind {
            EV_ABS => match ev.code {
                ABS_X | ABS_MT_POSITION_X => self.packet.x = ev.value,
                ABS_Y | ABS_MT_POSITION_Y => self.packet.y = ev.value,
                ABS_PRESSURE | 0x3a => self.packet.pressure = ev.value,
                _ => {}
            },
            EV_KEY => {
                if (BTN_LEFT..BTN_TASK).contains(&ev.code) {
                    let bitpair = u32::from(ev.code - BTN_LEFT) << 1;
                    let bit = bitpair + if ev.value != 0 { 0 } else { 1 };
                    self.packet.button_mask |= 1 << bit;
                }
            }
            _ => {}
        }
        Vec::new()
    }

    /// The deferred-tap timer fired: emit the pending single click.
    pub fn tap_timer_fired(&mut self) -> Vec<TouchpadOut> {
        let mut out = Vec::new();
        if self.tap_state == TapState::SingleTapPending {
            button_change(&mut out, BTN_LEFT, 1);
            button_change(&mut out, BTN_LEFT, 0);
            self.tap_state = TapState::Start;
        }
        out
    }

    /// The autoscroll timer fired: emit one scroll step and keep ticking.
    ///
    /// Some touchpads stop reporting once the finger stops moving even
    /// though it is still pressed, so the timer carries the scroll.
    pub fn autoscroll_tick(&mut self) -> Vec<TouchpadOut> {
        let mut out = Vec::new();
        if self.autoscroll_armed {
            scroll(&mut out, self.current_scroll);
            out.push(TouchpadOut::ArmAutoscroll);
        }
        out
    }

    // ── Packet processing ─────────────────────────────────────────────────────

    fn process_packet(&mut self) -> Vec<TouchpadOut> {
        let mut out = Vec::new();

        if !self.limits.is_clickpad {
            self.emit_button_clicks(&mut out);
        }

        // A disabled touchpad still delivers physical clicks.
        if self.disabled {
            return out;
        }

        let x_value = if self.packet.x == self.limits.no_x {
            self.last_x
        } else {
            self.packet.x
        };
        let y_value = if self.packet.y == self.limits.no_y {
            self.last_y
        } else {
            self.packet.y
        };

        let edge = self.limits.detect_edge(x_value, y_value);
        self.packet.finger_touching = self.detect_finger();

        if self.limits.is_clickpad {
            self.handle_clickpad(&mut out, edge);
        }

        self.handle_taps(&mut out);
        self.handle_scrolling(&mut out, edge);

        let (dx, dy) = self.compute_deltas();

        if dx != 0 || dy != 0 {
            // No pointer motion while a clickpad press is held on the
            // bottom edge, the finger there is operating the button.
            if !(self.clickpad_pressed && edge & BOTTOM_EDGE != 0) {
                relative_move(&mut out, dx, dy);
            }
        }

        self.last_finger_touching = self.packet.finger_touching;
        if self.packet.x != self.limits.no_x {
            self.last_x = self.packet.x;
        }
        if self.packet.y != self.limits.no_y {
            self.last_y = self.packet.y;
        }

        out
    }

    fn detect_finger(&mut self) -> bool {
        let range = (self.limits.max_pressure - self.limits.min_pressure) as f64;
        let pressure = self.packet.pressure;

        if pressure == self.limits.no_pressure {
            return self.finger_latch;
        }

        if !self.finger_latch {
            if (pressure as f64) > self.limits.min_pressure as f64 + range * PRESSURE_UP_MULT {
                self.finger_latch = true;
            }
        } else if (pressure as f64) < self.limits.min_pressure as f64 + range * PRESSURE_DOWN_MULT
        {
            self.finger_latch = false;
        }
        self.finger_latch
    }

    fn emit_button_clicks(&mut self, out: &mut Vec<TouchpadOut>) {
        for button in 0..NUM_BUTTONS {
            let bitpair = u32::from(button) << 1;
            if self.packet.button_mask & (1 << bitpair) != 0 {
                button_change(out, BTN_LEFT + button, 1);
            }
            if self.packet.button_mask & (1 << (bitpair + 1)) != 0 {
                button_change(out, BTN_LEFT + button, 0);
            }
        }
    }

    fn handle_clickpad(&mut self, out: &mut Vec<TouchpadOut>, edge: u8) {
        if edge & BOTTOM_EDGE != 0 {
            // The clickpad reports only a left button; fake the right
            // button from the touch position within the click strip.
            if self.packet.button_mask & LEFT_DOWN != 0 {
                self.clickpad_pressed = true;
                self.clickpad_button_down_x = if self.packet.x != self.limits.no_x {
                    self.packet.x
                } else {
                    self.last_x
                };
                if self.clickpad_button_down_x > self.limits.clickpad_left_button_max_x {
                    self.packet.button_mask = RIGHT_DOWN;
                }
            } else if self.packet.button_mask & LEFT_UP != 0 {
                self.clickpad_pressed = false;
                if self.clickpad_button_down_x > self.limits.clickpad_left_button_max_x {
                    self.packet.button_mask = RIGHT_UP;
                }
                self.clickpad_button_down_x = -1;
            }

            self.emit_button_clicks(out);
        }
    }

    // ── Tap state machine ─────────────────────────────────────────────────────

    fn handle_taps(&mut self, out: &mut Vec<TouchpadOut>) {
        let touch = self.packet.finger_touching && !self.last_finger_touching;
        let release = !self.packet.finger_touching && self.last_finger_touching;

        let mut moved = false;
        if self.packet.finger_touching && !touch {
            let moved_x = self.packet.x != self.limits.no_x
                && (self.packet.x - self.touch_on_x).abs() >= self.limits.tap_move;
            let moved_y = self.packet.y != self.limits.no_y
                && (self.packet.y - self.touch_on_y).abs() >= self.limits.tap_move;
            moved = moved_x || moved_y;
        }

        if touch {
            self.touch_on_x = if self.packet.x != self.limits.no_x {
                self.packet.x
            } else {
                self.last_x
            };
            self.touch_on_y = if self.packet.y != self.limits.no_y {
                self.packet.y
            } else {
                self.last_y
            };
            self.touch_on_edge = self.limits.detect_edge(self.touch_on_x, self.touch_on_y);
        }

        let tap_allowed = self.config.tap_to_click_enabled
            && !(self.limits.is_clickpad && self.touch_on_edge & BOTTOM_EDGE != 0);

        match self.tap_state {
            TapState::Start => {
                if touch {
                    self.tap_state = TapState::Touch;
                }
                self.frac_x = 0.0;
                self.frac_y = 0.0;
            }
            TapState::Touch => {
                if moved {
                    self.tap_state = TapState::Move;
                } else if release {
                    self.tap_state = TapState::Start;
                    if tap_allowed {
                        // Defer the click: sending it now would make a
                        // double-tap-and-drag read as a double click.
                        out.push(TouchpadOut::ArmTapTimer);
                        self.tap_state = TapState::SingleTapPending;
                    }
                }
            }
            TapState::Move => {
                if release {
                    self.tap_state = TapState::Start;
                }
            }
            TapState::SingleTapPending => {
                if touch {
                    out.push(TouchpadOut::CancelTapTimer);
                    if tap_allowed {
                        self.tap_state = TapState::PossibleDrag;
                    } else {
                        button_change(out, BTN_LEFT, 1);
                        button_change(out, BTN_LEFT, 0);
                        self.tap_state = TapState::Touch;
                    }
                }
                self.frac_x = 0.0;
                self.frac_y = 0.0;
            }
            TapState::PossibleDrag => {
                if moved {
                    button_change(out, BTN_LEFT, 1);
                    self.tap_state = TapState::Drag;
                } else if release {
                    // Just a double tap: two full clicks.
                    self.tap_state = TapState::Start;
                    button_change(out, BTN_LEFT, 1);
                    button_change(out, BTN_LEFT, 0);
                    button_change(out, BTN_LEFT, 1);
                    button_change(out, BTN_LEFT, 0);
                }
            }
            TapState::Drag => {
                if release {
                    self.tap_state = TapState::Start;
                    button_change(out, BTN_LEFT, 0);
                }
            }
        }
    }

    // ── Scrolling ─────────────────────────────────────────────────────────────

    fn handle_scrolling(&mut self, out: &mut Vec<TouchpadOut>, edge: u8) {
        if !self.config.scrolling_enabled {
            return;
        }

        let y_value = if self.packet.y == self.limits.no_y {
            self.last_y
        } else {
            self.packet.y
        };

        let mut up = 0;
        let mut down = 0;

        // Push the autoscroll deadline back whenever real packets flow.
        if self.autoscroll_armed {
            out.push(TouchpadOut::ArmAutoscroll);
        }

        let touch = self.packet.finger_touching && !self.last_finger_touching;
        if touch {
            self.stop_corner_scrolling();
            if edge & RIGHT_EDGE != 0 {
                self.vert_scroll_on = true;
                self.scroll_y = y_value;
            }
        }

        if self.vert_scroll_on && (edge & RIGHT_EDGE == 0 || !self.packet.finger_touching) {
            self.vert_scroll_on = false;
        }

        let is_corner = edge & RIGHT_EDGE != 0 && edge & (TOP_EDGE | BOTTOM_EDGE) != 0;

        if self.autoscroll_yspd != 0.0 && (!self.packet.finger_touching || !is_corner) {
            self.stop_corner_scrolling();
        }

        if (!self.packet.finger_touching || !is_corner) && self.autoscroll_armed {
            self.autoscroll_armed = false;
            out.push(TouchpadOut::CancelAutoscroll);
        }

        if self.vert_scroll_on && is_corner && self.autoscroll_yspd == 0.0 {
            self.start_corner_scrolling(out, y_value);
        }

        if self.vert_scroll_on {
            self.scroll_packet_count += 1;

            let delta = self.limits.scroll_dist_vert;
            if delta > 0 {
                while y_value - self.scroll_y > delta {
                    down += 1;
                    self.scroll_y += delta;
                }
                while y_value - self.scroll_y < -delta {
                    up += 1;
                    self.scroll_y -= delta;
                }
            }
        }

        if self.autoscroll_yspd != 0.0 {
            let dsecs = self
                .packet
                .timestamp
                .saturating_sub(self.hist(0).timestamp)
                .as_secs_f64();

            // Past the repeat interval the timer has already produced the
            // step; do not double it.
            if dsecs < AUTOSCROLL_INTERVAL.as_secs_f64() {
                self.autoscroll_y += self.autoscroll_yspd * dsecs;
                while self.autoscroll_y > 1.0 {
                    down += 1;
                    self.autoscroll_y -= 1.0;
                }
                while self.autoscroll_y < -1.0 {
                    up += 1;
                    self.autoscroll_y += 1.0;
                }
            }
        }

        for _ in 0..up {
            scroll(out, ScrollDir::Up);
        }
        for _ in 0..down {
            scroll(out, ScrollDir::Down);
        }
    }

    fn start_corner_scrolling(&mut self, out: &mut Vec<TouchpadOut>, y_value: i32) {
        self.autoscroll_y = 0.0;

        // Only engage when the corner was reached while scrolling, not when
        // the scroll started in the corner.
        if self.scroll_packet_count > 3 {
            let delta = self.limits.scroll_dist_vert as f64;
            let elapsed = self
                .hist(0)
                .timestamp
                .saturating_sub(self.hist(3).timestamp)
                .as_secs_f64();
            let dy = (self.hist(0).y - self.hist(3).y) as f64;
            if elapsed > 0.0 && delta > 0.0 {
                self.autoscroll_yspd = (dy / elapsed) / delta;
                self.autoscroll_y = (y_value - self.scroll_y) as f64 / delta;
            }

            self.autoscroll_armed = true;
            out.push(TouchpadOut::ArmAutoscroll);

            self.current_scroll = if y_value < self.scroll_y {
                ScrollDir::Up
            } else {
                ScrollDir::Down
            };
        }

        self.scroll_packet_count = 0;
    }

    fn stop_corner_scrolling(&mut self) {
        self.autoscroll_yspd = 0.0;
        self.scroll_packet_count = 0;
    }

    // ── Pointer deltas ────────────────────────────────────────────────────────

    fn hist(&self, back: i32) -> HistoryRec {
        let len = HISTORY_LEN as i32;
        let idx = ((self.history_index - back) % len + len) % len;
        self.history[idx as usize]
    }

    fn compute_deltas(&mut self) -> (i32, i32) {
        let x_value = if self.packet.x == self.limits.no_x {
            self.last_x
        } else {
            self.packet.x
        };
        let y_value = if self.packet.y == self.limits.no_y {
            self.last_y
        } else {
            self.packet.y
        };

        let mut dx = 0.0;
        let mut dy = 0.0;

        let moving = matches!(self.tap_state, TapState::Move | TapState::Drag);
        if moving && !self.vert_scroll_on {
            self.packet_count_move += 1;

            if self.packet_count_move > MIN_PACKET_COUNT_MOVE {
                dx = estimate_delta(
                    x_value as f64,
                    self.hist(0).x as f64,
                    self.hist(1).x as f64,
                    self.hist(2).x as f64,
                );
                dy = estimate_delta(
                    y_value as f64,
                    self.hist(0).y as f64,
                    self.hist(1).y as f64,
                    self.hist(2).y as f64,
                );
            } else if self.packet_count_move > 1 {
                dx = (x_value - self.hist(0).x) as f64 * 0.4;
                dy = (y_value - self.hist(0).y) as f64 * 0.4;
            }

            dx = dx * self.limits.speed + self.frac_x;
            self.frac_x = dx.fract();
            dx = dx.trunc();

            dy = dy * self.limits.speed + self.frac_y;
            self.frac_y = dy.fract();
            dy = dy.trunc();
        } else {
            self.packet_count_move = 0;
        }

        let idx = ((self.history_index + 1) % HISTORY_LEN as i32) as usize;
        self.history[idx] = HistoryRec {
            x: x_value,
            y: y_value,
            timestamp: self.packet.timestamp,
        };
        self.history_index = idx as i32;

        (dx as i32, dy as i32)
    }
}

fn estimate_delta(x0: f64, x1: f64, x2: f64, x3: f64) -> f64 {
    x0 * 0.3 + x1 * 0.1 - x2 * 0.1 - x3 * 0.3
}

fn button_change(out: &mut Vec<TouchpadOut>, code: u16, value: i32) {
    out.push(TouchpadOut::Event(InputEvent::key(code, value)));
    out.push(TouchpadOut::Event(InputEvent::sync()));
}

fn relative_move(out: &mut Vec<TouchpadOut>, dx: i32, dy: i32) {
    if dx != 0 {
        out.push(TouchpadOut::Event(InputEvent::rel(REL_X, dx)));
    }
    if dy != 0 {
        out.push(TouchpadOut::Event(InputEvent::rel(REL_Y, dy)));
    }
    if dx != 0 || dy != 0 {
        out.push(TouchpadOut::Event(InputEvent::sync()));
    }
}

fn scroll(out: &mut Vec<TouchpadOut>, dir: ScrollDir) {
    let value = match dir {
        ScrollDir::Up => 1,
        ScrollDir::Down => -1,
    };
    out.push(TouchpadOut::Event(InputEvent::rel(REL_WHEEL, value)));
    out.push(TouchpadOut::Event(InputEvent::sync()));
}
