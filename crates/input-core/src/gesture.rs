//! Multi-finger gesture recognition for touch-based VM switching.
//!
//! The recognizer is a set of small sequential automata, one per gesture,
//! fed with per-finger contact / release / move reports in canonical
//! coordinates.  Each gesture is a list of phases; each phase is a list of
//! steps (contact or release in a named screen zone) plus an allowed
//! movement direction between steps.  A report that matches the current
//! step advances the automaton; a mismatch resets it to the start.
//!
//! Recognized gestures:
//!
//! - two-finger drag from the right zone to the left zone – switch to the
//!   next domain on the right;
//! - two-finger drag from the left zone to the right zone – switch to the
//!   next domain on the left;
//! - two-finger drag from the bottom zone to the top zone – bring up the
//!   UI domain;
//! - single-finger diagonal cross (either direction) – toggle stand-back
//!   mode, which disables every gesture except the cross itself so a guest
//!   can receive raw touches undisturbed.
//!
//! While any automaton is partially matched the caller is told to hold
//! back ("silence") the touch events, so a half-made gesture does not leak
//! clicks into the focused guest.

use tracing::info;

use crate::geometry::ABS_RANGE_MAX;

const SCREEN_X: i32 = ABS_RANGE_MAX;
const SCREEN_Y: i32 = ABS_RANGE_MAX;

const LEFT_X: i32 = SCREEN_X / 4;
const RIGHT_X: i32 = 3 * SCREEN_X / 4;
const MIDDLE_X: i32 = SCREEN_X / 2;

const TOP_Y: i32 = SCREEN_Y / 3;
const BOTTOM_Y: i32 = 2 * SCREEN_Y / 3;
const MIDDLE_Y: i32 = SCREEN_Y / 2;

// How far from the centerline a finger may stray and still count as
// "close to the middle".
const DELTA_X: i32 = SCREEN_X / 5;
const DELTA_Y: i32 = SCREEN_Y / 5;

/// Maximum number of tracked fingers.
pub const NUM_FINGERS: usize = 3;

/// Minimum displacement before a move report is direction-checked.
const MIN_DIST: i32 = SCREEN_X / 50;

/// What a recognized gesture asks the daemon to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureAction {
    /// Focus the next domain to the left.
    SwitchLeft,
    /// Focus the next domain to the right.
    SwitchRight,
    /// Bring the UI domain to the foreground.
    ShowUi,
    /// Stand-back mode toggled.
    StandBack,
}

/// Recognizer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Startup,
    Running,
    /// Only the cross gesture is matched; everything else passes through.
    StandBack,
}

/// One finger report fed to the recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    Contact,
    Release,
    Move,
}

/// Result of feeding one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedOutcome {
    /// Action to perform if a gesture completed on this report.
    pub action: Option<GestureAction>,
    /// Non-zero while at least one automaton is partially matched; the
    /// caller should silence the underlying touch events.
    pub tracking: i32,
}

// ── Gesture tables ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    Left,
    Right,
    Top,
    Bottom,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    /// Resolved from the enclosing phase.
    Start,
    End,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Motion {
    Unchecked,
    DontMove,
    LeftOnly,
    RightOnly,
    UpOnly,
    LeftDown,
    RightDown,
    /// Resolved from the enclosing phase.
    FromPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Contact,
    Release,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    kind: StepKind,
    zone: Zone,
    motion: Motion,
}

#[derive(Debug, Clone, Copy)]
struct Phase {
    steps: &'static [Step],
    start_zone: Zone,
    end_zone: Zone,
    motion: Motion,
}

#[derive(Debug, Clone, Copy)]
struct GestureDef {
    name: &'static str,
    phases: &'static [Phase],
    action: GestureAction,
}

// A single finger touching in the start zone and lifting in the end zone,
// having moved only in the phase's direction.
const SINGLE_DRAG: &[Step] = &[
    Step { kind: StepKind::Contact, zone: Zone::Start, motion: Motion::Unchecked },
    Step { kind: StepKind::Release, zone: Zone::End, motion: Motion::FromPhase },
];

// Two fingers down in the start zone, both lifted in the end zone after
// moving in the phase's direction.
const TWO_DRAG: &[Step] = &[
    Step { kind: StepKind::Contact, zone: Zone::Start, motion: Motion::Unchecked },
    Step { kind: StepKind::Contact, zone: Zone::Start, motion: Motion::Unchecked },
    Step { kind: StepKind::Release, zone: Zone::End, motion: Motion::FromPhase },
    Step { kind: StepKind::Release, zone: Zone::End, motion: Motion::FromPhase },
];

const GO_LEFT: GestureDef = GestureDef {
    name: "GoLeft",
    phases: &[Phase {
        steps: TWO_DRAG,
        start_zone: Zone::Right,
        end_zone: Zone::Left,
        motion: Motion::LeftOnly,
    }],
    // Dragging toward the left edge pulls in the domain on the right.
    action: GestureAction::SwitchRight,
};

const GO_RIGHT: GestureDef = GestureDef {
    name: "GoRight",
    phases: &[Phase {
        steps: TWO_DRAG,
        start_zone: Zone::Left,
        end_zone: Zone::Right,
        motion: Motion::RightOnly,
    }],
    action: GestureAction::SwitchLeft,
};

const GO_UP: GestureDef = GestureDef {
    name: "GoUp",
    phases: &[Phase {
        steps: TWO_DRAG,
        start_zone: Zone::Bottom,
        end_zone: Zone::Top,
        motion: Motion::UpOnly,
    }],
    action: GestureAction::ShowUi,
};

// An X drawn with one finger: top-left to bottom-right, then top-right to
// bottom-left.
const CROSS_L: GestureDef = GestureDef {
    name: "CrossL",
    phases: &[
        Phase {
            steps: SINGLE_DRAG,
            start_zone: Zone::TopLeft,
            end_zone: Zone::BottomRight,
            motion: Motion::RightDown,
        },
        Phase {
            steps: SINGLE_DRAG,
            start_zone: Zone::TopRight,
            end_zone: Zone::BottomLeft,
            motion: Motion::LeftDown,
        },
    ],
    action: GestureAction::StandBack,
};

const CROSS_R: GestureDef = GestureDef {
    name: "CrossR",
    phases: &[
        Phase {
            steps: SINGLE_DRAG,
            start_zone: Zone::TopRight,
            end_zone: Zone::BottomLeft,
            motion: Motion::LeftDown,
        },
        Phase {
            steps: SINGLE_DRAG,
            start_zone: Zone::TopLeft,
            end_zone: Zone::BottomRight,
            motion: Motion::RightDown,
        },
    ],
    action: GestureAction::StandBack,
};

const ALL_GESTURES: &[GestureDef] = &[GO_LEFT, GO_RIGHT, GO_UP, CROSS_L, CROSS_R];
const STANDBACK_GESTURES: &[GestureDef] = &[CROSS_L, CROSS_R];

fn zone_match(zone: Zone, x: i32, y: i32) -> bool {
    match zone {
        Zone::Left => x < LEFT_X && y < MIDDLE_Y + DELTA_Y && y > MIDDLE_Y - DELTA_Y,
        Zone::Right => x > RIGHT_X && y < MIDDLE_Y + DELTA_Y && y > MIDDLE_Y - DELTA_Y,
        Zone::Top => y < TOP_Y && x < MIDDLE_X + DELTA_X && x > MIDDLE_X - DELTA_X,
        Zone::Bottom => y > BOTTOM_Y && x < MIDDLE_X + DELTA_X && x > MIDDLE_X - DELTA_X,
        Zone::TopLeft => x < LEFT_X && y < TOP_Y,
        Zone::TopRight => x > RIGHT_X && y < TOP_Y,
        Zone::BottomLeft => x < LEFT_X && y > BOTTOM_Y,
        Zone::BottomRight => x > RIGHT_X && y > BOTTOM_Y,
        Zone::Any => true,
        Zone::Start | Zone::End => false,
    }
}

// ── Tracker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct FingerPos {
    last_x: i32,
    last_y: i32,
}

#[derive(Debug, Clone, Copy, Default)]
struct GestureState {
    phase: usize,
    step: usize,
}

/// The gesture recognizer: per-gesture automaton cursors plus the shared
/// last-seen finger positions.
#[derive(Debug)]
pub struct GestureTracker {
    runstate: RunState,
    states: [GestureState; ALL_GESTURES.len()],
    fingers: [FingerPos; NUM_FINGERS],
}

impl Default for GestureTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GestureTracker {
    pub fn new() -> Self {
        Self {
            runstate: RunState::Startup,
            states: [GestureState::default(); ALL_GESTURES.len()],
            fingers: [FingerPos::default(); NUM_FINGERS],
        }
    }

    pub fn runstate(&self) -> RunState {
        self.runstate
    }

    /// Feeds one finger report.
    ///
    /// `slot` is the finger index (0-based, at most [`NUM_FINGERS`]);
    /// coordinates are canonical.
    pub fn feed(&mut self, slot: usize, x: i32, y: i32, touch: Touch) -> FeedOutcome {
        if slot >= NUM_FINGERS {
            return FeedOutcome { action: None, tracking: 0 };
        }

        if self.runstate == RunState::Startup {
            self.reset_all();
            self.runstate = RunState::Running;
        }

        let candidates: &[usize] = if self.runstate == RunState::StandBack {
            // Only the cross can bring us back; index into ALL_GESTURES.
            &[3, 4]
        } else {
            &[0, 1, 2, 3, 4]
        };
        debug_assert_eq!(STANDBACK_GESTURES.len(), 2);

        let mut tracking = 0;
        for &gi in candidates {
            let matched = match touch {
                Touch::Move => self.match_move(gi, slot, x, y, &mut tracking),
                _ => self.match_step(gi, slot, x, y, touch, &mut tracking),
            };
            if matched {
                self.reset_all();
                let action = self.apply(ALL_GESTURES[gi].action);
                return FeedOutcome { action: Some(action), tracking: 0 };
            }
        }

        FeedOutcome { action: None, tracking }
    }

    /// Forgets all partial matches, e.g. after a device goes away.
    pub fn reset(&mut self) {
        self.reset_all();
    }

    fn reset_all(&mut self) {
        for s in &mut self.states {
            *s = GestureState::default();
        }
    }

    fn apply(&mut self, action: GestureAction) -> GestureAction {
        if action == GestureAction::StandBack {
            match self.runstate {
                RunState::Running => {
                    self.runstate = RunState::StandBack;
                    info!("standing back");
                }
                RunState::StandBack => {
                    self.runstate = RunState::Running;
                    info!("standing forward");
                }
                RunState::Startup => {}
            }
        }
        action
    }

    fn resolve_zone(zone: Zone, phase: &Phase) -> Zone {
        match zone {
            Zone::Start => phase.start_zone,
            Zone::End => phase.end_zone,
            other => other,
        }
    }

    fn resolve_motion(motion: Motion, phase: &Phase) -> Motion {
        match motion {
            Motion::FromPhase => phase.motion,
            other => other,
        }
    }

    fn match_step(
        &mut self,
        gi: usize,
        slot: usize,
        x: i32,
        y: i32,
        touch: Touch,
        tracking: &mut i32,
    ) -> bool {
        let def = &ALL_GESTURES[gi];
        let state = &mut self.states[gi];
        let phase = &def.phases[state.phase];
        let step = &phase.steps[state.step];

        let zone = Self::resolve_zone(step.zone, phase);
        let success = match step.kind {
            StepKind::Contact => touch == Touch::Contact && zone_match(zone, x, y),
            StepKind::Release => touch == Touch::Release && zone_match(zone, x, y),
        };

        if success {
            state.step += 1;
            self.fingers[slot] = FingerPos { last_x: x, last_y: y };
        } else if state.step > 0 || state.phase > 0 {
            *state = GestureState::default();
        }

        let state = &mut self.states[gi];
        if state.step == def.phases[state.phase].steps.len() {
            state.phase += 1;
            state.step = 0;
            if state.phase == def.phases.len() {
                *state = GestureState::default();
                return true;
            }
        }

        if state.step > 1 || state.phase > 0 {
            *tracking += 1;
        }
        false
    }

    fn match_move(&mut self, gi: usize, slot: usize, x: i32, y: i32, tracking: &mut i32) -> bool {
        let def = &ALL_GESTURES[gi];
        let state = &mut self.states[gi];

        if state.phase == 0 && state.step == 0 {
            return false;
        }

        let phase = &def.phases[state.phase];
        let step = &phase.steps[state.step];

        let dx = x - self.fingers[slot].last_x;
        let dy = y - self.fingers[slot].last_y;

        let checked = dx.abs() >= MIN_DIST || dy.abs() >= MIN_DIST;
        let motion = Self::resolve_motion(step.motion, phase);

        if checked && motion != Motion::Unchecked {
            let fail = match motion {
                Motion::DontMove => true,
                Motion::LeftOnly => dx > 0 || -dx < dy.abs(),
                Motion::RightOnly => dx < 0 || dx < dy.abs(),
                Motion::UpOnly => dy > 0 || -dy < dx.abs(),
                Motion::LeftDown => dx > 0 || dy < 0,
                Motion::RightDown => dx < 0 || dy < 0,
                Motion::Unchecked | Motion::FromPhase => false,
            };

            if fail {
                *state = GestureState::default();
                return false;
            }
            self.fingers[slot] = FingerPos { last_x: x, last_y: y };
        }

        if state.step > 1 || state.phase > 0 {
            *tracking += 1;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MID: i32 = MIDDLE_Y;

    fn feed_two_drag(
        tracker: &mut GestureTracker,
        from: (i32, i32),
        to: (i32, i32),
    ) -> Option<GestureAction> {
        // Two contacts at the start zone.
        tracker.feed(0, from.0, from.1, Touch::Contact);
        tracker.feed(1, from.0, from.1, Touch::Contact);
        // Two releases at the end zone.
        tracker.feed(0, to.0, to.1, Touch::Release);
        tracker.feed(1, to.0, to.1, Touch::Release).action
    }

    #[test]
    fn test_two_finger_drag_right_to_left_switches_right() {
        let mut tracker = GestureTracker::new();
        let action = feed_two_drag(&mut tracker, (SCREEN_X - 100, MID), (100, MID));
        assert_eq!(action, Some(GestureAction::SwitchRight));
    }

    #[test]
    fn test_two_finger_drag_left_to_right_switches_left() {
        let mut tracker = GestureTracker::new();
        let action = feed_two_drag(&mut tracker, (100, MID), (SCREEN_X - 100, MID));
        assert_eq!(action, Some(GestureAction::SwitchLeft));
    }

    #[test]
    fn test_two_finger_drag_bottom_to_top_shows_ui() {
        let mut tracker = GestureTracker::new();
        let action = feed_two_drag(&mut tracker, (MIDDLE_X, SCREEN_Y - 100), (MIDDLE_X, 100));
        assert_eq!(action, Some(GestureAction::ShowUi));
    }

    #[test]
    fn test_partial_match_reports_tracking() {
        let mut tracker = GestureTracker::new();
        tracker.feed(0, SCREEN_X - 100, MID, Touch::Contact);
        let out = tracker.feed(1, SCREEN_X - 100, MID, Touch::Contact);
        assert!(out.tracking > 0, "half a gesture should silence touches");
    }

    #[test]
    fn test_mismatch_resets_automaton() {
        let mut tracker = GestureTracker::new();
        tracker.feed(0, SCREEN_X - 100, MID, Touch::Contact);
        tracker.feed(1, SCREEN_X - 100, MID, Touch::Contact);
        // Release in the middle of the screen: matches no end zone.
        let out = tracker.feed(0, MIDDLE_X, MID, Touch::Release);
        assert_eq!(out.tracking, 0);
        assert!(out.action.is_none());
    }

    #[test]
    fn test_wrong_direction_move_resets() {
        let mut tracker = GestureTracker::new();
        tracker.feed(0, SCREEN_X - 100, MID, Touch::Contact);
        tracker.feed(1, SCREEN_X - 100, MID, Touch::Contact);
        // GoLeft expects leftward movement; move right by more than MIN_DIST.
        tracker.feed(0, SCREEN_X - 100 + 2 * MIN_DIST, MID, Touch::Move);
        // Completing the drag now does nothing.
        tracker.feed(0, 100, MID, Touch::Release);
        let out = tracker.feed(1, 100, MID, Touch::Release);
        assert!(out.action.is_none());
    }

    #[test]
    fn test_small_jitter_does_not_reset() {
        let mut tracker = GestureTracker::new();
        tracker.feed(0, SCREEN_X - 100, MID, Touch::Contact);
        tracker.feed(1, SCREEN_X - 100, MID, Touch::Contact);
        // Displacement below MIN_DIST is ignored even against the grain.
        tracker.feed(0, SCREEN_X - 100 + MIN_DIST / 2, MID, Touch::Move);
        tracker.feed(0, 100, MID, Touch::Release);
        let out = tracker.feed(1, 100, MID, Touch::Release);
        assert_eq!(out.action, Some(GestureAction::SwitchRight));
    }

    fn draw_cross(tracker: &mut GestureTracker) -> Option<GestureAction> {
        // Stroke 1: top-left to bottom-right.
        tracker.feed(0, 100, 100, Touch::Contact);
        tracker.feed(0, SCREEN_X - 100, SCREEN_Y - 100, Touch::Release);
        // Stroke 2: top-right to bottom-left.
        tracker.feed(0, SCREEN_X - 100, 100, Touch::Contact);
        tracker
            .feed(0, 100, SCREEN_Y - 100, Touch::Release)
            .action
    }

    #[test]
    fn test_cross_toggles_standback() {
        let mut tracker = GestureTracker::new();

        assert_eq!(draw_cross(&mut tracker), Some(GestureAction::StandBack));
        assert_eq!(tracker.runstate(), RunState::StandBack);

        // Crossing again stands forward.
        assert_eq!(draw_cross(&mut tracker), Some(GestureAction::StandBack));
        assert_eq!(tracker.runstate(), RunState::Running);
    }

    #[test]
    fn test_standback_disables_switch_gestures() {
        let mut tracker = GestureTracker::new();
        draw_cross(&mut tracker);
        assert_eq!(tracker.runstate(), RunState::StandBack);

        let action = feed_two_drag(&mut tracker, (SCREEN_X - 100, MID), (100, MID));
        assert_eq!(action, None);
    }

    #[test]
    fn test_out_of_range_slot_is_ignored() {
        let mut tracker = GestureTracker::new();
        let out = tracker.feed(7, 100, 100, Touch::Contact);
        assert_eq!(out, FeedOutcome { action: None, tracking: 0 });
    }
}
