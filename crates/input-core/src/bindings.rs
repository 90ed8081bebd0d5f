//! Sequential keycode-chord matching.
//!
//! A binding is an ordered list of keycodes that must be pressed (and held)
//! in sequence, e.g. `[KEY_LEFTCTRL, KEY_RIGHTCTRL, KEY_1]`.  Each key-down
//! event advances every binding whose next expected code matches; any other
//! key-down sends that binding back to the start.  Any key-up resets all
//! bindings, so a chord must be built without releasing.
//!
//! A completed binding swallows the final keystroke and yields its tag.
//! Bindings may also carry a force tag: if the chord is held down across
//! more than [`FORCE_HOLD_TICKS`] periodic ticks, the force tag fires once.
//! This drives "hold the switch chord to force-switch away from a stuck
//! guest".
//!
//! The matcher is generic over the tag type; the daemon maps tags to
//! switcher and platform actions.

use crate::event::codes::EV_KEY;
use crate::event::InputEvent;

/// Number of ticks a completed chord must stay held before its force tag
/// fires.
pub const FORCE_HOLD_TICKS: u32 = 6;

#[derive(Debug)]
struct Binding<T> {
    sequence: Vec<u16>,
    tag: T,
    force_tag: Option<T>,
    matched: usize,
    down: bool,
    force_ticks: u32,
}

/// A set of key-chord bindings sharing one matcher state.
#[derive(Debug, Default)]
pub struct BindingSet<T> {
    bindings: Vec<Binding<T>>,
}

impl<T: Copy> BindingSet<T> {
    pub fn new() -> Self {
        Self { bindings: Vec::new() }
    }

    /// Registers a chord.  Tags are yielded from [`feed`](Self::feed) when
    /// the chord completes.
    pub fn add(&mut self, sequence: &[u16], tag: T) {
        self.add_with_force(sequence, tag, None);
    }

    /// Registers a chord with a hold-to-force escalation tag.
    pub fn add_with_force(&mut self, sequence: &[u16], tag: T, force_tag: Option<T>) {
        self.bindings.push(Binding {
            sequence: sequence.to_vec(),
            tag,
            force_tag,
            matched: 0,
            down: false,
            force_ticks: 0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Runs one event against the bindings.
    ///
    /// Returns `Some(tag)` when a chord completed; the caller should
    /// swallow the event.  Returns `None` otherwise.
    pub fn feed(&mut self, ev: InputEvent) -> Option<T> {
        if ev.kind != EV_KEY {
            return None;
        }

        if ev.value == 0 {
            // Releasing any key tears down every partial chord.
            for b in &mut self.bindings {
                b.down = false;
                b.matched = 0;
            }
            return None;
        }
        if ev.value != 1 {
            // Auto-repeats neither advance nor reset.
            return None;
        }

        let mut matched = None;
        for (i, b) in self.bindings.iter_mut().enumerate() {
            if b.sequence.get(b.matched) == Some(&ev.code) {
                b.matched += 1;
            } else {
                b.matched = 0;
            }

            if b.matched == b.sequence.len() {
                b.matched = 0;
                matched = Some(i);
            }
        }

        let i = matched?;
        self.bindings[i].down = true;
        Some(self.bindings[i].tag)
    }

    /// Periodic tick; returns the force tags of chords held long enough.
    pub fn tick(&mut self) -> Vec<T> {
        let mut fired = Vec::new();
        for b in &mut self.bindings {
            if b.down {
                b.force_ticks += 1;
            } else {
                b.force_ticks = 0;
            }

            if b.force_ticks > FORCE_HOLD_TICKS {
                if let Some(tag) = b.force_tag {
                    fired.push(tag);
                }
                b.force_ticks = 0;
                b.down = false;
            }
        }
        fired
    }
}
