//! # input-core
//!
//! Shared library for guest-input containing the canonical event model,
//! device classification rules, per-device normalization pipelines, the
//! gesture recognizer, the key-chord binding matcher, and the wire codec
//! used by the event output transport.
//!
//! This crate is used by the `inputd` daemon and its integration tests.
//! It has zero dependencies on OS APIs, async runtimes, or sockets.
//!
//! # Architecture overview
//!
//! guest-input is the input core of a client-virtualization host: a single
//! daemon owns every physical keyboard, mouse, touchpad, and tablet, and
//! forwards each raw event to exactly one of several concurrently running
//! guest VMs ("domains").  Which domain receives an event depends on focus,
//! per-domain diversion rules, gestures, and the secure-input mode.
//!
//! This crate is the pure foundation.  It defines:
//!
//! - **`event`** – The canonical event vocabulary: an evdev-style
//!   (type, code, value) triple plus the code constants the engine uses.
//!
//! - **`geometry`** – Rectangles and the linear frame transform used to
//!   remap diverted pointer coordinates, plus the canonical absolute
//!   coordinate range shared by every absolute pointer path.
//!
//! - **`classify`** – Capability-based classification of a freshly opened
//!   event device into keyboard / mouse / touchpad / tablet / etc.
//!
//! - **`normalize`** – Per-device-type pipelines turning raw packets into
//!   the canonical stream: multitouch flattening, touchpad tap/scroll
//!   decoding, tablet rescaling.
//!
//! - **`gesture`** – The multi-finger swipe/cross automaton driving
//!   touch-based VM switching.
//!
//! - **`bindings`** – The sequential keycode-chord matcher behind Ctrl+N
//!   VM switching, with hold-to-force escalation.
//!
//! - **`wire`** – The binary frame format used to hand finished events to
//!   a backend transport.

pub mod bindings;
pub mod classify;
pub mod event;
pub mod geometry;
pub mod gesture;
pub mod normalize;
pub mod wire;

// Re-export the most-used types at the crate root so callers can write
// `input_core::InputEvent` instead of `input_core::event::InputEvent`.
pub use bindings::{BindingSet, FORCE_HOLD_TICKS};
pub use classify::{classify, DeviceCaps, DeviceClass, TabletKind};
pub use event::{codes, InputEvent, KEY_STATUS_SIZE};
pub use geometry::{clamp_abs, FrameTransform, GeometryError, Rect, ABS_RANGE_MAX, ABS_RANGE_MIN};
pub use gesture::{FeedOutcome, GestureAction, GestureTracker, RunState, Touch};
pub use wire::{decode_frame, encode_frame, WireError, WireFrame, FRAME_SIZE};
