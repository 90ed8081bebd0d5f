//! Per-device-type normalization pipelines.
//!
//! Each physical device class carries its own transient state and exposes a
//! `handle_event` that turns one raw event into zero or more canonical
//! events ready for routing:
//!
//! - [`multitouch`] – flattens multi-contact touch streams into ordinary
//!   absolute motion plus synthetic left-button clicks, so touch-capable
//!   pointer devices behave like a single-touch mouse.
//! - [`touchpad`] – assembles per-sync packets and decodes taps, drags,
//!   edge scrolling, and pointer deltas from a PS/2-class touchpad.
//! - [`tablet`] – rescales digitizer coordinates into the canonical range
//!   and translates tool buttons into mouse buttons.
//!
//! The pipelines are pure: time-driven behavior is expressed as requested
//! timer operations and the caller owns the actual timers.

pub mod multitouch;
pub mod tablet;
pub mod touchpad;
