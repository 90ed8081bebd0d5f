//! Outbound plumbing: event delivery, display handover, and the
//! credential/wake notifiers.
//!
//! The engine only ever talks to the traits defined in the application
//! layer; this module supplies the production implementations and the
//! recording doubles the integration tests use.
//!
//! Event delivery is deliberately lossy.  A guest backend that stalls or
//! disappears must never stall input for every other guest, so a failed
//! write is logged, the frame is dropped, and the receiver is told about
//! the gap with a `SYN_DROPPED` marker once it is reachable again.

pub mod notifiers;
pub mod recording;
pub mod socket;
