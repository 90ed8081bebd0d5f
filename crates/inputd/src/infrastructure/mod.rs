//! Infrastructure layer for the input daemon.
//!
//! Contains OS-facing adapters: evdev device discovery and reading, the
//! guest event transport, and file-system configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `input_core`, but MUST NOT be imported by the `application` layer.

pub mod devices;
pub mod storage;
pub mod transport;
