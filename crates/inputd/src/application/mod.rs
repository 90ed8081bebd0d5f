//! Application layer use cases for the input daemon.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure business rules, here mostly in the `input-core` crate) and the
//! infrastructure (device files, sockets, config storage).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a user goal (e.g., "route this
//!   keystroke to the guest VM that currently owns the keyboard").
//! - **Depend on abstractions** (traits) rather than concrete implementations,
//!   so the infrastructure can be swapped without changing this code.
//! - **Contain no OS calls, no socket I/O, no file system access**.
//!
//! # Sub-modules
//!
//! - **`registry`** – The in-memory table of running guest domains and their
//!   per-domain input attributes.
//!
//! - **`divert`** – Per-domain input diversion descriptors: shortcut filters
//!   and mouse sub-frame forwarding set up by in-guest agents.
//!
//! - **`routing`** – The focus arbiter.  Decides, for every raw event, which
//!   domain receives it.  This is the most critical use case – it runs on
//!   every keystroke and mouse movement.
//!
//! - **`switcher`** – Orderly whole-focus switches between domains: slot
//!   chords, mouse edge switching, and the display handover.
//!
//! - **`focus_slots`** – The slot table and domain death bookkeeping that
//!   decides where focus lands when domains appear and disappear.
//!
//! - **`secure`** – The secure credential-entry mode that swallows keystrokes
//!   before any guest can see them.
//!
//! - **`control`** – The daemon's control surface: operations invoked by
//!   guest agents and the UI over the control channel.
//!
//! - **`engine`** – The event loop gluing devices, normalizers, bindings,
//!   the arbiter, and the transports together.

pub mod control;
pub mod divert;
pub mod engine;
pub mod focus_slots;
pub mod registry;
pub mod routing;
pub mod secure;
pub mod switcher;
