//! Configuration persistence.

pub mod config;
pub mod settings;
