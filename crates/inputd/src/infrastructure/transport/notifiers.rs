//! Host-side notifier implementations for the display, credential, and
//! wake seams.
//!
//! The surrounding platform (display manager, authentication agent,
//! power management) is reached over channels this repository does not
//! ship.  These implementations log the calls and acknowledge them, so
//! the daemon is fully functional for routing while the platform glue
//! is supplied by the packaging layer.

use tracing::info;

use crate::application::engine::DomainWaker;
use crate::application::secure::{AuthField, CredentialSink, Credentials};
use crate::application::switcher::DisplayBackend;

/// Display backend that acknowledges every handover.
#[derive(Debug, Default)]
pub struct AckDisplay;

impl DisplayBackend for AckDisplay {
    fn set_visible(&mut self, domid: u32, force: bool) -> bool {
        info!(domid, force, "display surface handover");
        true
    }

    fn focus_changed(&mut self, lost: Option<u32>, gained: u32) {
        info!(?lost, gained, "input focus changed");
    }
}

/// Credential sink that logs dialog activity.  Submitted credentials are
/// dropped on the floor, never logged.
#[derive(Debug, Default)]
pub struct LoggingCredentials;

impl CredentialSink for LoggingCredentials {
    fn field_focused(&mut self, field: AuthField) {
        info!(?field, "auth field focused");
    }

    fn username_changed(&mut self, username: &str) {
        info!(chars = username.chars().count(), "auth username edited");
    }

    fn cancelled(&mut self, hide_window: bool) {
        info!(hide_window, "auth dialog cancelled");
    }

    fn submitted(&mut self, credentials: Credentials) {
        info!(
            user_chars = credentials.username.chars().count(),
            "credentials submitted"
        );
    }
}

/// Domain waker that records the wake request in the log.
#[derive(Debug, Default)]
pub struct LoggingWaker;

impl DomainWaker for LoggingWaker {
    fn wake(&mut self, domid: u32) {
        info!(domid, "waking domain from s3");
    }
}
