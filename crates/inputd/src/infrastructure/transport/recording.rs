//! Recording doubles for the engine's outbound ports.
//!
//! Used by the integration tests to observe exactly what the engine
//! emitted, in order, without any real sockets or display plane.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use input_core::WireFrame;

use crate::application::engine::{DomainWaker, LedSink, OutputTransport, SettingsStore};
use crate::application::secure::{AuthField, CredentialSink, Credentials};
use crate::application::switcher::DisplayBackend;

/// [`OutputTransport`] that stores every delivered frame.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    frames: Arc<Mutex<Vec<WireFrame>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<WireFrame> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Frames addressed to one domain, in delivery order.
    pub fn frames_for(&self, domid: u32) -> Vec<WireFrame> {
        self.frames()
            .into_iter()
            .filter(|f| f.domid == domid)
            .collect()
    }
}

#[async_trait]
impl OutputTransport for RecordingTransport {
    async fn deliver(&mut self, frame: WireFrame) {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).push(frame);
    }
}

/// [`DisplayBackend`] that acknowledges and records handovers.
#[derive(Clone, Default)]
pub struct RecordingDisplay {
    shown: Arc<Mutex<Vec<(u32, bool)>>>,
    focus_changes: Arc<Mutex<Vec<(Option<u32>, u32)>>>,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<(u32, bool)> {
        self.shown.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn focus_changes(&self) -> Vec<(Option<u32>, u32)> {
        self.focus_changes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DisplayBackend for RecordingDisplay {
    fn set_visible(&mut self, domid: u32, force: bool) -> bool {
        self.shown.lock().unwrap_or_else(|e| e.into_inner()).push((domid, force));
        true
    }

    fn focus_changed(&mut self, lost: Option<u32>, gained: u32) {
        self.focus_changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((lost, gained));
    }
}

/// [`CredentialSink`] that records the dialog traffic.
#[derive(Clone, Default)]
pub struct RecordingCredentials {
    inner: Arc<Mutex<CredentialLog>>,
}

#[derive(Default)]
pub struct CredentialLog {
    pub focused: Vec<AuthField>,
    pub usernames: Vec<String>,
    pub cancels: Vec<bool>,
    pub submissions: Vec<Credentials>,
}

impl RecordingCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn focused(&self) -> Vec<AuthField> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).focused.clone()
    }

    pub fn submissions(&self) -> Vec<Credentials> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).submissions.clone()
    }

    pub fn cancels(&self) -> Vec<bool> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).cancels.clone()
    }
}

impl CredentialSink for RecordingCredentials {
    fn field_focused(&mut self, field: AuthField) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).focused.push(field);
    }

    fn username_changed(&mut self, username: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .usernames
            .push(username.to_string());
    }

    fn cancelled(&mut self, hide_window: bool) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).cancels.push(hide_window);
    }

    fn submitted(&mut self, credentials: Credentials) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .submissions
            .push(credentials);
    }
}

/// [`LedSink`] that records LED writes.
#[derive(Clone, Default)]
pub struct RecordingLeds {
    writes: Arc<Mutex<Vec<(u16, bool)>>>,
}

impl RecordingLeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<(u16, bool)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl LedSink for RecordingLeds {
    fn set_led(&mut self, led: u16, on: bool) {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).push((led, on));
    }
}

/// [`DomainWaker`] that records wake requests.
#[derive(Clone, Default)]
pub struct RecordingWaker {
    woken: Arc<Mutex<Vec<u32>>>,
}

impl RecordingWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn woken(&self) -> Vec<u32> {
        self.woken.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DomainWaker for RecordingWaker {
    fn wake(&mut self, domid: u32) {
        self.woken.lock().unwrap_or_else(|e| e.into_inner()).push(domid);
    }
}

/// [`SettingsStore`] that records writes instead of touching disk.
#[derive(Clone, Default)]
pub struct RecordingSettings {
    writes: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SettingsStore for RecordingSettings {
    fn write_setting(&mut self, path: &str, value: &str) {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((path.to_string(), value.to_string()));
    }
}
