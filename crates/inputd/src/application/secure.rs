//! Secure credential entry.
//!
//! While secure mode is on and the UI VM is on screen, keystrokes are
//! swallowed by the daemon before any guest can observe them.  Characters
//! are collected into the focused authentication field; the UI VM only
//! ever sees blanked echo keys (so its login screen can render progress
//! dots) and the field-focus notifications it needs to highlight the
//! right control.
//!
//! The module is deliberately free of any authentication backend: finished
//! credentials are handed to a [`CredentialSink`] and the collected copies
//! are wiped.  Whoever implements the sink decides what a password is
//! worth.

use tracing::info;

use input_core::codes::*;
use input_core::InputEvent;

// ── Authentication context flags ──────────────────────────────────────────────

/// Lock screen: force focus back to the UI VM and keep chords disabled.
pub const AUTH_FLAG_LOCK: u32 = 1 << 0;
/// The dialog asks for the password twice.
pub const AUTH_FLAG_CONFIRM_PW: u32 = 1 << 1;
/// Setting a fresh local password.
pub const AUTH_FLAG_SET_LOCAL_PW: u32 = 1 << 2;
/// The user authenticates against a remote backend.
pub const AUTH_FLAG_REMOTE_USER: u32 = 1 << 3;
/// Escape must not dismiss the dialog.
pub const AUTH_FLAG_CANNOT_CANCEL: u32 = 1 << 4;
/// Setting the platform root password.
pub const AUTH_FLAG_SET_ROOT_PW: u32 = 1 << 5;
/// Changing an existing local password (asks for the previous one).
pub const AUTH_FLAG_CHANGE_LOCAL_PW: u32 = 1 << 6;
/// The context carries a user hash rather than a plain username.
pub const AUTH_FLAG_USER_HASH: u32 = 1 << 7;

/// The input fields of the credential dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthField {
    Username,
    Password,
    PasswordConfirm,
    PasswordPrevious,
}

/// Why and for whom credentials are being collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// User ID, or a user hash when [`AUTH_FLAG_USER_HASH`] is set.
    pub user: String,
    /// Session title shown by the dialog.
    pub title: String,
    pub flags: u32,
}

/// A completed credential entry, as typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub confirm: String,
    pub previous: String,
}

/// Consumer of collection progress and finished credentials.
///
/// The daemon's control transport implements this against the UI and the
/// authentication backend; tests record the calls.
pub trait CredentialSink {
    /// The focused field changed; the UI should move its highlight.
    fn field_focused(&mut self, field: AuthField);

    /// The username field content changed.
    fn username_changed(&mut self, username: &str);

    /// The user cancelled.  `hide_window` is false for dialogs that may
    /// not be dismissed.
    fn cancelled(&mut self, hide_window: bool);

    /// Enter was pressed; these are the collected credentials.
    fn submitted(&mut self, credentials: Credentials);
}

// ── Keymap ────────────────────────────────────────────────────────────────────

/// US-layout translation of a keycode, honouring shift.  `None` for keys
/// that produce no printable character.
pub fn keycode_to_char(code: u16, shift: bool) -> Option<char> {
    let pair: (char, char) = match code {
        KEY_1 => ('1', '!'),
        KEY_2 => ('2', '@'),
        KEY_3 => ('3', '#'),
        KEY_4 => ('4', '$'),
        KEY_5 => ('5', '%'),
        KEY_6 => ('6', '^'),
        KEY_7 => ('7', '&'),
        KEY_8 => ('8', '*'),
        KEY_9 => ('9', '('),
        KEY_0 => ('0', ')'),
        KEY_MINUS => ('-', '_'),
        KEY_EQUAL => ('=', '+'),
        KEY_Q => ('q', 'Q'),
        KEY_W => ('w', 'W'),
        KEY_E => ('e', 'E'),
        KEY_R => ('r', 'R'),
        KEY_T => ('t', 'T'),
        KEY_Y => ('y', 'Y'),
        KEY_U => ('u', 'U'),
        KEY_I => ('i', 'I'),
        KEY_O => ('o', 'O'),
        KEY_P => ('p', 'P'),
        KEY_LEFTBRACE => ('[', '{'),
        KEY_RIGHTBRACE => (']', '}'),
        KEY_A => ('a', 'A'),
        KEY_S => ('s', 'S'),
        KEY_D => ('d', 'D'),
        KEY_F => ('f', 'F'),
        KEY_G => ('g', 'G'),
        KEY_H => ('h', 'H'),
        KEY_J => ('j', 'J'),
        KEY_K => ('k', 'K'),
        KEY_L => ('l', 'L'),
        KEY_SEMICOLON => (';', ':'),
        KEY_APOSTROPHE => ('\'', '"'),
        KEY_GRAVE => ('`', '~'),
        KEY_BACKSLASH => ('\\', '|'),
        KEY_Z => ('z', 'Z'),
        KEY_X => ('x', 'X'),
        KEY_C => ('c', 'C'),
        KEY_V => ('v', 'V'),
        KEY_B => ('b', 'B'),
        KEY_N => ('n', 'N'),
        KEY_M => ('m', 'M'),
        KEY_COMMA => (',', '<'),
        KEY_DOT => ('.', '>'),
        KEY_SLASH => ('/', '?'),
        KEY_SPACE => (' ', ' '),
        _ => return None,
    };
    Some(if shift { pair.1 } else { pair.0 })
}

/// Overwrite before truncating so the plaintext does not linger in the
/// buffer.  NUL bytes keep the `String` valid UTF-8.
fn wipe(s: &mut String) {
    unsafe { s.as_bytes_mut().fill(0) };
    s.clear();
}

fn is_echo_modifier(code: u16) -> bool {
    matches!(
        code,
        KEY_LEFTSHIFT | KEY_RIGHTSHIFT | KEY_LEFTCTRL | KEY_RIGHTCTRL | KEY_LEFTALT | KEY_RIGHTALT
    )
}

// ── The collector ─────────────────────────────────────────────────────────────

/// Secure-mode state and the field collection machine.
pub struct SecureInput {
    secure_mode: bool,
    /// Collection stays off until the UI focuses its credential control,
    /// so early keystrokes cannot land in a field nobody is looking at.
    collect: bool,
    context: Option<AuthContext>,
    current_field: AuthField,
    /// Caret position in the focused field, in characters.
    cursor: usize,
    username: String,
    password: String,
    confirm: String,
    previous: String,
}

impl Default for SecureInput {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureInput {
    pub fn new() -> Self {
        Self {
            secure_mode: false,
            collect: false,
            context: None,
            current_field: AuthField::Password,
            cursor: 0,
            username: String::new(),
            password: String::new(),
            confirm: String::new(),
            previous: String::new(),
        }
    }

    // ── Context ───────────────────────────────────────────────────────────────

    pub fn set_context(&mut self, user: &str, title: &str, flags: u32) {
        info!(flags, "auth context set");
        self.context = Some(AuthContext {
            user: user.to_owned(),
            title: title.to_owned(),
            flags,
        });
    }

    pub fn clear_context(&mut self) {
        self.context = None;
    }

    pub fn context(&self) -> Option<&AuthContext> {
        self.context.as_ref()
    }

    pub fn auth_active(&self) -> bool {
        self.context.is_some()
    }

    fn flags(&self) -> u32 {
        self.context.as_ref().map_or(0, |c| c.flags)
    }

    /// True for the lock screen: chords stay disabled and focus is
    /// forced back to the UI VM.
    pub fn locked(&self) -> bool {
        self.flags() & AUTH_FLAG_LOCK != 0
    }

    pub fn secure_mode(&self) -> bool {
        self.secure_mode
    }

    pub fn current_field(&self) -> AuthField {
        self.current_field
    }

    // ── Mode transitions ──────────────────────────────────────────────────────

    /// Turns secure mode on or off.  Returns true when the state changed;
    /// the caller then shows or hides the dialog and, for lock contexts,
    /// arms the revert-to-auth timer.
    pub fn set_secure(&mut self, on: bool, sink: &mut dyn CredentialSink) -> bool {
        if on == self.secure_mode {
            return false;
        }
        self.secure_mode = on;
        self.reset_fields(sink);
        if on {
            // Collection starts only once the UI reports its control is
            // focused.
            self.collect = false;
        }
        true
    }

    /// The UI focused its credential control: start collecting.
    pub fn start_collection(&mut self, sink: &mut dyn CredentialSink) {
        if self.secure_mode {
            self.collect = true;
            sink.field_focused(self.current_field);
            sink.username_changed(&self.username);
        }
    }

    /// True when secure processing must intercept this event.  Pointer
    /// traffic and sync markers always pass so the cursor stays alive on
    /// the login screen.
    pub fn applies_to(&self, ev: &InputEvent, uivm_focused: bool) -> bool {
        if !self.secure_mode {
            return false;
        }
        // Don't steal keys while another guest is on screen.
        if !uivm_focused {
            return false;
        }
        !(ev.kind == EV_REL || ev.kind == EV_ABS || ev.is_sync_report())
    }

    // ── Field plumbing ────────────────────────────────────────────────────────

    fn field_mut(&mut self, field: AuthField) -> &mut String {
        match field {
            AuthField::Username => &mut self.username,
            AuthField::Password => &mut self.password,
            AuthField::PasswordConfirm => &mut self.confirm,
            AuthField::PasswordPrevious => &mut self.previous,
        }
    }

    fn field(&self, field: AuthField) -> &str {
        match field {
            AuthField::Username => &self.username,
            AuthField::Password => &self.password,
            AuthField::PasswordConfirm => &self.confirm,
            AuthField::PasswordPrevious => &self.previous,
        }
    }

    /// The tabbing order depends on what the dialog is for.  Local auth
    /// has no reachable username field.
    fn tab_order(&self) -> &'static [AuthField] {
        let flags = self.flags();
        if flags & AUTH_FLAG_CHANGE_LOCAL_PW != 0 {
            &[
                AuthField::PasswordPrevious,
                AuthField::Password,
                AuthField::PasswordConfirm,
            ]
        } else if flags & AUTH_FLAG_CONFIRM_PW != 0 {
            &[AuthField::Password, AuthField::PasswordConfirm]
        } else if flags & AUTH_FLAG_REMOTE_USER != 0 {
            &[AuthField::Password, AuthField::Username]
        } else {
            &[AuthField::Password]
        }
    }

    fn tab(&mut self, direction: i32, sink: &mut dyn CredentialSink) {
        let order = self.tab_order();
        let index = order
            .iter()
            .position(|&f| f == self.current_field)
            .unwrap_or(0) as i32;
        let next = (index + direction).rem_euclid(order.len() as i32) as usize;
        self.current_field = order[next];

        // Caret lands after the last character.
        self.cursor = self.field(self.current_field).chars().count();
        sink.field_focused(self.current_field);
    }

    fn initial_field(&self) -> AuthField {
        let flags = self.flags();
        if flags & AUTH_FLAG_CHANGE_LOCAL_PW != 0 {
            AuthField::PasswordPrevious
        } else if flags & (AUTH_FLAG_SET_LOCAL_PW | AUTH_FLAG_CONFIRM_PW | AUTH_FLAG_SET_ROOT_PW)
            != 0
        {
            AuthField::Password
        } else if self.context.as_ref().map_or(true, |c| c.user.is_empty()) {
            AuthField::Username
        } else {
            AuthField::Password
        }
    }

    /// Wipes every field and reseeds the username from the context.
    fn reset_fields(&mut self, sink: &mut dyn CredentialSink) {
        wipe(&mut self.password);
        wipe(&mut self.confirm);
        wipe(&mut self.previous);
        wipe(&mut self.username);

        if let Some(ctx) = &self.context {
            if ctx.flags & AUTH_FLAG_USER_HASH == 0 {
                self.username = ctx.user.clone();
            }
            // With only a hash in the context the username starts empty
            // and the user types it afresh.
        }
        self.cursor = 0;
        self.current_field = self.initial_field();

        sink.username_changed(&self.username);
        sink.field_focused(self.current_field);
    }

    fn backspace(&mut self) {
        let field = self.field_mut(self.current_field);
        if field.pop().is_some() && self.cursor > 0 {
            self.cursor -= 1;
        }
    }

    fn collect_char(&mut self, c: char) {
        if !self.collect {
            return;
        }
        let cursor = self.cursor;
        let field = self.field_mut(self.current_field);
        let byte_pos = field
            .char_indices()
            .nth(cursor)
            .map_or(field.len(), |(i, _)| i);
        field.insert(byte_pos, c);
        self.cursor += 1;
    }

    // ── Key interception ──────────────────────────────────────────────────────

    /// Processes one intercepted keyboard event.  Returns the echo events
    /// the caller should deliver to the UI VM; the original event is
    /// always swallowed.
    pub fn process_key(
        &mut self,
        ev: &InputEvent,
        shift_down: bool,
        sink: &mut dyn CredentialSink,
    ) -> Vec<InputEvent> {
        if ev.kind != EV_KEY || ev.code >= BTN_MOUSE {
            return Vec::new();
        }

        if ev.is_key_down() {
            match ev.code {
                KEY_ESC => {
                    let hide = self.flags() & AUTH_FLAG_CANNOT_CANCEL == 0;
                    sink.cancelled(hide);
                    self.reset_fields(sink);
                }
                KEY_TAB => {
                    let direction = if shift_down { -1 } else { 1 };
                    self.tab(direction, sink);
                }
                KEY_BACKSPACE => {
                    self.backspace();
                    if self.current_field == AuthField::Username {
                        sink.username_changed(&self.username);
                    }
                }
                KEY_ENTER => {
                    sink.submitted(Credentials {
                        username: self.username.clone(),
                        password: self.password.clone(),
                        confirm: self.confirm.clone(),
                        previous: self.previous.clone(),
                    });
                    self.reset_fields(sink);
                }
                code => {
                    if let Some(c) = keycode_to_char(code, shift_down) {
                        self.collect_char(c);
                        // The UI renders the username as typed; password
                        // fields it only dots out.
                        if self.current_field == AuthField::Username {
                            sink.username_changed(&self.username);
                        }
                    }
                }
            }
        }

        // Tabbing happens inside the daemon, the UI never sees the key.
        if ev.code == KEY_TAB {
            return Vec::new();
        }

        let printable = keycode_to_char(ev.code, shift_down).is_some();
        if printable || ev.code == KEY_BACKSPACE {
            // Username keys echo as typed; everything else is blanked so
            // the UI can show progress without learning the password.
            let echo_code = if printable && self.current_field != AuthField::Username {
                KEY_SPACE
            } else {
                ev.code
            };
            if ev.is_key_down() {
                return vec![
                    InputEvent::key(echo_code, 1),
                    InputEvent::key(echo_code, 0),
                ];
            }
            return Vec::new();
        }

        // Modifiers reach the UI only while the username field is
        // focused, so shift-typed usernames render correctly.
        if self.current_field == AuthField::Username && is_echo_modifier(ev.code) {
            return vec![*ev];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        focused: Vec<AuthField>,
        usernames: Vec<String>,
        cancels: Vec<bool>,
        submissions: Vec<Credentials>,
    }

    impl CredentialSink for RecordingSink {
        fn field_focused(&mut self, field: AuthField) {
            self.focused.push(field);
        }

        fn username_changed(&mut self, username: &str) {
            self.usernames.push(username.to_owned());
        }

        fn cancelled(&mut self, hide_window: bool) {
            self.cancels.push(hide_window);
        }

        fn submitted(&mut self, credentials: Credentials) {
            self.submissions.push(credentials);
        }
    }

    fn armed(flags: u32) -> (SecureInput, RecordingSink) {
        let mut secure = SecureInput::new();
        let mut sink = RecordingSink::default();
        secure.set_context("alice", "log in", flags);
        secure.set_secure(true, &mut sink);
        secure.start_collection(&mut sink);
        (secure, sink)
    }

    fn press(secure: &mut SecureInput, sink: &mut RecordingSink, code: u16) -> Vec<InputEvent> {
        let mut echoes = secure.process_key(&InputEvent::key(code, 1), false, sink);
        echoes.extend(secure.process_key(&InputEvent::key(code, 0), false, sink));
        echoes
    }

    fn type_word(secure: &mut SecureInput, sink: &mut RecordingSink, codes: &[u16]) {
        for &code in codes {
            press(secure, sink, code);
        }
    }

    #[test]
    fn test_keycode_to_char_shift_pairs() {
        assert_eq!(keycode_to_char(KEY_A, false), Some('a'));
        assert_eq!(keycode_to_char(KEY_A, true), Some('A'));
        assert_eq!(keycode_to_char(KEY_1, true), Some('!'));
        assert_eq!(keycode_to_char(KEY_ENTER, false), None);
        assert_eq!(keycode_to_char(KEY_LEFTSHIFT, false), None);
    }

    #[test]
    fn test_typing_collects_into_password_field() {
        let (mut secure, mut sink) = armed(0);

        type_word(&mut secure, &mut sink, &[KEY_H, KEY_I]);
        press(&mut secure, &mut sink, KEY_ENTER);

        let creds = sink.submissions.pop().expect("submission");
        assert_eq!(creds.password, "hi");
        assert_eq!(creds.username, "alice");
    }

    #[test]
    fn test_password_keys_echo_as_blanks() {
        let (mut secure, mut sink) = armed(0);

        let echoes = press(&mut secure, &mut sink, KEY_H);

        assert_eq!(
            echoes,
            vec![InputEvent::key(KEY_SPACE, 1), InputEvent::key(KEY_SPACE, 0)]
        );
    }

    #[test]
    fn test_username_keys_echo_as_typed() {
        let mut secure = SecureInput::new();
        let mut sink = RecordingSink::default();
        // Remote user with no preset name: focus starts on the username.
        secure.set_context("", "log in", AUTH_FLAG_REMOTE_USER);
        secure.set_secure(true, &mut sink);
        secure.start_collection(&mut sink);
        assert_eq!(secure.current_field(), AuthField::Username);

        let echoes = press(&mut secure, &mut sink, KEY_H);

        assert_eq!(
            echoes,
            vec![InputEvent::key(KEY_H, 1), InputEvent::key(KEY_H, 0)]
        );
    }

    #[test]
    fn test_no_collection_before_ui_is_ready() {
        let mut secure = SecureInput::new();
        let mut sink = RecordingSink::default();
        secure.set_context("alice", "log in", 0);
        secure.set_secure(true, &mut sink);
        // start_collection not called yet

        press(&mut secure, &mut sink, KEY_H);
        secure.start_collection(&mut sink);
        press(&mut secure, &mut sink, KEY_I);
        press(&mut secure, &mut sink, KEY_ENTER);

        assert_eq!(sink.submissions.pop().expect("submission").password, "i");
    }

    #[test]
    fn test_tab_cycles_fields_and_shift_reverses() {
        let (mut secure, mut sink) = armed(AUTH_FLAG_CONFIRM_PW);
        assert_eq!(secure.current_field(), AuthField::Password);

        secure.process_key(&InputEvent::key(KEY_TAB, 1), false, &mut sink);
        assert_eq!(secure.current_field(), AuthField::PasswordConfirm);

        secure.process_key(&InputEvent::key(KEY_TAB, 1), true, &mut sink);
        assert_eq!(secure.current_field(), AuthField::Password);
    }

    #[test]
    fn test_tab_is_never_echoed() {
        let (mut secure, mut sink) = armed(AUTH_FLAG_CONFIRM_PW);

        let echoes = press(&mut secure, &mut sink, KEY_TAB);

        assert!(echoes.is_empty());
    }

    #[test]
    fn test_local_auth_cannot_tab_to_username() {
        let (mut secure, mut sink) = armed(0);

        press(&mut secure, &mut sink, KEY_TAB);
        assert_eq!(secure.current_field(), AuthField::Password);
    }

    #[test]
    fn test_change_password_dialog_starts_on_previous() {
        let (secure, _sink) = armed(AUTH_FLAG_CHANGE_LOCAL_PW);
        assert_eq!(secure.current_field(), AuthField::PasswordPrevious);
    }

    #[test]
    fn test_confirm_flow_fills_both_fields() {
        let (mut secure, mut sink) = armed(AUTH_FLAG_CONFIRM_PW);

        type_word(&mut secure, &mut sink, &[KEY_A, KEY_B]);
        press(&mut secure, &mut sink, KEY_TAB);
        type_word(&mut secure, &mut sink, &[KEY_A, KEY_B]);
        press(&mut secure, &mut sink, KEY_ENTER);

        let creds = sink.submissions.pop().expect("submission");
        assert_eq!(creds.password, "ab");
        assert_eq!(creds.confirm, "ab");
    }

    #[test]
    fn test_backspace_chops_last_character() {
        let (mut secure, mut sink) = armed(0);

        type_word(&mut secure, &mut sink, &[KEY_A, KEY_B]);
        press(&mut secure, &mut sink, KEY_BACKSPACE);
        press(&mut secure, &mut sink, KEY_ENTER);

        assert_eq!(sink.submissions.pop().expect("submission").password, "a");
    }

    #[test]
    fn test_escape_cancels_and_wipes() {
        let (mut secure, mut sink) = armed(0);
        type_word(&mut secure, &mut sink, &[KEY_A, KEY_B]);

        press(&mut secure, &mut sink, KEY_ESC);
        press(&mut secure, &mut sink, KEY_ENTER);

        assert_eq!(sink.cancels, vec![true]);
        assert_eq!(sink.submissions.pop().expect("submission").password, "");
    }

    #[test]
    fn test_uncancellable_dialog_reports_without_hiding() {
        let (mut secure, mut sink) = armed(AUTH_FLAG_CANNOT_CANCEL);

        press(&mut secure, &mut sink, KEY_ESC);

        assert_eq!(sink.cancels, vec![false]);
    }

    #[test]
    fn test_submission_wipes_fields() {
        let (mut secure, mut sink) = armed(0);
        type_word(&mut secure, &mut sink, &[KEY_A, KEY_B]);
        press(&mut secure, &mut sink, KEY_ENTER);

        press(&mut secure, &mut sink, KEY_ENTER);
        assert_eq!(sink.submissions.len(), 2);
        assert_eq!(sink.submissions[1].password, "");
    }

    #[test]
    fn test_pointer_events_pass_through() {
        let (secure, _sink) = armed(0);

        assert!(!secure.applies_to(&InputEvent::rel(REL_X, 4), true));
        assert!(!secure.applies_to(&InputEvent::sync(), true));
        assert!(secure.applies_to(&InputEvent::key(KEY_A, 1), true));
    }

    #[test]
    fn test_not_applicable_while_guest_on_screen() {
        let (secure, _sink) = armed(0);
        assert!(!secure.applies_to(&InputEvent::key(KEY_A, 1), false));
    }

    #[test]
    fn test_lock_flag_reported() {
        let (secure, _sink) = armed(AUTH_FLAG_LOCK);
        assert!(secure.locked());
    }

    #[test]
    fn test_user_hash_context_starts_with_empty_username() {
        let mut secure = SecureInput::new();
        let mut sink = RecordingSink::default();
        secure.set_context("a1b2c3", "log in", AUTH_FLAG_USER_HASH);
        secure.set_secure(true, &mut sink);

        assert_eq!(sink.usernames.last().map(String::as_str), Some(""));
        assert_eq!(secure.current_field(), AuthField::Username);
    }

    #[test]
    fn test_modifiers_echo_only_for_username_field() {
        let mut secure = SecureInput::new();
        let mut sink = RecordingSink::default();
        secure.set_context("", "log in", AUTH_FLAG_REMOTE_USER);
        secure.set_secure(true, &mut sink);
        secure.start_collection(&mut sink);

        let ev = InputEvent::key(KEY_LEFTSHIFT, 1);
        assert_eq!(secure.process_key(&ev, false, &mut sink), vec![ev]);

        // Move to the password field: modifiers stop leaking.
        secure.process_key(&InputEvent::key(KEY_TAB, 1), false, &mut sink);
        assert!(secure.process_key(&ev, false, &mut sink).is_empty());
    }
}
