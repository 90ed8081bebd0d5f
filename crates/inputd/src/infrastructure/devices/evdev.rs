//! Linux evdev implementation of [`DeviceSource`].
//!
//! Capability probing reads the sysfs mirror of the kernel's capability
//! bitmasks (`/sys/class/input/eventN/device/capabilities/{ev,key,abs}`),
//! which needs no ioctl and works on any kernel with sysfs mounted.  The
//! files print the bitmask as whitespace-separated hex words, most
//! significant word first.
//!
//! Event streaming is a plain blocking `read` of 24-byte
//! `struct input_event` records from `/dev/input/eventN`; LED feedback
//! is a write of the same record shape.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use input_core::codes::{EV_LED, EV_SYN, SYN_REPORT};
use input_core::{DeviceCaps, InputEvent};

use super::{DeviceError, DeviceSource, EventStream};

/// Size of one `struct input_event` on 64-bit kernels: a 16-byte
/// timestamp, then type, code, and value.
pub const RAW_EVENT_SIZE: usize = 24;

const DEV_DIR: &str = "/dev/input";
const SYS_DIR: &str = "/sys/class/input";

fn io_err(node: &str, source: std::io::Error) -> DeviceError {
    DeviceError::Io {
        node: node.to_string(),
        source,
    }
}

// ── Raw record codec ──────────────────────────────────────────────────────────

/// Decodes one raw evdev record; the timestamp is discarded.
pub fn decode_raw(buf: &[u8; RAW_EVENT_SIZE]) -> InputEvent {
    let kind = u16::from_le_bytes([buf[16], buf[17]]);
    let code = u16::from_le_bytes([buf[18], buf[19]]);
    let value = i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
    InputEvent::new(kind, code, value)
}

/// Encodes one record for writing back to a device, with a zero
/// timestamp (the kernel fills it in).
pub fn encode_raw(ev: InputEvent) -> [u8; RAW_EVENT_SIZE] {
    let mut buf = [0u8; RAW_EVENT_SIZE];
    buf[16..18].copy_from_slice(&ev.kind.to_le_bytes());
    buf[18..20].copy_from_slice(&ev.code.to_le_bytes());
    buf[20..24].copy_from_slice(&ev.value.to_le_bytes());
    buf
}

// ── Sysfs parsing ─────────────────────────────────────────────────────────────

/// Parses a sysfs capability bitmask into words, lowest word first.
fn parse_bitmask(text: &str) -> Option<Vec<u64>> {
    let mut words = text
        .split_whitespace()
        .map(|w| u64::from_str_radix(w, 16).ok())
        .collect::<Option<Vec<u64>>>()?;
    words.reverse();
    Some(words)
}

fn parse_hex_u16(text: &str) -> Option<u16> {
    u16::from_str_radix(text.trim(), 16).ok()
}

// ── The source ────────────────────────────────────────────────────────────────

/// Production [`DeviceSource`] backed by `/dev/input` and sysfs.
pub struct EvdevSource {
    dev_dir: PathBuf,
    sys_dir: PathBuf,
}

impl EvdevSource {
    pub fn new() -> Self {
        Self {
            dev_dir: PathBuf::from(DEV_DIR),
            sys_dir: PathBuf::from(SYS_DIR),
        }
    }

    fn sysfs_attr(&self, node: &str, attr: &'static str) -> Result<String, DeviceError> {
        let path = self.sys_dir.join(node).join("device").join(attr);
        std::fs::read_to_string(&path).map_err(|e| io_err(node, e))
    }

    fn sysfs_hex_u16(&self, node: &str, attr: &'static str) -> Result<u16, DeviceError> {
        parse_hex_u16(&self.sysfs_attr(node, attr)?).ok_or(DeviceError::BadAttribute {
            node: node.to_string(),
            attr,
        })
    }

    fn sysfs_bitmask(&self, node: &str, attr: &'static str) -> Result<Vec<u64>, DeviceError> {
        parse_bitmask(&self.sysfs_attr(node, attr)?).ok_or(DeviceError::BadAttribute {
            node: node.to_string(),
            attr,
        })
    }
}

impl Default for EvdevSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSource for EvdevSource {
    fn enumerate(&mut self) -> Result<Vec<String>, DeviceError> {
        let entries = std::fs::read_dir(&self.dev_dir).map_err(|e| io_err(DEV_DIR, e))?;
        let mut nodes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(DEV_DIR, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("event") {
                nodes.push(name);
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    fn probe(&mut self, node: &str) -> Result<DeviceCaps, DeviceError> {
        let name = self.sysfs_attr(node, "name")?.trim().to_string();
        let bus = self.sysfs_hex_u16(node, "id/bustype")?;
        let vendor = self.sysfs_hex_u16(node, "id/vendor")?;
        let product = self.sysfs_hex_u16(node, "id/product")?;

        let ev_words = self.sysfs_bitmask(node, "capabilities/ev")?;
        let key_bits = self.sysfs_bitmask(node, "capabilities/key")?;
        let abs_words = self.sysfs_bitmask(node, "capabilities/abs")?;

        Ok(DeviceCaps {
            name,
            bus,
            vendor,
            product,
            ev_bits: ev_words.first().copied().unwrap_or(0) as u32,
            key_bits,
            abs_bits: abs_words.first().copied().unwrap_or(0),
        })
    }

    fn open(&mut self, node: &str) -> Result<Box<dyn EventStream>, DeviceError> {
        let file = File::open(self.dev_dir.join(node)).map_err(|e| io_err(node, e))?;
        Ok(Box::new(EvdevStream {
            node: node.to_string(),
            file,
        }))
    }

    fn set_led(&mut self, node: &str, led: u16, on: bool) -> Result<(), DeviceError> {
        let path = self.dev_dir.join(node);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| io_err(node, e))?;
        let mut buf = Vec::with_capacity(RAW_EVENT_SIZE * 2);
        buf.extend_from_slice(&encode_raw(InputEvent::new(EV_LED, led, i32::from(on))));
        buf.extend_from_slice(&encode_raw(InputEvent::new(EV_SYN, SYN_REPORT, 0)));
        file.write_all(&buf).map_err(|e| io_err(node, e))
    }
}

struct EvdevStream {
    node: String,
    file: File,
}

impl EventStream for EvdevStream {
    fn next_event(&mut self) -> Result<Option<InputEvent>, DeviceError> {
        let mut buf = [0u8; RAW_EVENT_SIZE];
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(Some(decode_raw(&buf))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(io_err(&self.node, e)),
        }
    }
}

/// Extracts the numeric suffix of an event node name, used as the
/// device's routing slot.
pub fn node_number(node: &str) -> Option<u8> {
    node.strip_prefix("event")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use input_core::codes::{EV_KEY, KEY_A, LED_NUML};

    #[test]
    fn test_parse_bitmask_single_word() {
        // Arrange / Act
        let words = parse_bitmask("120013").expect("parse");

        // Assert
        assert_eq!(words, vec![0x120013]);
    }

    #[test]
    fn test_parse_bitmask_reverses_word_order() {
        // sysfs prints the most significant word first.
        let words = parse_bitmask("1 0").expect("parse");

        assert_eq!(words, vec![0x0, 0x1]);
    }

    #[test]
    fn test_parse_bitmask_rejects_garbage() {
        assert!(parse_bitmask("12 zz").is_none());
    }

    #[test]
    fn test_parse_hex_u16_with_trailing_newline() {
        assert_eq!(parse_hex_u16("056a\n"), Some(0x056a));
    }

    #[test]
    fn test_raw_record_codec() {
        // Arrange
        let ev = InputEvent::new(EV_KEY, KEY_A, 1);

        // Act
        let buf = encode_raw(ev);
        let back = decode_raw(&buf);

        // Assert – timestamp bytes stay zero, payload survives.
        assert_eq!(&buf[..16], &[0u8; 16]);
        assert_eq!(back, ev);
    }

    #[test]
    fn test_encode_raw_led_record() {
        let buf = encode_raw(InputEvent::new(EV_LED, LED_NUML, 1));

        assert_eq!(u16::from_le_bytes([buf[16], buf[17]]), EV_LED);
        assert_eq!(u16::from_le_bytes([buf[18], buf[19]]), LED_NUML);
        assert_eq!(i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]), 1);
    }

    #[test]
    fn test_node_number() {
        assert_eq!(node_number("event12"), Some(12));
        assert_eq!(node_number("mouse0"), None);
        assert_eq!(node_number("eventx"), None);
    }
}
