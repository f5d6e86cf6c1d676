//! Nostromo device discovery, grabbing and event normalization

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use evdev::{Device, EventType, InputEventKind};
use nostromo_config::Model;
use tokio::sync::watch;

use crate::resolver::KeyMapResolver;

pub const BELKIN_VENDOR_ID: u16 = 0x050d;
pub const N50_PRODUCT_ID: u16 = 0x0805;
pub const N52_PRODUCT_ID: u16 = 0x0815;

/// Information about a Nostromo event node
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub model: Model,
    /// The node accepts `EV_LED` writes. On the n52 only one of its two
    /// nodes does.
    pub has_leds: bool,
}

/// Model for a USB vendor/product pair, if it is a Nostromo.
pub fn model_for(vendor: u16, product: u16) -> Option<Model> {
    if vendor != BELKIN_VENDOR_ID {
        return None;
    }
    match product {
        N50_PRODUCT_ID => Some(Model::N50),
        N52_PRODUCT_ID => Some(Model::N52),
        _ => None,
    }
}

fn has_leds(device: &Device) -> bool {
    device
        .supported_leds()
        .map(|leds| leds.iter().next().is_some())
        .unwrap_or(false)
}

/// Find every Nostromo event node under `/dev/input`.
pub fn enumerate_devices() -> Result<Vec<DeviceInfo>> {
    enumerate_devices_in(Path::new("/dev/input"))
}

pub fn enumerate_devices_in(dir: &Path) -> Result<Vec<DeviceInfo>> {
    let mut devices = Vec::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();

        if !path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("event"))
            .unwrap_or(false)
        {
            continue;
        }

        match Device::open(&path) {
            Ok(device) => {
                let id = device.input_id();
                let Some(model) = model_for(id.vendor(), id.product()) else {
                    continue;
                };
                devices.push(DeviceInfo {
                    name: device.name().unwrap_or("Nostromo").to_string(),
                    has_leds: has_leds(&device),
                    path,
                    model,
                });
            }
            Err(e) => {
                tracing::debug!("Could not open {}: {}", path.display(), e);
            }
        }
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// Open `info.path` and take exclusive access to it.
///
/// # Errors
///
/// Fails if the node cannot be opened or another client already holds the
/// grab.
pub fn open_and_grab(info: &DeviceInfo) -> Result<Device> {
    let mut device = Device::open(&info.path)
        .with_context(|| format!("Failed to open {}", info.path.display()))?;
    device
        .grab()
        .with_context(|| format!("Failed to grab {}", info.path.display()))?;
    Ok(device)
}

// ============================================================================
// Normalization
// ============================================================================

/// A normalized notification for the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// A button report with its raw value; duplicates are filtered on the
    /// key's held state.
    Button { key: usize, value: i32 },
    /// A synthesized transition (d-pad, wheel) passed through as-is.
    Transition { key: usize, pressed: bool },
}

/// `EV_KEY` codes from here up are n50 buttons, numbered from here.
const N50_KEY_OFFSET: u16 = 304;

/// The n52 reports its keypad as ordinary keyboard codes.
const N52_KEYS: &[(u16, usize)] = &[
    (15, 0),
    (16, 1),
    (17, 2),
    (18, 3),
    (19, 4),
    (58, 5),
    (30, 6),
    (31, 7),
    (32, 8),
    (33, 9),
    (105, 10),
    (106, 11),
    (103, 12),
    (108, 13),
    (42, 14),
    (44, 15),
    (45, 16),
    (46, 17),
    (57, 18),
    (56, 19),
    (274, 21),
];

const ABS_DPAD_Y: u16 = 0;
const ABS_DPAD_X: u16 = 1;
const ABS_WHEEL: u16 = 6;
const DPAD_CENTER: i32 = 128;

pub const KEY_WHEEL_UP: usize = 20;
pub const KEY_WHEEL_DOWN: usize = 22;

/// Per-device state needed to turn raw events into logical keys.
#[derive(Debug, Clone)]
pub struct Normalizer {
    /// Last value seen on each d-pad axis, used to tell which direction a
    /// centering event releases.
    dpad: [i32; 2],
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            dpad: [DPAD_CENTER; 2],
        }
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one raw event. Most events produce nothing or one
    /// notification; a wheel step produces a press and a release.
    pub fn normalize(&mut self, kind: EventType, code: u16, value: i32) -> Vec<KeyEvent> {
        match kind {
            EventType::KEY => {
                let key = if code >= N50_KEY_OFFSET {
                    Some(usize::from(code - N50_KEY_OFFSET))
                } else {
                    N52_KEYS.iter().find(|(raw, _)| *raw == code).map(|(_, key)| *key)
                };
                match key {
                    Some(key) => vec![KeyEvent::Button { key, value }],
                    None => {
                        tracing::trace!("Ignoring unmapped key code {}", code);
                        Vec::new()
                    }
                }
            }
            EventType::ABSOLUTE => match code {
                // Absolute wheel position; steps arrive as EV_REL
                ABS_WHEEL => Vec::new(),
                ABS_DPAD_Y | ABS_DPAD_X => {
                    let axis = usize::from(code);
                    let previous = self.dpad[axis];
                    self.dpad[axis] = value;

                    // Centering releases whichever end was last pressed
                    let low = value == 0 || previous == 0;
                    let high = value == 255 || previous == 255;
                    let base = if code == ABS_DPAD_Y { 10 } else { 12 };
                    let key = if low {
                        base
                    } else if high {
                        base + 1
                    } else {
                        return Vec::new();
                    };

                    vec![KeyEvent::Transition {
                        key,
                        pressed: value != DPAD_CENTER,
                    }]
                }
                _ => Vec::new(),
            },
            EventType::RELATIVE => {
                let key = match value {
                    1 => KEY_WHEEL_UP,
                    -1 => KEY_WHEEL_DOWN,
                    _ => return Vec::new(),
                };
                vec![
                    KeyEvent::Transition { key, pressed: true },
                    KeyEvent::Transition { key, pressed: false },
                ]
            }
            _ => Vec::new(),
        }
    }
}

/// Hand a normalized event to the resolver.
pub fn deliver(resolver: &KeyMapResolver, event: KeyEvent) {
    match event {
        KeyEvent::Button { key, value } => resolver.on_button(key, value),
        KeyEvent::Transition { key, pressed } => resolver.on_event(key, pressed),
    }
}

// ============================================================================
// Reader task
// ============================================================================

/// Read events from one grabbed device until it fails or `shutdown` fires.
///
/// A read error or disconnect only ends this reader; the error is returned
/// so the caller can log it and forget the device.
pub async fn run_reader(
    device: Device,
    info: DeviceInfo,
    resolver: std::sync::Arc<KeyMapResolver>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut stream = device
        .into_event_stream()
        .with_context(|| format!("Failed to stream events from {}", info.path.display()))?;
    let mut normalizer = Normalizer::new();

    tracing::info!("Reading {} ({}) from {}", info.name, info.model, info.path.display());

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("Reader for {} stopping", info.path.display());
                    return Ok(());
                }
            }
            event = stream.next_event() => {
                let event = event
                    .with_context(|| format!("Read failed on {}", info.path.display()))?;
                if let InputEventKind::Synchronization(_) = event.kind() {
                    continue;
                }
                for key_event in normalizer.normalize(event.event_type(), event.code(), event.value()) {
                    deliver(&resolver, key_event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_for_belkin_ids() {
        assert_eq!(model_for(0x050d, 0x0805), Some(Model::N50));
        assert_eq!(model_for(0x050d, 0x0815), Some(Model::N52));
        assert_eq!(model_for(0x050d, 0x1234), None);
        assert_eq!(model_for(0x046d, 0x0815), None);
    }

    #[test]
    fn test_n50_buttons_use_offset() {
        let mut n = Normalizer::new();
        assert_eq!(
            n.normalize(EventType::KEY, 304, 1),
            vec![KeyEvent::Button { key: 0, value: 1 }]
        );
        assert_eq!(
            n.normalize(EventType::KEY, 305, 1),
            vec![KeyEvent::Button { key: 1, value: 1 }]
        );
        assert_eq!(
            n.normalize(EventType::KEY, 317, 0),
            vec![KeyEvent::Button { key: 13, value: 0 }]
        );
    }

    #[test]
    fn test_n52_keypad_table() {
        let mut n = Normalizer::new();
        for (raw, key) in [(15, 0), (58, 5), (33, 9), (42, 14), (56, 19), (274, 21)] {
            assert_eq!(
                n.normalize(EventType::KEY, raw, 1),
                vec![KeyEvent::Button { key, value: 1 }]
            );
        }
        assert!(n.normalize(EventType::KEY, 2, 1).is_empty());
    }

    #[test]
    fn test_dpad_press_and_center() {
        let mut n = Normalizer::new();
        assert_eq!(
            n.normalize(EventType::ABSOLUTE, ABS_DPAD_Y, 0),
            vec![KeyEvent::Transition { key: 10, pressed: true }]
        );
        assert_eq!(
            n.normalize(EventType::ABSOLUTE, ABS_DPAD_Y, 128),
            vec![KeyEvent::Transition { key: 10, pressed: false }]
        );
        assert_eq!(
            n.normalize(EventType::ABSOLUTE, ABS_DPAD_X, 255),
            vec![KeyEvent::Transition { key: 13, pressed: true }]
        );
        assert_eq!(
            n.normalize(EventType::ABSOLUTE, ABS_DPAD_X, 128),
            vec![KeyEvent::Transition { key: 13, pressed: false }]
        );
        // Centering twice has no direction to release
        assert!(n.normalize(EventType::ABSOLUTE, ABS_DPAD_X, 128).is_empty());
    }

    #[test]
    fn test_wheel_steps_press_and_release() {
        let mut n = Normalizer::new();
        assert_eq!(
            n.normalize(EventType::RELATIVE, 8, -1),
            vec![
                KeyEvent::Transition { key: 22, pressed: true },
                KeyEvent::Transition { key: 22, pressed: false },
            ]
        );
        assert!(n.normalize(EventType::ABSOLUTE, ABS_WHEEL, 40).is_empty());
        assert!(n.normalize(EventType::RELATIVE, 8, 3).is_empty());
    }

    #[test]
    fn test_enumerate_missing_dir_is_error() {
        assert!(enumerate_devices_in(Path::new("/nonexistent/input")).is_err());
    }

    #[test]
    fn test_enumerate_skips_non_event_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("mouse0"), b"").unwrap();
        std::fs::write(dir.path().join("event0"), b"").unwrap();
        // event0 is not a real device node, so it is skipped after open fails
        assert!(enumerate_devices_in(dir.path()).unwrap().is_empty());
    }
}
