//! Output synthesis and LED control
//!
//! The core only talks to two small traits: [`Injector`] to press or release
//! a key or mouse button, and [`IndicatorControl`] to light the mode LEDs.
//! [`UinputInjector`] and [`LedIndicator`] are the evdev-backed
//! implementations used by the daemon and by the remote peer.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use evdev::uinput::VirtualDeviceBuilder;
use evdev::{AttributeSet, Device, EventType, InputEvent, Key, RelativeAxisType};
use nostromo_config::{Modifier, StrokeKind};

/// Synthesizes one keyboard or mouse event.
pub trait Injector: Send + Sync {
    /// Press (`pressed == true`) or release a key or mouse button.
    fn inject(&self, kind: StrokeKind, code: u16, pressed: bool) -> Result<()>;

    /// Key code used when a stroke asks for `modifier`.
    fn modifier_code(&self, modifier: Modifier) -> u16 {
        match modifier {
            Modifier::Shift => Key::KEY_LEFTSHIFT.code(),
            Modifier::Control => Key::KEY_LEFTCTRL.code(),
            Modifier::Alt => Key::KEY_LEFTALT.code(),
        }
    }
}

/// Drives the mode indicator LEDs.
pub trait IndicatorControl: Send + Sync {
    /// One bit per LED: bit 0 red, bit 1 green, bit 2 blue.
    fn set_indicator(&self, mask: u8) -> Result<()>;
}

pub const LED_RED: u8 = 1 << 0;
pub const LED_GREEN: u8 = 1 << 1;
pub const LED_BLUE: u8 = 1 << 2;

// ============================================================================
// uinput output
// ============================================================================

/// Mouse buttons a stroke can name, by their traditional button number.
fn mouse_button(button: u16) -> Option<Key> {
    match button {
        1 => Some(Key::BTN_LEFT),
        2 => Some(Key::BTN_MIDDLE),
        3 => Some(Key::BTN_RIGHT),
        8 => Some(Key::BTN_SIDE),
        9 => Some(Key::BTN_EXTRA),
        _ => None,
    }
}

/// Map a stroke to the events that synthesize it.
///
/// Buttons 4 and 5 are wheel up and down: one `REL_WHEEL` step on press,
/// nothing on release.
pub fn stroke_events(kind: StrokeKind, code: u16, pressed: bool) -> Result<Vec<InputEvent>> {
    let value = i32::from(pressed);
    let syn = InputEvent::new(EventType::SYNCHRONIZATION, 0, 0);

    let events = match kind {
        StrokeKind::Key => vec![InputEvent::new(EventType::KEY, code, value), syn],
        StrokeKind::Mouse => match code {
            4 | 5 if !pressed => Vec::new(),
            4 | 5 => {
                let step = if code == 4 { 1 } else { -1 };
                vec![
                    InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_WHEEL.0, step),
                    syn,
                ]
            }
            _ => {
                let Some(button) = mouse_button(code) else {
                    bail!("Unsupported mouse button {}", code);
                };
                vec![InputEvent::new(EventType::KEY, button.code(), value), syn]
            }
        },
    };

    Ok(events)
}

/// Virtual keyboard and mouse backed by `/dev/uinput`.
pub struct UinputInjector {
    device: Mutex<evdev::uinput::VirtualDevice>,
}

impl UinputInjector {
    /// Create the virtual device.
    ///
    /// # Errors
    ///
    /// Returns an error if `/dev/uinput` cannot be opened or the device
    /// cannot be registered (usually a permissions problem).
    pub fn new(name: &str) -> Result<Self> {
        let mut keys = AttributeSet::<Key>::new();
        for code in 0..256u16 {
            keys.insert(Key::new(code));
        }
        for button in [1, 2, 3, 8, 9].into_iter().filter_map(mouse_button) {
            keys.insert(button);
        }

        let mut axes = AttributeSet::<RelativeAxisType>::new();
        axes.insert(RelativeAxisType::REL_WHEEL);

        let device = VirtualDeviceBuilder::new()
            .context("Failed to open /dev/uinput")?
            .name(name)
            .with_keys(&keys)?
            .with_relative_axes(&axes)?
            .build()
            .with_context(|| format!("Failed to create virtual device '{}'", name))?;

        tracing::info!("Created virtual output device '{}'", name);

        Ok(Self {
            device: Mutex::new(device),
        })
    }

    fn lock(&self) -> MutexGuard<'_, evdev::uinput::VirtualDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Injector for UinputInjector {
    fn inject(&self, kind: StrokeKind, code: u16, pressed: bool) -> Result<()> {
        let events = stroke_events(kind, code, pressed)?;
        if events.is_empty() {
            return Ok(());
        }
        tracing::trace!("inject {:?} {} {}", kind, code, pressed);
        self.lock()
            .emit(&events)
            .with_context(|| format!("Failed to emit {:?} {}", kind, code))?;
        Ok(())
    }
}

// ============================================================================
// LEDs
// ============================================================================

/// Mode LEDs on the device node that advertises them.
///
/// Until a device is attached every call is a no-op, which is also how
/// models without LEDs behave.
#[derive(Default)]
pub struct LedIndicator {
    device: Mutex<Option<(PathBuf, Device)>>,
}

impl LedIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` for LED output, replacing any previous device.
    pub fn attach(&self, path: &Path) -> Result<()> {
        let device = Device::open(path)
            .with_context(|| format!("Failed to open LED device {}", path.display()))?;
        tracing::info!("Using {} for mode LEDs", path.display());
        *self.lock() = Some((path.to_path_buf(), device));
        Ok(())
    }

    /// Forget the LED device if it is `path`.
    pub fn detach(&self, path: &Path) {
        let mut guard = self.lock();
        if guard.as_ref().map(|(p, _)| p == path).unwrap_or(false) {
            *guard = None;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<(PathBuf, Device)>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IndicatorControl for LedIndicator {
    fn set_indicator(&self, mask: u8) -> Result<()> {
        let mut guard = self.lock();
        let Some((path, device)) = guard.as_mut() else {
            return Ok(());
        };

        let events: Vec<InputEvent> = (0..3u16)
            .map(|led| InputEvent::new(EventType::LED, led, i32::from(mask & (1 << led) != 0)))
            .collect();

        device
            .send_events(&events)
            .with_context(|| format!("Failed to set LEDs on {}", path.display()))?;
        Ok(())
    }
}

/// LED frames shown once at startup.
pub const LIGHT_SHOW: [u8; 7] = [0, LED_RED, LED_GREEN, LED_BLUE, LED_GREEN, LED_RED, 0];

/// Step through [`LIGHT_SHOW`], 200 ms per frame.
pub async fn light_show(indicator: &dyn IndicatorControl) {
    for mask in LIGHT_SHOW {
        if let Err(e) = indicator.set_indicator(mask) {
            tracing::debug!("Light show skipped: {:#}", e);
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_stroke_events() {
        let events = stroke_events(StrokeKind::Key, Key::KEY_A.code(), true).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), EventType::KEY);
        assert_eq!(events[0].code(), Key::KEY_A.code());
        assert_eq!(events[0].value(), 1);
        assert_eq!(events[1].event_type(), EventType::SYNCHRONIZATION);
    }

    #[test]
    fn test_mouse_buttons_map_to_btn_codes() {
        let events = stroke_events(StrokeKind::Mouse, 3, false).unwrap();
        assert_eq!(events[0].code(), Key::BTN_RIGHT.code());
        assert_eq!(events[0].value(), 0);
    }

    #[test]
    fn test_wheel_buttons_only_fire_on_press() {
        let up = stroke_events(StrokeKind::Mouse, 4, true).unwrap();
        assert_eq!(up[0].event_type(), EventType::RELATIVE);
        assert_eq!(up[0].value(), 1);

        let down = stroke_events(StrokeKind::Mouse, 5, true).unwrap();
        assert_eq!(down[0].value(), -1);

        assert!(stroke_events(StrokeKind::Mouse, 4, false).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_mouse_button_is_error() {
        assert!(stroke_events(StrokeKind::Mouse, 7, true).is_err());
    }

    #[test]
    fn test_detached_led_indicator_ignores_calls() {
        let leds = LedIndicator::new();
        assert!(!leds.is_attached());
        assert!(leds.set_indicator(LED_BLUE).is_ok());
    }

    #[test]
    fn test_default_modifier_codes() {
        struct Null;
        impl Injector for Null {
            fn inject(&self, _: StrokeKind, _: u16, _: bool) -> Result<()> {
                Ok(())
            }
        }
        assert_eq!(Null.modifier_code(Modifier::Shift), 42);
        assert_eq!(Null.modifier_code(Modifier::Control), 29);
        assert_eq!(Null.modifier_code(Modifier::Alt), 56);
    }

    #[test]
    fn test_uinput_injector_creation() {
        // Requires access to /dev/uinput
        match UinputInjector::new("nostromo-test") {
            Ok(injector) => {
                assert!(injector.inject(StrokeKind::Key, 0, false).is_ok());
            }
            Err(e) => {
                eprintln!("Skipping uinput test (no access): {:#}", e);
            }
        }
    }
}
