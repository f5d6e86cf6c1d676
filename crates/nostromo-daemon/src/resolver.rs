//! Keymap resolution
//!
//! Turns (logical key, pressed) notifications into mode changes and
//! scheduled output. All keymap and mode state sits behind one mutex so
//! readers for different devices see a consistent view, and a reload swaps
//! the whole keymap in one step.
//!
//! Multi-stroke timing: each stroke is expanded into modifier press, primary
//! press, primary release and modifier release at `offset + delay` plus
//! 0, 1, 2 and 5 ms, and the running offset then advances by `delay + 10`.
//! Equal wake times are ordered by the scheduler's insertion sequence; the
//! offsets only spread the events out in time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nostromo_config::{Config, KeyMapping, MappingKind, Mode, Modifier, Stroke, StrokeKind};
use tokio::time::Instant;

use crate::injector::Injector;
use crate::mode::ModeController;
use crate::scheduler::{GroupId, Payload, Scheduler};

/// Key codes injected for stroke modifiers and hold mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifierCodes {
    pub shift: u16,
    pub control: u16,
    pub alt: u16,
}

impl ModifierCodes {
    pub fn from_injector(injector: &dyn Injector) -> Self {
        Self {
            shift: injector.modifier_code(Modifier::Shift),
            control: injector.modifier_code(Modifier::Control),
            alt: injector.modifier_code(Modifier::Alt),
        }
    }

    pub fn code(&self, modifier: Modifier) -> u16 {
        match modifier {
            Modifier::Shift => self.shift,
            Modifier::Control => self.control,
            Modifier::Alt => self.alt,
        }
    }
}

impl Default for ModifierCodes {
    fn default() -> Self {
        Self {
            shift: evdev::Key::KEY_LEFTSHIFT.code(),
            control: evdev::Key::KEY_LEFTCTRL.code(),
            alt: evdev::Key::KEY_LEFTALT.code(),
        }
    }
}

/// Per-stroke offsets for modifier press, primary press, primary release
/// and modifier release.
const MOD_PRESS_OFFSET: u64 = 0;
const PRESS_OFFSET: u64 = 1;
const RELEASE_OFFSET: u64 = 2;
const MOD_RELEASE_OFFSET: u64 = 5;
/// Added to the running offset after each stroke.
const STROKE_GAP: u64 = 10;

struct CoreState {
    config: Config,
    modes: ModeController,
    /// Repeating groups started by presses of each key that have not been
    /// released.
    groups: HashMap<usize, Vec<GroupId>>,
}

/// Snapshot of the mode state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeStatus {
    pub current: Mode,
    pub previous: Option<Mode>,
}

pub struct KeyMapResolver {
    state: Mutex<CoreState>,
    scheduler: Arc<Scheduler>,
    modifier_codes: ModifierCodes,
}

impl KeyMapResolver {
    pub fn new(
        config: Config,
        modes: ModeController,
        scheduler: Arc<Scheduler>,
        modifier_codes: ModifierCodes,
    ) -> Self {
        Self {
            state: Mutex::new(CoreState {
                config,
                modes,
                groups: HashMap::new(),
            }),
            scheduler,
            modifier_codes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve one normalized key transition.
    pub fn on_event(&self, key: usize, pressed: bool) {
        let mut state = self.lock();
        self.resolve(&mut state, key, pressed);
    }

    /// Resolve a raw button value from a device reader.
    ///
    /// Any non-zero `value` counts as pressed. Notifications that do not
    /// change the key's held state (auto-repeat, duplicates from a noisy
    /// switch) are dropped.
    pub fn on_button(&self, key: usize, value: i32) {
        let pressed = value != 0;
        let mut state = self.lock();

        let Some(keymap) = state.config.active_mut() else {
            return;
        };
        if key >= keymap.model.max_keys() {
            tracing::debug!("Ignoring key {} beyond {} layout", key, keymap.model);
            return;
        }
        if keymap.is_held(key) == pressed {
            tracing::trace!("Duplicate {} for key {}", if pressed { "press" } else { "release" }, key);
            return;
        }
        keymap.set_held(key, pressed);

        self.resolve(&mut state, key, pressed);
    }

    /// Re-run a held multi-stroke key for a fired repeat action.
    ///
    /// The new sequence joins `group`, so the key's release still cancels
    /// the whole chain. Repeats for a key that has since been released, or
    /// whose mapping is no longer a multi-stroke, are dropped.
    pub fn repeat(&self, key: usize, group: GroupId) {
        let state = self.lock();

        let live = state
            .groups
            .get(&key)
            .map(|groups| groups.contains(&group))
            .unwrap_or(false);
        if !live {
            tracing::debug!("Dropping stale repeat for key {}", key);
            return;
        }

        let mode = state.modes.current();
        let Some(mapping) = state.config.active().and_then(|m| m.mapping(mode, key)) else {
            return;
        };
        if mapping.kind != MappingKind::Multi {
            tracing::debug!("Key {} is no longer a multi-stroke in {}, not repeating", key, mode);
            return;
        }

        self.schedule_sequence(Instant::now(), mapping, key, group);
    }

    /// Replace the active configuration.
    ///
    /// Held flags are carried over and any in-flight repeat chains are
    /// cancelled. The mode is kept. Returns the previous configuration.
    pub fn swap_config(&self, mut config: Config) -> Config {
        let mut state = self.lock();
        config.carry_transient_from(&state.config);
        let previous = std::mem::replace(&mut state.config, config);

        for (_, groups) in state.groups.drain() {
            for group in groups {
                self.scheduler.cancel_all(group);
            }
        }

        if let Some(keymap) = state.config.active() {
            tracing::info!("Active keymap is now '{}' ({})", keymap.name, keymap.model);
        }

        previous
    }

    pub fn mode_status(&self) -> ModeStatus {
        let state = self.lock();
        ModeStatus {
            current: state.modes.current(),
            previous: state.modes.previous(),
        }
    }

    /// Run `f` against the active configuration under the lock.
    pub fn with_config<R>(&self, f: impl FnOnce(&Config) -> R) -> R {
        f(&self.lock().config)
    }

    /// Push the current mode to the LEDs, e.g. after a new LED device
    /// appears.
    pub fn sync_indicator(&self) {
        self.lock().modes.sync_indicator();
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    fn resolve(&self, state: &mut CoreState, key: usize, pressed: bool) {
        let Some(keymap) = state.config.active() else {
            tracing::warn!("No keymap loaded, ignoring key {}", key);
            return;
        };
        if key >= keymap.model.max_keys() {
            tracing::debug!("Ignoring key {} beyond {} layout", key, keymap.model);
            return;
        }

        // A release ends any repeat chain the key started, whatever it is
        // mapped to now
        if !pressed {
            for group in state.groups.remove(&key).unwrap_or_default() {
                self.scheduler.cancel_all(group);
            }
        }

        // Releasing the key that shifted us out of the previous mode
        if !pressed {
            if let Some(previous) = state.modes.previous() {
                let ends_shift = keymap
                    .mapping(previous, key)
                    .map(|m| m.kind.is_shift())
                    .unwrap_or(false);
                if ends_shift {
                    state.modes.restore_previous();
                    return;
                }
            }
        }

        let mode = state.modes.current();
        let Some(mapping) = keymap.mapping(mode, key) else {
            return;
        };
        let now = Instant::now();

        tracing::debug!(
            "key {} {} in {} mode: {} ({})",
            key,
            if pressed { "down" } else { "up" },
            mode,
            mapping.kind.name(),
            mapping.name
        );

        match mapping.kind {
            MappingKind::Single => {
                for stroke in &mapping.strokes {
                    self.schedule_single(now, stroke, pressed, mapping.remote);
                }
            }
            MappingKind::Multi => {
                if pressed {
                    let group = self.scheduler.new_group();
                    self.schedule_sequence(now, mapping, key, group);
                    if mapping.repeat {
                        state.groups.entry(key).or_default().push(group);
                    }
                }
            }
            MappingKind::Shift(target) => {
                if pressed {
                    state.modes.enter_temporary(target);
                }
            }
            MappingKind::Lock(target) => {
                if pressed {
                    state.modes.enter(target);
                }
            }
            MappingKind::Hold(modifier) => {
                self.inject_after(
                    now,
                    None,
                    0,
                    StrokeKind::Key,
                    self.modifier_codes.code(modifier),
                    pressed,
                    mapping.remote,
                );
            }
        }
    }

    /// One stroke of a single mapping, following the physical key.
    fn schedule_single(&self, now: Instant, stroke: &Stroke, pressed: bool, remote: bool) {
        let delay = u64::from(stroke.delay_ms);
        for modifier in stroke.modifiers.iter() {
            self.inject_after(now, None, delay, StrokeKind::Key, self.modifier_codes.code(modifier), true, remote);
        }
        self.inject_after(now, None, delay, stroke.kind, stroke.code, pressed, remote);
        for modifier in stroke.modifiers.iter().rev() {
            self.inject_after(now, None, delay, StrokeKind::Key, self.modifier_codes.code(modifier), false, remote);
        }
    }

    /// Queue a whole multi-stroke sequence (and its repeat) under `group`.
    fn schedule_sequence(&self, now: Instant, mapping: &KeyMapping, key: usize, group: GroupId) {
        let remote = mapping.remote;
        let mut offset: u64 = 0;

        for stroke in &mapping.strokes {
            let base = offset + u64::from(stroke.delay_ms);

            for modifier in stroke.modifiers.iter() {
                let code = self.modifier_codes.code(modifier);
                self.inject_after(now, Some(group), base + MOD_PRESS_OFFSET, StrokeKind::Key, code, true, remote);
            }
            self.inject_after(now, Some(group), base + PRESS_OFFSET, stroke.kind, stroke.code, true, remote);
            self.inject_after(now, Some(group), base + RELEASE_OFFSET, stroke.kind, stroke.code, false, remote);
            for modifier in stroke.modifiers.iter().rev() {
                let code = self.modifier_codes.code(modifier);
                self.inject_after(now, Some(group), base + MOD_RELEASE_OFFSET, StrokeKind::Key, code, false, remote);
            }

            offset += u64::from(stroke.delay_ms) + STROKE_GAP;
        }

        if mapping.repeat {
            self.scheduler.enqueue_at(
                now,
                Some(group),
                offset + u64::from(mapping.repeat_delay_ms),
                Payload::Repeat { key, group },
            );
        }
    }

    fn inject_after(
        &self,
        now: Instant,
        group: Option<GroupId>,
        delay_ms: u64,
        kind: StrokeKind,
        code: u16,
        pressed: bool,
        remote: bool,
    ) {
        self.scheduler.enqueue_at(
            now,
            group,
            delay_ms,
            Payload::Inject {
                kind,
                code,
                pressed,
                remote,
            },
        );
    }
}
