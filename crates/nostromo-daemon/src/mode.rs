//! Color mode state machine
//!
//! Lives inside the resolver's lock; it has no locking of its own.

use std::sync::Arc;

use nostromo_config::Mode;

use crate::injector::{IndicatorControl, LED_BLUE, LED_GREEN, LED_RED};

/// LED mask for `mode`. Normal lights nothing.
pub fn indicator_mask(mode: Mode) -> u8 {
    match mode {
        Mode::Normal => 0,
        Mode::Blue => LED_BLUE,
        Mode::Green => LED_GREEN,
        Mode::Red => LED_RED,
    }
}

pub struct ModeController {
    current: Mode,
    /// Mode to return to when a shift key is released. Only one level.
    previous: Option<Mode>,
    indicator: Arc<dyn IndicatorControl>,
}

impl ModeController {
    /// Start in `mode`. The indicator is not touched until the first change
    /// or an explicit [`sync_indicator`](Self::sync_indicator).
    pub fn new(mode: Mode, indicator: Arc<dyn IndicatorControl>) -> Self {
        Self {
            current: mode,
            previous: None,
            indicator,
        }
    }

    pub fn current(&self) -> Mode {
        self.current
    }

    pub fn previous(&self) -> Option<Mode> {
        self.previous
    }

    /// Switch to `mode` and update the LEDs.
    pub fn enter(&mut self, mode: Mode) {
        if mode != self.current {
            tracing::info!("Mode {} -> {}", self.current, mode);
        }
        self.current = mode;
        self.sync_indicator();
    }

    /// Switch to `mode`, remembering the current mode for
    /// [`restore_previous`](Self::restore_previous).
    ///
    /// A second call before the restore overwrites the remembered mode.
    pub fn enter_temporary(&mut self, mode: Mode) {
        self.previous = Some(self.current);
        self.enter(mode);
    }

    /// Return to the remembered mode, if any, and forget it.
    pub fn restore_previous(&mut self) {
        if let Some(mode) = self.previous.take() {
            self.enter(mode);
        }
    }

    /// Push the current mode's mask to the indicator.
    pub fn sync_indicator(&self) {
        if let Err(e) = self.indicator.set_indicator(indicator_mask(self.current)) {
            tracing::warn!("Failed to update mode LEDs: {:#}", e);
        }
    }
}
