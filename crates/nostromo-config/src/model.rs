//! Keymap data model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of color modes.
pub const MAX_MODES: usize = 4;

/// Logical keys on the n50.
pub const N50_KEYS: usize = 14;

/// Logical keys on the n52 (extra row, d-pad and wheel included).
pub const MAX_KEYS: usize = 23;

/// Upper bound on strokes in one mapping.
pub const MAX_STROKES: usize = 32;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub global: GlobalConfig,
    pub configs: Vec<KeyMap>,
}

impl Config {
    /// The keymap selected by `current-config`, or the first one if the
    /// index is out of range.
    pub fn active(&self) -> Option<&KeyMap> {
        self.configs
            .get(self.global.current_config)
            .or_else(|| self.configs.first())
    }

    pub fn active_mut(&mut self) -> Option<&mut KeyMap> {
        let index = if self.global.current_config < self.configs.len() {
            self.global.current_config
        } else {
            0
        };
        self.configs.get_mut(index)
    }

    /// Copy the transient `held` flags from a previous snapshot.
    ///
    /// Cells are matched by (config index, mode, key). Cells that do not exist
    /// in `previous` keep their freshly loaded (released) state.
    pub fn carry_transient_from(&mut self, previous: &Config) {
        for (new_map, old_map) in self.configs.iter_mut().zip(previous.configs.iter()) {
            for (new_row, old_row) in new_map.keys.iter_mut().zip(old_map.keys.iter()) {
                for (new_cell, old_cell) in new_row.iter_mut().zip(old_row.iter()) {
                    new_cell.held = old_cell.held;
                }
            }
        }
    }

    /// Network settings differ in a way that requires rebinding the listener.
    ///
    /// `server` only tells the peer where to connect, so it is not compared.
    pub fn network_changed(&self, other: &Config) -> bool {
        let (a, b) = (&self.global.network, &other.global.network);
        a.enabled != b.enabled || a.port != b.port
    }
}

/// Global settings
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub log_level: LogLevel,
    pub network: NetworkConfig,
    /// Index into [`Config::configs`] of the keymap in use.
    pub current_config: usize,
    /// Mode entered when the daemon starts.
    pub start_mode: Mode,
    /// Cycle the LEDs once at startup.
    pub light_show: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            network: NetworkConfig::default(),
            current_config: 0,
            start_mode: Mode::Normal,
            light_show: true,
        }
    }
}

/// Remote forwarding settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub enabled: bool,
    pub port: u16,
    /// Host the peer connects to; the daemon itself binds every interface.
    pub server: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8000,
            server: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

// ============================================================================
// Modes and models
// ============================================================================

/// Color mode. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Normal,
    Blue,
    Green,
    Red,
}

impl Mode {
    pub const ALL: [Mode; MAX_MODES] = [Mode::Normal, Mode::Blue, Mode::Green, Mode::Red];

    pub fn index(self) -> usize {
        match self {
            Mode::Normal => 0,
            Mode::Blue => 1,
            Mode::Green => 2,
            Mode::Red => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Blue => "blue",
            Mode::Green => "green",
            Mode::Red => "red",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "blue" => Ok(Mode::Blue),
            "green" => Ok(Mode::Green),
            "red" => Ok(Mode::Red),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}

/// Hardware model a keymap was authored for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Model {
    N50,
    #[default]
    N52,
}

impl Model {
    /// Number of logical keys the model exposes.
    pub fn max_keys(self) -> usize {
        match self {
            Model::N50 => N50_KEYS,
            Model::N52 => MAX_KEYS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Model::N50 => "n50",
            Model::N52 => "n52",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "n50" => Ok(Model::N50),
            "n52" => Ok(Model::N52),
            _ => Err(format!("Unknown model: {} (expected n50 or n52)", s)),
        }
    }
}

// ============================================================================
// Strokes
// ============================================================================

/// A modifier key that can be held or bracket a stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modifier {
    Shift,
    Control,
    Alt,
}

impl Modifier {
    pub const ALL: [Modifier; 3] = [Modifier::Shift, Modifier::Control, Modifier::Alt];

    pub fn bit(self) -> u8 {
        match self {
            Modifier::Shift => Modifiers::SHIFT,
            Modifier::Control => Modifiers::CONTROL,
            Modifier::Alt => Modifiers::ALT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Modifier::Shift => "shift",
            Modifier::Control => "control",
            Modifier::Alt => "alt",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "shift" => Some(Modifier::Shift),
            "control" | "ctrl" => Some(Modifier::Control),
            "alt" | "meta" => Some(Modifier::Alt),
            _ => None,
        }
    }
}

/// Modifier bitmask carried by a stroke.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Modifiers(u8);

impl Modifiers {
    pub const SHIFT: u8 = 1;
    pub const CONTROL: u8 = 4;
    pub const ALT: u8 = 8;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from a raw mask, dropping unknown bits.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::SHIFT | Self::CONTROL | Self::ALT))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, modifier: Modifier) -> bool {
        self.0 & modifier.bit() != 0
    }

    pub fn insert(&mut self, modifier: Modifier) {
        self.0 |= modifier.bit();
    }

    /// Modifiers present in the mask, in shift, control, alt order.
    pub fn iter(self) -> impl DoubleEndedIterator<Item = Modifier> {
        Modifier::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

impl fmt::Display for Modifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Modifier::as_str).collect();
        f.write_str(&names.join("+"))
    }
}

impl FromStr for Modifiers {
    type Err = String;

    /// Parse `"shift+control"` style lists. An empty string is no modifiers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mods = Modifiers::empty();
        for part in s.split('+').map(str::trim).filter(|p| !p.is_empty()) {
            let modifier =
                Modifier::from_name(part).ok_or_else(|| format!("Unknown modifier: {}", part))?;
            mods.insert(modifier);
        }
        Ok(mods)
    }
}

/// What a stroke synthesizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrokeKind {
    #[default]
    Key,
    Mouse,
}

impl StrokeKind {
    /// Integer tag used on the remote wire.
    pub fn wire_tag(self) -> i32 {
        match self {
            StrokeKind::Key => 0,
            StrokeKind::Mouse => 1,
        }
    }

    pub fn from_wire_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(StrokeKind::Key),
            1 => Some(StrokeKind::Mouse),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StrokeKind::Key => "key",
            StrokeKind::Mouse => "mouse",
        }
    }
}

impl FromStr for StrokeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "key" => Ok(StrokeKind::Key),
            "mouse" => Ok(StrokeKind::Mouse),
            _ => Err(format!("Unknown stroke type: {}", s)),
        }
    }
}

/// One primitive key or mouse action within a mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stroke {
    pub kind: StrokeKind,
    /// evdev key code for `Key`, button number for `Mouse`.
    pub code: u16,
    pub modifiers: Modifiers,
    /// Delay relative to the previous stroke in the sequence.
    pub delay_ms: u32,
    /// Display text, not used when dispatching.
    pub label: String,
}

impl Stroke {
    pub fn key(code: u16) -> Self {
        Self {
            kind: StrokeKind::Key,
            code,
            ..Default::default()
        }
    }

    pub fn mouse(button: u16) -> Self {
        Self {
            kind: StrokeKind::Mouse,
            code: button,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay_ms: u32) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }
}

// ============================================================================
// Mappings
// ============================================================================

/// How a logical key behaves in a given mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MappingKind {
    /// Strokes follow the key: pressed on press, released on release.
    #[default]
    Single,
    /// The whole sequence fires on press, optionally repeating while held.
    Multi,
    /// Switch mode while held.
    Shift(Mode),
    /// Switch mode until another mode key is used.
    Lock(Mode),
    /// Hold a modifier for as long as the key is held.
    Hold(Modifier),
}

impl MappingKind {
    pub fn is_shift(self) -> bool {
        matches!(self, MappingKind::Shift(_))
    }

    pub fn name(self) -> String {
        match self {
            MappingKind::Single => "single".to_string(),
            MappingKind::Multi => "multi".to_string(),
            MappingKind::Shift(mode) => format!("{}-shift", mode),
            MappingKind::Lock(mode) => format!("{}-lock", mode),
            MappingKind::Hold(modifier) => modifier.as_str().to_string(),
        }
    }
}

impl FromStr for MappingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        match lower.as_str() {
            "single" => return Ok(MappingKind::Single),
            "multi" => return Ok(MappingKind::Multi),
            _ => {}
        }
        if let Some(modifier) = Modifier::from_name(&lower) {
            return Ok(MappingKind::Hold(modifier));
        }
        if let Some((color, suffix)) = lower.rsplit_once('-') {
            if let Ok(mode) = color.parse::<Mode>() {
                match suffix {
                    "shift" => return Ok(MappingKind::Shift(mode)),
                    "lock" => return Ok(MappingKind::Lock(mode)),
                    _ => {}
                }
            }
        }
        Err(format!("Unknown mapping type: {}", s))
    }
}

/// The record for one (mode, key) cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyMapping {
    pub name: String,
    pub kind: MappingKind,
    pub strokes: Vec<Stroke>,
    pub repeat: bool,
    pub repeat_delay_ms: u32,
    /// Route this key's output over the remote link when one is connected.
    pub remote: bool,
    /// Transient: the physical key is currently down. Never persisted.
    pub held: bool,
}

/// One named device configuration, indexed by `[mode][key]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyMap {
    pub name: String,
    pub model: Model,
    pub keys: Vec<Vec<KeyMapping>>,
}

impl KeyMap {
    /// Create an empty keymap with every cell set to an unbound `Single`.
    pub fn new(name: impl Into<String>, model: Model) -> Self {
        Self {
            name: name.into(),
            model,
            keys: vec![vec![KeyMapping::default(); MAX_KEYS]; MAX_MODES],
        }
    }

    pub fn mapping(&self, mode: Mode, key: usize) -> Option<&KeyMapping> {
        if key >= self.model.max_keys() {
            return None;
        }
        self.keys.get(mode.index()).and_then(|row| row.get(key))
    }

    pub fn mapping_mut(&mut self, mode: Mode, key: usize) -> Option<&mut KeyMapping> {
        if key >= self.model.max_keys() {
            return None;
        }
        self.keys.get_mut(mode.index()).and_then(|row| row.get_mut(key))
    }

    /// Set the `held` flag for `key` in every mode.
    ///
    /// Held state tracks the physical key, which is the same whatever the
    /// mode, so all rows are kept in step.
    pub fn set_held(&mut self, key: usize, held: bool) {
        for row in &mut self.keys {
            if let Some(cell) = row.get_mut(key) {
                cell.held = held;
            }
        }
    }

    pub fn is_held(&self, key: usize) -> bool {
        self.keys
            .first()
            .and_then(|row| row.get(key))
            .map(|cell| cell.held)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_kind_names() {
        for kind in [
            MappingKind::Single,
            MappingKind::Multi,
            MappingKind::Shift(Mode::Blue),
            MappingKind::Lock(Mode::Red),
            MappingKind::Hold(Modifier::Control),
        ] {
            assert_eq!(kind.name().parse::<MappingKind>().unwrap(), kind);
        }
        assert_eq!(
            "normal-shift".parse::<MappingKind>().unwrap(),
            MappingKind::Shift(Mode::Normal)
        );
        assert!("purple-lock".parse::<MappingKind>().is_err());
    }

    #[test]
    fn test_modifier_bits_match_legacy_mask() {
        let mods: Modifiers = "shift+control+alt".parse().unwrap();
        assert_eq!(mods.bits(), 1 | 4 | 8);
        assert_eq!(Modifiers::from_bits(0xff).bits(), 13);
        assert_eq!(mods.to_string(), "shift+control+alt");
        assert!("shift+hyper".parse::<Modifiers>().is_err());
    }

    #[test]
    fn test_keymap_bounds_follow_model() {
        let map = KeyMap::new("n50", Model::N50);
        assert!(map.mapping(Mode::Normal, 13).is_some());
        assert!(map.mapping(Mode::Normal, 14).is_none());

        let map = KeyMap::new("n52", Model::N52);
        assert!(map.mapping(Mode::Red, 22).is_some());
        assert!(map.mapping(Mode::Red, 23).is_none());
    }

    #[test]
    fn test_carry_transient_from() {
        let mut old = Config {
            configs: vec![KeyMap::new("a", Model::N52)],
            ..Default::default()
        };
        old.configs[0].set_held(4, true);

        let mut new = Config {
            configs: vec![KeyMap::new("a", Model::N52)],
            ..Default::default()
        };
        new.carry_transient_from(&old);

        assert!(new.configs[0].is_held(4));
        assert!(!new.configs[0].is_held(5));
    }

    #[test]
    fn test_active_falls_back_to_first() {
        let mut config = Config {
            configs: vec![KeyMap::new("first", Model::N50)],
            ..Default::default()
        };
        config.global.current_config = 7;
        assert_eq!(config.active().unwrap().name, "first");
    }

    #[test]
    fn test_network_changed_ignores_server() {
        let old = Config::default();
        let mut new = old.clone();
        new.global.network.server = "desk.lan".to_string();
        assert!(!old.network_changed(&new));

        new.global.network.port = 8001;
        assert!(old.network_changed(&new));

        let mut enabled = old.clone();
        enabled.global.network.enabled = true;
        assert!(old.network_changed(&enabled));
    }
}
