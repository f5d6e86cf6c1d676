//! KDL keymap parser

use std::path::Path;

use crate::error::ConfigError;
use crate::keys::parse_key;
use crate::model::*;

/// Parse a keymap file from the given path
///
/// # Errors
///
/// [`ConfigError::Io`] if the file cannot be read, otherwise as for
/// [`parse_config_str`].
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse a keymap from a string
///
/// # Errors
///
/// [`ConfigError::ParseError`] for KDL syntax errors. The other variants
/// report a keymap that is well-formed KDL but not a valid keymap, such as
/// a key out of range for the model or an unknown key name.
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc: kdl::KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // kdl carries its own miette version, so rebuild the span by hand
        let span = miette::SourceSpan::from((e.span.offset(), e.span.len()));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "log-level" => {
                let val = required_string_arg(node, "log-level")?;
                config.global.log_level = val
                    .parse()
                    .map_err(|message| ConfigError::Invalid { message })?;
            }
            "network" => {
                config.global.network = parse_network(node)?;
            }
            "current-config" => {
                config.global.current_config = required_int_arg(node, "current-config")?;
            }
            "start-mode" => {
                let val = required_string_arg(node, "start-mode")?;
                config.global.start_mode = val
                    .parse()
                    .map_err(|message| ConfigError::Invalid { message })?;
            }
            "light-show" => {
                config.global.light_show = node
                    .entries()
                    .first()
                    .and_then(|e| e.value().as_bool())
                    .ok_or_else(|| ConfigError::Invalid {
                        message: "light-show expects true or false".to_string(),
                    })?;
            }
            "config" => {
                config.configs.push(parse_keymap(node)?);
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    if config.configs.is_empty() {
        return Err(ConfigError::MissingField {
            field: "config (e.g., `config \"Default\" model=\"n52\" { ... }`)".to_string(),
        });
    }

    if config.global.current_config >= config.configs.len() {
        tracing::warn!(
            "current-config {} is out of range ({} config(s)), using the first",
            config.global.current_config,
            config.configs.len()
        );
        config.global.current_config = 0;
    }

    Ok(config)
}

// ============================================================================
// Entry helpers
// ============================================================================

/// Positional argument at `index` (properties are skipped).
fn arg(node: &kdl::KdlNode, index: usize) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .nth(index)
        .map(|e| e.value())
}

/// Named property `key=value`.
fn prop<'a>(node: &'a kdl::KdlNode, key: &str) -> Option<&'a kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value() == key).unwrap_or(false))
        .map(|e| e.value())
}

fn required_string_arg<'a>(node: &'a kdl::KdlNode, what: &str) -> Result<&'a str, ConfigError> {
    arg(node, 0)
        .and_then(|v| v.as_string())
        .ok_or_else(|| ConfigError::MissingField {
            field: format!("{} value", what),
        })
}

fn required_int_arg<T: TryFrom<i64>>(node: &kdl::KdlNode, what: &str) -> Result<T, ConfigError> {
    let raw = arg(node, 0)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ConfigError::MissingField {
            field: format!("{} value", what),
        })?;
    to_int(raw, what)
}

fn to_int<T: TryFrom<i64>>(raw: i64, what: &str) -> Result<T, ConfigError> {
    T::try_from(raw).map_err(|_| ConfigError::Invalid {
        message: format!("{} value {} is out of range", what, raw),
    })
}

fn int_prop<T: TryFrom<i64>>(
    node: &kdl::KdlNode,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match prop(node, key) {
        None => Ok(default),
        Some(value) => {
            let raw = value.as_i64().ok_or_else(|| ConfigError::Invalid {
                message: format!("{} must be an integer", key),
            })?;
            to_int(raw, key)
        }
    }
}

fn bool_prop(node: &kdl::KdlNode, key: &str) -> Result<bool, ConfigError> {
    match prop(node, key) {
        None => Ok(false),
        Some(value) => value.as_bool().ok_or_else(|| ConfigError::Invalid {
            message: format!("{} must be true or false", key),
        }),
    }
}

// ============================================================================
// Sections
// ============================================================================

fn parse_network(node: &kdl::KdlNode) -> Result<NetworkConfig, ConfigError> {
    let defaults = NetworkConfig::default();
    Ok(NetworkConfig {
        enabled: bool_prop(node, "enabled")?,
        port: int_prop(node, "port", defaults.port)?,
        server: prop(node, "server")
            .and_then(|v| v.as_string())
            .map(str::to_string)
            .unwrap_or(defaults.server),
    })
}

fn parse_keymap(node: &kdl::KdlNode) -> Result<KeyMap, ConfigError> {
    let name = arg(node, 0)
        .and_then(|v| v.as_string())
        .ok_or_else(|| ConfigError::MissingField {
            field: "config name (e.g., `config \"Game\" { ... }`)".to_string(),
        })?;

    let model = match prop(node, "model").and_then(|v| v.as_string()) {
        Some(val) => val
            .parse()
            .map_err(|message| ConfigError::Invalid { message })?,
        None => Model::default(),
    };

    let mut keymap = KeyMap::new(name, model);
    let mut seen_modes = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "mode" => {
                    let mode = parse_mode_header(child)?;
                    if seen_modes.contains(&mode) {
                        return Err(ConfigError::Invalid {
                            message: format!("Config '{}' defines mode {} twice", name, mode),
                        });
                    }
                    seen_modes.push(mode);
                    parse_mode(child, mode, &mut keymap)?;
                }
                other => {
                    tracing::warn!("Unknown config option in '{}': {}", name, other);
                }
            }
        }
    }

    Ok(keymap)
}

/// A mode is named (`mode "blue"`) or numbered (`mode 1`).
fn parse_mode_header(node: &kdl::KdlNode) -> Result<Mode, ConfigError> {
    let value = arg(node, 0).ok_or_else(|| ConfigError::MissingField {
        field: "mode name".to_string(),
    })?;
    if let Some(name) = value.as_string() {
        return name
            .parse()
            .map_err(|message| ConfigError::Invalid { message });
    }
    value
        .as_i64()
        .and_then(|i| usize::try_from(i).ok())
        .and_then(Mode::from_index)
        .ok_or_else(|| ConfigError::Invalid {
            message: format!("Invalid mode: {}", value),
        })
}

fn parse_mode(node: &kdl::KdlNode, mode: Mode, keymap: &mut KeyMap) -> Result<(), ConfigError> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    let mut seen_keys = Vec::new();

    for child in children.nodes() {
        if child.name().value() != "key" {
            tracing::warn!("Unknown mode option: {}", child.name().value());
            continue;
        }

        let raw_index = arg(child, 0)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ConfigError::MissingField {
                field: "key index (e.g., `key 3 type=\"single\"`)".to_string(),
            })?;

        let max = keymap.model.max_keys();
        let index = usize::try_from(raw_index)
            .ok()
            .filter(|i| *i < max)
            .ok_or_else(|| ConfigError::KeyOutOfRange {
                key: raw_index,
                model: keymap.model.to_string(),
                max,
            })?;

        if seen_keys.contains(&index) {
            return Err(ConfigError::Invalid {
                message: format!("Key {} is defined twice in mode {}", index, mode),
            });
        }
        seen_keys.push(index);

        let mapping = parse_key_mapping(child, mode, index)?;
        if let Some(cell) = keymap.mapping_mut(mode, index) {
            *cell = mapping;
        }
    }

    Ok(())
}

fn parse_key_mapping(node: &kdl::KdlNode, mode: Mode, index: usize) -> Result<KeyMapping, ConfigError> {
    let kind = match prop(node, "type").and_then(|v| v.as_string()) {
        Some(val) => val
            .parse()
            .map_err(|message| ConfigError::Invalid { message })?,
        None => MappingKind::Single,
    };

    let mut mapping = KeyMapping {
        name: prop(node, "name")
            .and_then(|v| v.as_string())
            .unwrap_or_default()
            .to_string(),
        kind,
        strokes: Vec::new(),
        repeat: bool_prop(node, "repeat")?,
        repeat_delay_ms: int_prop(node, "repeat-delay", 0)?,
        remote: bool_prop(node, "remote")?,
        held: false,
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "stroke" => mapping.strokes.push(parse_stroke(child)?),
                other => tracing::warn!("Unknown key option: {}", other),
            }
        }
    }

    if mapping.strokes.len() > MAX_STROKES {
        return Err(ConfigError::TooManyStrokes {
            key: index,
            mode: mode.to_string(),
            count: mapping.strokes.len(),
            limit: MAX_STROKES,
        });
    }

    Ok(mapping)
}

fn parse_stroke(node: &kdl::KdlNode) -> Result<Stroke, ConfigError> {
    let kind: StrokeKind = match prop(node, "type").and_then(|v| v.as_string()) {
        Some(val) => val
            .parse()
            .map_err(|message| ConfigError::Invalid { message })?,
        None => StrokeKind::Key,
    };

    let code_value = prop(node, "code").ok_or_else(|| ConfigError::MissingField {
        field: "stroke code".to_string(),
    })?;

    let code = if let Some(raw) = code_value.as_i64() {
        to_int::<u16>(raw, "code")?
    } else if let Some(name) = code_value.as_string() {
        match kind {
            StrokeKind::Key => parse_key(name)
                .map(|k| k.code())
                .ok_or_else(|| ConfigError::UnknownKey {
                    key: name.to_string(),
                })?,
            StrokeKind::Mouse => {
                return Err(ConfigError::Invalid {
                    message: format!("Mouse stroke code must be a button number, got {:?}", name),
                })
            }
        }
    } else {
        return Err(ConfigError::Invalid {
            message: format!("Invalid stroke code: {}", code_value),
        });
    };

    let modifiers = match prop(node, "mods") {
        None => Modifiers::empty(),
        Some(value) => {
            if let Some(list) = value.as_string() {
                list.parse()
                    .map_err(|message| ConfigError::Invalid { message })?
            } else if let Some(bits) = value.as_i64() {
                Modifiers::from_bits(to_int(bits, "mods")?)
            } else {
                return Err(ConfigError::Invalid {
                    message: format!("Invalid stroke mods: {}", value),
                });
            }
        }
    };

    Ok(Stroke {
        kind,
        code,
        modifiers,
        delay_ms: int_prop(node, "delay", 0)?,
        label: prop(node, "label")
            .and_then(|v| v.as_string())
            .unwrap_or_default()
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log-level "debug"
network enabled=true port=9000 server="desk.local"
current-config 1
start-mode "blue"
light-show false

config "Desktop" model="n50" {
    mode "normal" {
        key 0 name="Copy" type="single" {
            stroke type="key" code="C" mods="control" label="^C"
        }
    }
}

config "Game" model="n52" {
    mode "normal" {
        key 0 name="Burst" type="multi" repeat=true repeat-delay=100 remote=true {
            stroke type="key" code=30 delay=0
            stroke type="mouse" code=1 delay=50
        }
        key 1 type="blue-shift"
        key 2 type="red-lock"
        key 3 type="alt"
        key 22 name="Wheel down" {
            stroke code="KEY_PAGEDOWN" mods=9
        }
    }
    mode 1 {
        key 0 type="normal-lock"
    }
}
"#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_config_str(SAMPLE).unwrap();

        assert_eq!(config.global.log_level, LogLevel::Debug);
        assert_eq!(
            config.global.network,
            NetworkConfig {
                enabled: true,
                port: 9000,
                server: "desk.local".to_string(),
            }
        );
        assert_eq!(config.global.current_config, 1);
        assert_eq!(config.global.start_mode, Mode::Blue);
        assert!(!config.global.light_show);
        assert_eq!(config.configs.len(), 2);

        let game = config.active().unwrap();
        assert_eq!(game.name, "Game");
        assert_eq!(game.model, Model::N52);

        let burst = game.mapping(Mode::Normal, 0).unwrap();
        assert_eq!(burst.kind, MappingKind::Multi);
        assert!(burst.repeat);
        assert!(burst.remote);
        assert_eq!(burst.repeat_delay_ms, 100);
        assert_eq!(burst.strokes.len(), 2);
        assert_eq!(burst.strokes[0], Stroke::key(30));
        assert_eq!(burst.strokes[1], Stroke::mouse(1).with_delay(50));

        assert_eq!(
            game.mapping(Mode::Normal, 1).unwrap().kind,
            MappingKind::Shift(Mode::Blue)
        );
        assert_eq!(
            game.mapping(Mode::Normal, 2).unwrap().kind,
            MappingKind::Lock(Mode::Red)
        );
        assert_eq!(
            game.mapping(Mode::Normal, 3).unwrap().kind,
            MappingKind::Hold(Modifier::Alt)
        );
        assert_eq!(
            game.mapping(Mode::Blue, 0).unwrap().kind,
            MappingKind::Lock(Mode::Normal)
        );

        let wheel = game.mapping(Mode::Normal, 22).unwrap();
        assert_eq!(wheel.strokes[0].code, evdev::Key::KEY_PAGEDOWN.code());
        assert_eq!(wheel.strokes[0].modifiers.bits(), 9);

        let desktop = &config.configs[0];
        let copy = desktop.mapping(Mode::Normal, 0).unwrap();
        assert_eq!(copy.strokes[0].code, evdev::Key::KEY_C.code());
        assert!(copy.strokes[0].modifiers.contains(Modifier::Control));
        assert_eq!(copy.strokes[0].label, "^C");
    }

    #[test]
    fn test_unmapped_cells_default_to_empty_single() {
        let config = parse_config_str(SAMPLE).unwrap();
        let cell = config.configs[1].mapping(Mode::Green, 5).unwrap();
        assert_eq!(cell, &KeyMapping::default());
    }

    #[test]
    fn test_key_out_of_range_for_model() {
        let kdl = r#"
config "Small" model="n50" {
    mode "normal" {
        key 14 type="single"
    }
}
"#;
        let err = parse_config_str(kdl).unwrap_err();
        assert!(matches!(err, ConfigError::KeyOutOfRange { key: 14, max: 14, .. }));
    }

    #[test]
    fn test_too_many_strokes() {
        let strokes = "stroke code=30\n".repeat(MAX_STROKES + 1);
        let kdl = format!(
            "config \"Big\" {{\n mode \"normal\" {{\n key 0 type=\"multi\" {{\n{}}}\n}}\n}}\n",
            strokes
        );
        let err = parse_config_str(&kdl).unwrap_err();
        assert!(matches!(err, ConfigError::TooManyStrokes { count: 33, .. }));
    }

    #[test]
    fn test_unknown_key_name() {
        let kdl = r#"
config "X" {
    mode "normal" {
        key 0 {
            stroke code="Hyperspace"
        }
    }
}
"#;
        let err = parse_config_str(kdl).unwrap_err();
        match err {
            ConfigError::UnknownKey { key } => assert_eq!(key, "Hyperspace"),
            other => panic!("Expected UnknownKey, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let kdl = r#"
config "X" {
    mode "normal" {
        key 0 type="single"
        key 0 type="multi"
    }
}
"#;
        assert!(matches!(
            parse_config_str(kdl),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_missing_config_block() {
        let err = parse_config_str("log-level \"info\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn test_invalid_mapping_type() {
        let kdl = r#"
config "X" {
    mode "normal" {
        key 0 type="purple-shift"
    }
}
"#;
        let err = parse_config_str(kdl).unwrap_err();
        match err {
            ConfigError::Invalid { message } => assert!(message.contains("purple-shift")),
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_kdl_syntax_error_has_span() {
        let err = parse_config_str("config \"X\" {\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_current_config_out_of_range_resets() {
        let kdl = "current-config 5\nconfig \"Only\" {}\n";
        let config = parse_config_str(kdl).unwrap();
        assert_eq!(config.global.current_config, 0);
    }
}
