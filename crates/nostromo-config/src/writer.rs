//! KDL keymap writer
//!
//! Serializes a [`Config`] back into the format read by [`crate::parse_config`].
//! Only cells that differ from an unbound mapping are written, and the
//! transient `held` flag is never persisted.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::ConfigError;
use crate::model::*;

/// Quote a string for KDL.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn is_unbound(mapping: &KeyMapping) -> bool {
    mapping.name.is_empty()
        && mapping.kind == MappingKind::Single
        && mapping.strokes.is_empty()
        && !mapping.repeat
        && mapping.repeat_delay_ms == 0
        && !mapping.remote
}

/// Render the whole store as KDL text.
pub fn generate_config(config: &Config) -> String {
    let mut out = String::new();
    let global = &config.global;

    // Writing into a String cannot fail
    let _ = writeln!(out, "log-level {}", quote(global.log_level.as_str()));
    let _ = writeln!(
        out,
        "network enabled={} port={} server={}",
        global.network.enabled,
        global.network.port,
        quote(&global.network.server)
    );
    let _ = writeln!(out, "current-config {}", global.current_config);
    let _ = writeln!(out, "start-mode {}", quote(global.start_mode.as_str()));
    let _ = writeln!(out, "light-show {}", global.light_show);

    for keymap in &config.configs {
        out.push('\n');
        let _ = writeln!(
            out,
            "config {} model={} {{",
            quote(&keymap.name),
            quote(keymap.model.as_str())
        );
        for mode in Mode::ALL {
            let bound: Vec<(usize, &KeyMapping)> = (0..keymap.model.max_keys())
                .filter_map(|key| keymap.mapping(mode, key).map(|m| (key, m)))
                .filter(|(_, m)| !is_unbound(m))
                .collect();
            if bound.is_empty() {
                continue;
            }
            let _ = writeln!(out, "    mode {} {{", quote(mode.as_str()));
            for (key, mapping) in bound {
                write_mapping(&mut out, key, mapping);
            }
            out.push_str("    }\n");
        }
        out.push_str("}\n");
    }

    out
}

fn write_mapping(out: &mut String, key: usize, mapping: &KeyMapping) {
    let _ = write!(out, "        key {}", key);
    if !mapping.name.is_empty() {
        let _ = write!(out, " name={}", quote(&mapping.name));
    }
    let _ = write!(out, " type={}", quote(&mapping.kind.name()));
    if mapping.repeat {
        out.push_str(" repeat=true");
    }
    if mapping.repeat_delay_ms != 0 {
        let _ = write!(out, " repeat-delay={}", mapping.repeat_delay_ms);
    }
    if mapping.remote {
        out.push_str(" remote=true");
    }

    if mapping.strokes.is_empty() {
        out.push('\n');
        return;
    }

    out.push_str(" {\n");
    for stroke in &mapping.strokes {
        let _ = write!(
            out,
            "            stroke type={} code={}",
            quote(stroke.kind.as_str()),
            stroke.code
        );
        if !stroke.modifiers.is_empty() {
            let _ = write!(out, " mods={}", quote(&stroke.modifiers.to_string()));
        }
        if stroke.delay_ms != 0 {
            let _ = write!(out, " delay={}", stroke.delay_ms);
        }
        if !stroke.label.is_empty() {
            let _ = write!(out, " label={}", quote(&stroke.label));
        }
        out.push('\n');
    }
    out.push_str("        }\n");
}

/// Write the store to `path` atomically.
///
/// The rendered text is parsed back before anything touches the disk, then
/// written to a sibling temp file and renamed over the target. If any step
/// fails the original file is left as it was.
///
/// # Errors
///
/// A parse error if the rendered text does not read back, or
/// [`ConfigError::Io`] if the temp file cannot be written or renamed.
pub fn write_config(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let content = generate_config(config);

    content
        .parse::<kdl::KdlDocument>()
        .map_err(|e| ConfigError::Invalid {
            message: format!("Generated keymap is not valid KDL: {}", e),
        })?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("kdl.tmp");

    if let Err(e) = std::fs::write(&temp_path, &content) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    tracing::info!("Wrote keymap to {}", path.display());

    Ok(())
}
