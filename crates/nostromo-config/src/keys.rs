//! Key name resolution for stroke codes
//!
//! Strokes store raw evdev codes. In the keymap file a code may be written
//! either as an integer or as a name such as `"A"`, `"Enter"` or
//! `"KEY_VOLUMEUP"`.

use std::str::FromStr;

use evdev::Key;

/// Names that do not follow the `KEY_<NAME>` pattern directly.
const ALIASES: &[(&str, Key)] = &[
    ("ESCAPE", Key::KEY_ESC),
    ("RETURN", Key::KEY_ENTER),
    ("BKSP", Key::KEY_BACKSPACE),
    ("CAPS", Key::KEY_CAPSLOCK),
    ("CTRL", Key::KEY_LEFTCTRL),
    ("LCTRL", Key::KEY_LEFTCTRL),
    ("RCTRL", Key::KEY_RIGHTCTRL),
    ("SHIFT", Key::KEY_LEFTSHIFT),
    ("LSHIFT", Key::KEY_LEFTSHIFT),
    ("RSHIFT", Key::KEY_RIGHTSHIFT),
    ("ALT", Key::KEY_LEFTALT),
    ("LALT", Key::KEY_LEFTALT),
    ("RALT", Key::KEY_RIGHTALT),
    ("SUPER", Key::KEY_LEFTMETA),
    ("META", Key::KEY_LEFTMETA),
    ("PGUP", Key::KEY_PAGEUP),
    ("PGDN", Key::KEY_PAGEDOWN),
    ("INS", Key::KEY_INSERT),
    ("DEL", Key::KEY_DELETE),
    ("-", Key::KEY_MINUS),
    ("=", Key::KEY_EQUAL),
    ("[", Key::KEY_LEFTBRACE),
    ("]", Key::KEY_RIGHTBRACE),
    (";", Key::KEY_SEMICOLON),
    ("'", Key::KEY_APOSTROPHE),
    ("`", Key::KEY_GRAVE),
    ("\\", Key::KEY_BACKSLASH),
    (",", Key::KEY_COMMA),
    (".", Key::KEY_DOT),
    ("PERIOD", Key::KEY_DOT),
    ("/", Key::KEY_SLASH),
];

/// Resolve a key name to an evdev key.
///
/// Lookup is case-insensitive. Aliases are tried first, then the name is
/// looked up as `KEY_<NAME>` (so `"a"`, `"f12"` and `"space"` work), and
/// finally as a raw `KEY_*` identifier.
pub fn parse_key(name: &str) -> Option<Key> {
    let upper = name.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }

    if let Some((_, key)) = ALIASES.iter().find(|(alias, _)| *alias == upper) {
        return Some(*key);
    }

    if upper.starts_with("KEY_") {
        return Key::from_str(&upper).ok();
    }

    Key::from_str(&format!("KEY_{}", upper)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_names() {
        assert_eq!(parse_key("a"), Some(Key::KEY_A));
        assert_eq!(parse_key("F12"), Some(Key::KEY_F12));
        assert_eq!(parse_key("Escape"), Some(Key::KEY_ESC));
        assert_eq!(parse_key("space"), Some(Key::KEY_SPACE));
        assert_eq!(parse_key("KEY_VOLUMEUP"), Some(Key::KEY_VOLUMEUP));
        assert_eq!(parse_key("["), Some(Key::KEY_LEFTBRACE));
    }

    #[test]
    fn test_parse_key_unknown() {
        assert_eq!(parse_key("NotAKey"), None);
        assert_eq!(parse_key(""), None);
    }
}
