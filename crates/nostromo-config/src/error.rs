use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to parse KDL")]
    #[diagnostic(code(nostromo::config::parse_error))]
    ParseError {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source]
        source: kdl::KdlError,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(nostromo::config::invalid))]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    #[diagnostic(code(nostromo::config::missing_field))]
    MissingField { field: String },

    #[error("Unknown key: {key}")]
    #[diagnostic(
        code(nostromo::config::unknown_key),
        help("use an evdev code, a name like \"A\" or \"Enter\", or a KEY_* identifier")
    )]
    UnknownKey { key: String },

    #[error("Key {key} is out of range for model {model} ({max} keys)")]
    #[diagnostic(code(nostromo::config::key_out_of_range))]
    KeyOutOfRange {
        key: i64,
        model: String,
        max: usize,
    },

    #[error("Key {key} in mode {mode} has {count} strokes (limit {limit})")]
    #[diagnostic(code(nostromo::config::too_many_strokes))]
    TooManyStrokes {
        key: usize,
        mode: String,
        count: usize,
        limit: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
