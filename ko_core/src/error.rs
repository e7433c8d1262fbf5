/// Core error type for kompost
///
/// Every variant maps to a stable `error_kind` tag surfaced to MCP clients;
/// see [`Error::kind`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Validation error at {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Unknown file id: {0}")]
    UnknownFileId(String),

    #[error("Path escapes the declared workspace roots: {0}")]
    OutsidePolicy(String),

    #[error("Failed to spawn {program}: {message}")]
    ExecSpawn { program: String, message: String },

    #[error("Command exited with status {code}: {stderr_tail}")]
    ExecFailed { code: i32, stderr_tail: String },

    #[error("Command exceeded its {limit_s}s deadline")]
    ExecTimeout { limit_s: u64 },

    #[error("Operation {op_id} exceeded its {limit_s}s deadline (estimated {estimate_s}s)")]
    Timeout {
        op_id: String,
        estimate_s: u64,
        limit_s: u64,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Komposition failed to compile: {0}")]
    PlanCompile(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a validation error for a specific field path
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable tag for the MCP result envelope
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "ValidationError",
            Error::UnknownFileId(_) => "UnknownFileId",
            Error::OutsidePolicy(_) => "OutsidePolicy",
            Error::ExecSpawn { .. } => "ExecSpawn",
            Error::ExecFailed { .. } => "ExecFailed",
            Error::ExecTimeout { .. } => "ExecTimeout",
            Error::Timeout { .. } => "Timeout",
            Error::Cancelled => "CancelledError",
            Error::Adapter(_) => "AdapterError",
            Error::PlanCompile(_) => "PlanCompileError",
            Error::Config(_) => "ConfigError",
            Error::NotFound(_) => "NotFound",
            Error::Io(_) => "IoError",
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
