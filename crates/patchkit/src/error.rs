use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Pattern not found for {0}")]
    PatternNotFound(String),

    #[error("Found {found} occurrence(s), {required} required")]
    InsufficientOccurrences { required: usize, found: usize },

    #[error("Failed to toggle write protection: {0}")]
    WriteProtectionToggleFailed(String),

    #[error("Failed to install redirect at {address:#x}: {message}")]
    RedirectInstallFailed { address: u64, message: String },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Invalid resolve target: {0}")]
    InvalidTarget(String),

    #[error("Key has not been resolved: {0}")]
    UnresolvedKey(String),

    #[error("Key already resolved: {0}")]
    DuplicateKey(String),

    #[error("Range {address:#x}+{len:#x} lies outside the module image")]
    OutOfImage { address: u64, len: usize },

    #[error("Request #{index} ({name}) failed: {source}")]
    RequestFailed {
        index: usize,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Unknown replacement function: {0}")]
    UnknownReplacement(String),

    #[error("Module already processed: {0}")]
    ModuleAlreadyProcessed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the resolver may recover from this error by trying another strategy
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SymbolNotFound(_))
    }

    /// Failures of the host platform itself. These abort a batch even when
    /// the request that hit them is optional.
    pub fn is_platform(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::WriteProtectionToggleFailed(_) | Error::RedirectInstallFailed { .. }
        )
    }

    /// The innermost error, looking through batch wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RequestFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
