use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid path pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("Analysis of {file} failed: {message}")]
    Analysis { file: String, message: String },

    #[error("Cannot resolve source '{source_id}': {message}")]
    PathResolution { source_id: String, message: String },

    #[error("Instrumentation of {file} failed: {message}")]
    Instrumentation { file: String, message: String },

    #[error("Module load depth {depth} exceeded while loading '{module}'")]
    RecursionLimitExceeded { module: String, depth: usize },

    #[error("Block {block} in {file} has inconsistent relationships: {message}")]
    RelationshipInconsistency {
        file: String,
        block: u32,
        message: String,
    },

    #[error("Coverage store could not be initialized: {0}")]
    StoreInit(String),

    #[error("{0}")]
    Other(String),
}

impl CoverageError {
    /// Whether the failure can be contained to a single file or event.
    /// Only a store that cannot be initialized stops the whole session.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CoverageError::StoreInit(_))
    }

    /// Short phase label used as a structured logging field.
    #[must_use]
    pub fn phase(&self) -> &'static str {
        match self {
            CoverageError::Io(_) => "io",
            CoverageError::Sqlite(_) => "cache",
            CoverageError::Json(_) => "serialize",
            CoverageError::Pattern(_) => "config",
            CoverageError::Analysis { .. } => "analysis",
            CoverageError::PathResolution { .. } => "resolve",
            CoverageError::Instrumentation { .. } => "instrument",
            CoverageError::RecursionLimitExceeded { .. } => "load",
            CoverageError::RelationshipInconsistency { .. } => "blocks",
            CoverageError::StoreInit(_) => "init",
            CoverageError::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoverageError>;
