//! Error types for the tile quota engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tracking and enforcing tile quotas
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Attachment / Lookup Errors
    // =========================================================================
    /// Layer is not attached to the expiration policy
    #[error("Layer '{layer}' is not attached to expiration policy {policy}")]
    UnknownLayer { layer: String, policy: String },

    /// Gridset is not served by the layer
    #[error("Gridset '{gridset}' is not configured for layer '{layer}'")]
    UnknownGridSet { layer: String, gridset: String },

    /// Layer can't be attached (no quota, bad gridsets, name mismatch)
    #[error("Can't attach layer '{layer}': {reason}")]
    InvalidAttachment { layer: String, reason: String },

    /// Tile coordinate falls outside the gridset coverage
    #[error("Tile ({x}, {y}, {z}) is outside the coverage of gridset '{gridset}'")]
    TileOutOfCoverage {
        gridset: String,
        x: i64,
        y: i64,
        z: u32,
    },

    // =========================================================================
    // Page State Errors
    // =========================================================================
    /// No persisted page state exists yet
    #[error("No page state found at {0}")]
    PageStateNotFound(String),

    /// Persisted page state can't be decoded
    #[error("Corrupt page state in {source_name}: {reason}")]
    CorruptPageState { source_name: String, reason: String },

    // =========================================================================
    // Enforcement Errors
    // =========================================================================
    /// The truncation collaborator failed
    #[error("Truncation failed for layer '{layer}': {reason}")]
    TruncationFailed { layer: String, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Quota string can't be parsed
    #[error("Failed to parse quota: {0}")]
    QuotaParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error only means "nothing was persisted yet"
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::PageStateNotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
