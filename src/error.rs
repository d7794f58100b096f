use thiserror::Error;

/// Coordinate problems found while projecting or filtering.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),

    #[error("coordinate is not a finite number")]
    NonFinite,
}

/// Inconsistent filter input. Reported by `FilterState::validate`; the
/// predicate itself still evaluates (and rejects) instead of erroring.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("price range is inverted: min {min} > max {max}")]
    InvertedPriceRange { min: f64, max: f64 },

    #[error("radius must be a non-negative finite number of miles, got {0}")]
    InvalidRadius(f64),

    #[error("radius center is invalid: {0}")]
    InvalidCenter(#[from] GeoError),
}

/// Clustering index construction and lookup failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("invalid cluster options: {0}")]
    InvalidOptions(String),

    #[error("unknown cluster {0}")]
    UnknownCluster(String),
}

/// Failure reported by the annotation persistence collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("rejected by server: {0}")]
    Validation(String),
}

impl RemoteError {
    /// Only transport failures are worth offering a manual retry for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnnotationError {
    #[error("user {user} does not own annotation {id}")]
    Unauthorized { id: String, user: String },

    #[error("annotation {0} not found")]
    NotFound(String),

    #[error("invalid annotation: {0}")]
    Validation(String),

    #[error("annotation {0} has not been confirmed by the server yet")]
    Pending(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Key-value and file storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    Invalid(String),
}

/// Crate-wide error for setup paths (config, data loading, index options).
#[derive(Debug, Error)]
pub enum AtlasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Annotation(#[from] AnnotationError),
}

pub type Result<T, E = AtlasError> = std::result::Result<T, E>;
