use thiserror::Error;

/// Result type for PartSeg operations
pub type Result<T> = std::result::Result<T, PartSegError>;

/// Errors that can occur while loading, saving or driving a PartSeg project
#[derive(Error, Debug)]
pub enum PartSegError {
    #[error("Corrupt project archive: {0}")]
    CorruptArchive(String),

    #[error("Invalid value for parameter `{field}`: {reason}")]
    ParameterValidation { field: String, reason: String },

    #[error("Unsupported parameter version {version} for algorithm `{algorithm}`")]
    UnsupportedVersion { algorithm: String, version: String },

    #[error("Unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Algorithm name already registered: {0}")]
    DuplicateName(String),

    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Nothing to save: project has no {0}")]
    MissingData(&'static str),

    #[error("Image codec error: {0}")]
    Image(String),

    #[error("Array bundle error: {0}")]
    Npz(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Algorithm failed: {0}")]
    Algorithm(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Background task failed: {0}")]
    Background(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartSegError {
    /// Shorthand for a validation failure on `field`
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParameterValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error means persisted state is malformed or incomplete
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptArchive(_) | Self::Image(_) | Self::Npz(_) | Self::Json(_)
        )
    }

    /// Returns true if the error comes from misuse of the algorithm registry
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::UnknownAlgorithm(_) | Self::DuplicateName(_))
    }

    /// Offending field of a validation error
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::ParameterValidation { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Rewrites archive-level failures so that any structural problem is
    /// reported as a corrupt archive
    pub(crate) fn into_corrupt(self, member: &str) -> Self {
        match self {
            Self::CorruptArchive(_) => self,
            Self::Image(reason) | Self::Npz(reason) | Self::Json(reason) => {
                Self::CorruptArchive(format!("{member}: {reason}"))
            }
            Self::Io(err) => Self::CorruptArchive(format!("{member}: {err}")),
            Self::ShapeMismatch { expected, found } => Self::CorruptArchive(format!(
                "{member}: shape {found:?} does not match {expected:?}"
            )),
            other => other,
        }
    }
}

impl From<tiff::TiffError> for PartSegError {
    fn from(err: tiff::TiffError) -> Self {
        Self::Image(err.to_string())
    }
}

impl From<ndarray_npy::ReadNpzError> for PartSegError {
    fn from(err: ndarray_npy::ReadNpzError) -> Self {
        Self::Npz(err.to_string())
    }
}

impl From<ndarray_npy::WriteNpzError> for PartSegError {
    fn from(err: ndarray_npy::WriteNpzError) -> Self {
        Self::Npz(err.to_string())
    }
}

impl From<serde_json::Error> for PartSegError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
