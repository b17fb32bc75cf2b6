use std::path::PathBuf;
use thiserror::Error;

/// Failure to turn a backing file into a table. Callers of `loader::load`
/// never see this; it degrades to an empty table.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: expected {expected} fields, saw {found}")]
    RaggedRow { line: u64, expected: usize, found: usize },
    #[error("required column '{0}' not found in header")]
    MissingColumn(&'static str),
}

/// Broad classification of a failed query, used to pick a status/exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadInput,
    DataNotReady,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredictError {
    #[error("Invalid rank '{0}': expected an integer")]
    BadRequest(String),
    #[error("Dataset could not be loaded")]
    DataUnavailable,
    #[error("Category {0} not found in dataset")]
    UnknownCategory(String),
}

impl PredictError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PredictError::BadRequest(_) => ErrorClass::BadInput,
            PredictError::DataUnavailable => ErrorClass::DataNotReady,
            PredictError::UnknownCategory(_) => ErrorClass::NotFound,
        }
    }

    /// HTTP-style status for the error. `NotFound` keeps its own class (and CLI
    /// exit code) but reports 400, the status the web service used for it.
    pub fn status(&self) -> u16 {
        match self.class() {
            ErrorClass::BadInput | ErrorClass::NotFound => 400,
            ErrorClass::DataNotReady => 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("'{file_name}' rejected: expected a .{expected} file")]
    BadExtension { file_name: String, expected: String },
    #[error("uploaded data rejected: {0}")]
    Invalid(#[from] LoadError),
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("failed to store uploaded data at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
