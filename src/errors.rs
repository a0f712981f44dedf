use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the saliency pipeline.
///
/// Each variant captures context specific to its error domain (filesystem,
/// image processing, model operations, etc.), providing diagnostic
/// information without requiring callers to parse error strings.
#[derive(Error, Debug)]
pub enum SalObjError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SalObjError>;

impl From<anyhow::Error> for SalObjError {
    fn from(err: anyhow::Error) -> Self {
        SalObjError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Code that has context should construct `SalObjError::FileSystem` directly
/// with the specific path and operation; this conversion is the fallback.
impl From<std::io::Error> for SalObjError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for SalObjError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for SalObjError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors occur during tensor operations which are part of the sample
/// assembly and inference path, so they're categorized as model errors
/// rather than a separate tensor error type.
impl From<ndarray::ShapeError> for SalObjError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}
