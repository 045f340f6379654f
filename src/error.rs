use std::io;
use std::path::Path;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Debug, Error)]
pub enum PatchError {
    /// Caller input rejected before anything was written.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("anchor text not found in document body: {0:?}")]
    AnchorNotFound(String),

    #[error("extract {path}: {detail}")]
    Extraction { path: String, detail: String },

    #[error("package {path}: {detail}")]
    Packaging { path: String, detail: String },

    /// An expected marker (sheet data, dimension, body delimiters, ...) is missing.
    #[error("unexpected structure in {part}: {detail}")]
    Structural { part: String, detail: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("xml {part}: {source}")]
    Xml {
        part: String,
        #[source]
        source: quick_xml::Error,
    },

    #[error("package session already closed")]
    SessionClosed,
}

impl PatchError {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn structural(part: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Structural {
            part: part.into(),
            detail: detail.into(),
        }
    }

    pub fn packaging(path: impl Into<String>, detail: impl ToString) -> Self {
        Self::Packaging {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    pub fn extraction(path: &Path, detail: impl ToString) -> Self {
        Self::Extraction {
            path: path.display().to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::AnchorNotFound(_))
    }
}

/// Builds a `map_err` adapter that wraps an [`io::Error`] with a formatted context line.
pub fn io_context(context: impl Into<String>) -> impl FnOnce(io::Error) -> PatchError {
    let context = context.into();
    move |source| PatchError::Io { context, source }
}
