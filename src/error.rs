//! The error taxonomy shared by every layer of the crate.
//!
//! Five failure classes cover the whole system: an id nobody knows
//! ([`NotFound`]), a reference a backend cannot promote
//! ([`UnsupportedReference`]), the wrapped storage technology misbehaving
//! ([`Backend`]), the version index misbehaving ([`Repository`]), and the
//! caller asking for a backend or capability that was never configured
//! ([`Config`]). Underlying `git2`, `rusqlite`, `serde_json` and I/O errors
//! are attached as sources where they are wrapped; there are no blanket
//! `From` conversions, so an I/O error can never be misfiled under the
//! wrong class.
//!
//! [`NotFound`]: VaultError::NotFound
//! [`UnsupportedReference`]: VaultError::UnsupportedReference
//! [`Backend`]: VaultError::Backend
//! [`Repository`]: VaultError::Repository
//! [`Config`]: VaultError::Config

use thiserror::Error;

use crate::storage::ReferenceType;

type Source = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by storage backends, the orchestrator, the history
/// reconciler and the version repository.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The storage id (or its metadata record) is unknown to the backend.
    #[error("version {id} not found in {backend} storage")]
    NotFound {
        /// Tag of the backend that was asked.
        backend: String,
        /// The unknown storage id.
        id: String,
    },

    /// The reference type is not one the backend can promote.
    #[error("unsupported reference type {reference_type} for {backend} storage")]
    UnsupportedReference {
        /// Tag of the backend that rejected the reference.
        backend: String,
        /// The rejected reference type.
        reference_type: ReferenceType,
    },

    /// The wrapped storage technology failed (filesystem, VCS command,
    /// changelist server).
    #[error("{backend} backend failure: {message}")]
    Backend {
        /// Tag of the failing backend.
        backend: String,
        /// What went wrong.
        message: String,
        /// Underlying error, when one exists.
        #[source]
        source: Option<Source>,
    },

    /// The version index failed to read or write.
    #[error("repository failure: {message}")]
    Repository {
        /// What went wrong.
        message: String,
        /// Underlying error, when one exists.
        #[source]
        source: Option<Source>,
    },

    /// An unknown backend name was requested, or a repository-only
    /// operation was called with no repository attached.
    #[error("configuration error: {message}")]
    Config {
        /// What was misconfigured.
        message: String,
    },
}

impl VaultError {
    pub fn not_found(backend: impl Into<String>, id: impl Into<String>) -> Self {
        VaultError::NotFound {
            backend: backend.into(),
            id: id.into(),
        }
    }

    pub fn unsupported_reference(
        backend: impl Into<String>,
        reference_type: ReferenceType,
    ) -> Self {
        VaultError::UnsupportedReference {
            backend: backend.into(),
            reference_type,
        }
    }

    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        VaultError::Backend {
            backend: backend.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn backend_with(
        backend: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        VaultError::Backend {
            backend: backend.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn repository(message: impl Into<String>) -> Self {
        VaultError::Repository {
            message: message.into(),
            source: None,
        }
    }

    pub fn repository_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        VaultError::Repository {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        VaultError::Config {
            message: message.into(),
        }
    }

    /// True for [`VaultError::NotFound`]; keeps call sites from matching
    /// the whole enum just to probe for a missing id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::NotFound { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VaultError>;
