use storage::StorageError;

/// Errors produced by the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The digest string is not a valid `<algo>:<hex>` pair.
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    /// A locator field failed sanitization.
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    /// The label has no binding for the requested host/name.
    #[error("label {label:?} not found for {host}/{name}")]
    LabelNotFound {
        host: String,
        name: String,
        label: String,
    },

    /// The underlying filesystem failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A stored metadata document could not be decoded.
    #[error("decode {path}: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },

    /// A metadata document could not be encoded.
    #[error("encode metadata: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StoreError {
    /// Whether this error represents a missing resource. Used as control
    /// flow by the front-ends: a cache miss falls through to the upstream.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::Storage(err) => err.is_not_found(),
            StoreError::LabelNotFound { .. } => true,
            _ => false,
        }
    }
}
