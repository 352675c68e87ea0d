use thiserror::Error;

/// Problems with a request that are caught before anything is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("at least one page image is required")]
    NoPages,
    #[error("image `{name}` is empty")]
    EmptyImage { name: String },
    #[error("image `{name}` has an invalid content type `{content_type}`")]
    InvalidContentType { name: String, content_type: String },
}

impl ValidationError {
    pub fn empty_image(name: impl Into<String>) -> Self {
        Self::EmptyImage { name: name.into() }
    }

    pub fn invalid_content_type(name: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self::InvalidContentType {
            name: name.into(),
            content_type: content_type.into(),
        }
    }
}
