use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}.")]
    IoError(#[from] std::io::Error),

    #[error("No template or empty template: {url}")]
    EmptyTemplate { url: String },

    #[error("No engine registered for suffix '{suffix}'.")]
    MissingEngine { suffix: String },

    #[error("Failed to render. Original error: {0}")]
    EngineError(#[from] minijinja::Error),

    #[error("Failed to fetch '{url}'. Original error: {reason}")]
    FetchError { url: String, reason: String },

    #[error("Failed to parse markup: {0}.")]
    MarkupError(String),

    #[error("Template '{url}' is not available synchronously.")]
    NotReady { url: String },

    #[error("Template error: {0}.")]
    TemplateError(String),

    #[cfg(feature = "http")]
    #[error("HTTP request failed. Original error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl Error {
    /// Recovers an owned error from a shared rejection reason. The reason
    /// usually stays referenced by the rejected promise itself, so variants
    /// are rebuilt from their fields where possible; wrapped foreign errors
    /// are not cloneable and degrade to their rendered message.
    pub fn from_shared(reason: std::rc::Rc<Error>) -> Error {
        match std::rc::Rc::try_unwrap(reason) {
            Ok(error) => error,
            Err(shared) => match &*shared {
                Error::EmptyTemplate { url } => Error::EmptyTemplate { url: url.clone() },
                Error::MissingEngine { suffix } => {
                    Error::MissingEngine { suffix: suffix.clone() }
                }
                Error::FetchError { url, reason } => {
                    Error::FetchError { url: url.clone(), reason: reason.clone() }
                }
                Error::NotReady { url } => Error::NotReady { url: url.clone() },
                Error::MarkupError(message) => Error::MarkupError(message.clone()),
                Error::TemplateError(message) => Error::TemplateError(message.clone()),
                other => Error::TemplateError(other.to_string()),
            },
        }
    }
}

/// Convenience type alias for Results with vellum's Error as the error type.
///
/// # Type Parameters
/// * `T` - The type of the success value
pub type Result<T> = std::result::Result<T, Error>;
