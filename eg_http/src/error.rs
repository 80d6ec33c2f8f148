use reqwest::header::InvalidHeaderValue;

/// Failure of a convenience request helper
///
/// Construction failures happen before anything is sent or measured. Transport
/// failures carry the wrapped transport's error unchanged.
#[derive(Debug, thiserror::Error)]
pub enum RequestError<E> {
    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error(transparent)]
    Transport(E),
}

impl<E> RequestError<E> {
    /// The transport error, if the request was actually launched
    pub fn transport(&self) -> Option<&E> {
        match self {
            RequestError::Transport(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_transport(self) -> Option<E> {
        match self {
            RequestError::Transport(e) => Some(e),
            _ => None,
        }
    }
}
