use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObserverError {
    /// Connection dropped or could not be established; retried after the
    /// reconnect delay
    #[error("Live channel error: {0}")]
    Channel(String),

    /// Session token rejected; the token has been discarded
    #[error("Session token rejected, re-authentication required")]
    Unauthorized,

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ObserverError {
    /// Whether the reconnect loop keeps going after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, ObserverError::Channel(_))
    }
}
