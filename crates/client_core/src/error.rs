use thiserror::Error;

/// Failure taxonomy for the synchronization core.
///
/// Transport problems are handled internally by reconnection and never
/// bubble out of the event pumps; the variants here cover the failures a
/// caller has to act on.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("gateway transport failure: {0}")]
    Transport(String),
    #[error("message send rejected: {0}")]
    Send(String),
    #[error("request failed: {0}")]
    Http(String),
    #[error("authentication rejected by server: {0}")]
    Auth(String),
    #[error("auth token missing; refusing to open a gateway connection")]
    MissingToken,
    #[error("not logged in: {0}")]
    NotLoggedIn(&'static str),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Http(err.to_string())
    }
}
