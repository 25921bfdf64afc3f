use thiserror::Error;

/// Longest slice of a response body carried inside an error message.
pub const MAX_ERROR_BODY_LEN: usize = 512;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("requested resource was unauthorized or forbidden: {url} [{status}]")]
    Unauthorized { url: String, status: u16 },

    #[error("error making request to API: {url} [{status} - {body}]")]
    Request { url: String, status: u16, body: String },

    #[error("malformed response from stream {stream}: missing `{key}` in envelope")]
    MalformedResponse { stream: String, key: String },

    #[error("transaction receipt not found yet: {transaction}")]
    ReceiptPending { transaction: String },

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a [`Error::Request`] keeping only the head of the response body.
    pub fn request(url: impl Into<String>, status: u16, body: &str) -> Self {
        let body = match body.char_indices().nth(MAX_ERROR_BODY_LEN) {
            Some((idx, _)) => format!("{}...", &body[..idx]),
            None => body.to_string(),
        };

        Error::Request {
            url: url.into(),
            status,
            body,
        }
    }

    /// Connection failures and timeouts. A reqwest error that carries a
    /// status code is not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.status().is_none(),
            Error::Io(_) => true,
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, Error::ReceiptPending { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Validation(_)
                | Error::Unauthorized { .. }
                | Error::Request { .. }
                | Error::MalformedResponse { .. }
        )
    }

    /// HTTP status attached to the failure, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            Error::Unauthorized { status, .. } | Error::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}
