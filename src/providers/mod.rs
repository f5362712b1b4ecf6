use crate::config::AccountConfig;
use native_tls::Error as TlsError;
use thiserror::Error;

pub mod pop3;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("pop3 error: {0}")]
    Protocol(String),
    #[error("unexpected provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Connection-class failures skip the whole account; anything else only
    /// aborts the current mailbox loop.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ProviderError::Authentication(_) | ProviderError::Network(_) | ProviderError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(value.to_string())
            }
            _ => Self::Network(value.to_string()),
        }
    }
}

impl From<TlsError> for ProviderError {
    fn from(value: TlsError) -> Self {
        Self::Network(value.to_string())
    }
}

/// Result of `STAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailboxStat {
    pub count: usize,
    pub size: u64,
}

/// One line of the server's positional identifier listing. Positions start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub position: usize,
    pub identifier: String,
}

impl Listing {
    pub fn new(position: usize, identifier: impl Into<String>) -> Self {
        Self {
            position,
            identifier: identifier.into(),
        }
    }
}

/// An open, authenticated session against one account's maildrop.
///
/// Sessions are released through [`Mailbox::close`]; callers must invoke it on
/// every exit path rather than relying on drop.
pub trait Mailbox {
    fn stat(&mut self) -> Result<MailboxStat, ProviderError>;

    fn list_identifiers(&mut self) -> Result<Vec<Listing>, ProviderError>;

    /// Returns the raw message at `position`.
    fn retrieve(&mut self, position: usize) -> Result<Vec<u8>, ProviderError>;

    /// Marks `position` for deletion; committed when the session closes.
    fn delete(&mut self, position: usize) -> Result<(), ProviderError>;

    /// Undoes server-side state changes made so far in this session.
    fn reset(&mut self) -> Result<(), ProviderError>;

    fn close(self) -> Result<(), ProviderError>;
}

/// Opens sessions. Connection-class errors mean the account should be skipped.
pub trait Connector {
    type Session: Mailbox + Send;

    fn connect(&self, account: &AccountConfig) -> Result<Self::Session, ProviderError>;
}
