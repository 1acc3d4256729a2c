// Client error types.
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures specific to the TLS upgrade.
#[derive(thiserror::Error, Debug)]
pub enum TlsError {
    #[error("Server does not support a secure connection")]
    ServerNotSecure,
    #[error("Server requires a secure connection")]
    SecureRequired,
    #[error("Server requires a client certificate")]
    ClientCertRequired,
    #[error("certificate verification failed: {0}")]
    Verification(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("invalid TLS configuration: {0}")]
    Config(String),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    #[error("timed out connecting to server")]
    ConnectTimeout,
    #[error("Stale Connection")]
    StaleConnection,
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("protocol error: {0}")]
    Protocol(#[from] tern_wire::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("invalid subject: {0}")]
    InvalidSubject(#[from] tern_subject::Error),
    #[error("payload of {size} bytes exceeds server maximum of {max}")]
    MaxPayloadExceeded { size: usize, max: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out")]
    Timeout,
}

impl Error {
    /// Errors that end a connection but leave the endpoint worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::ConnectTimeout | Self::StaleConnection => true,
            Self::Server(message) => !is_fatal_server_error(message),
            _ => false,
        }
    }
}

// -ERR texts after which the server closes the connection.
const FATAL_SERVER_ERRORS: &[&str] = &[
    "authorization violation",
    "authentication timeout",
    "parser error",
    "unknown protocol operation",
    "stale connection",
    "maximum payload",
    "maximum control line",
    "maximum connections",
    "secure connection",
];

/// Whether a `-ERR` description means the server is dropping the connection.
pub fn is_fatal_server_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    FATAL_SERVER_ERRORS
        .iter()
        .any(|fatal| lowered.contains(fatal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_server_errors() {
        assert!(is_fatal_server_error("Authorization Violation"));
        assert!(is_fatal_server_error("Maximum Payload Violation"));
        assert!(is_fatal_server_error("Secure Connection - TLS Required"));
        assert!(!is_fatal_server_error("Invalid Subject"));
        assert!(!is_fatal_server_error("Permissions Violation for Publish to foo"));
    }

    #[test]
    fn transient_errors_drive_reconnect() {
        assert!(Error::Connection(io::Error::from(io::ErrorKind::ConnectionReset)).is_transient());
        assert!(Error::StaleConnection.is_transient());
        assert!(Error::ConnectTimeout.is_transient());
        assert!(!Error::Tls(TlsError::ServerNotSecure).is_transient());
        assert!(!Error::Server("Authorization Violation".to_string()).is_transient());
        assert!(!Error::ConnectionClosed.is_transient());
    }

    #[test]
    fn tls_messages_are_stable() {
        assert_eq!(
            Error::Tls(TlsError::ServerNotSecure).to_string(),
            "Server does not support a secure connection"
        );
        assert_eq!(
            TlsError::ClientCertRequired.to_string(),
            "Server requires a client certificate"
        );
    }
}
