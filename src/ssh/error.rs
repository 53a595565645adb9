//! SSH Error types

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Classify a failed TCP connect to `endpoint`
    pub fn from_connect_io(err: io::Error, endpoint: &str) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => {
                SshError::ConnectionRefused(format!("{}: {}", endpoint, err))
            }
            io::ErrorKind::TimedOut => SshError::Timeout(format!("{}: {}", endpoint, err)),
            _ => SshError::HostUnreachable(format!("{}: {}", endpoint, err)),
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            russh::Error::IO(e) => SshError::IoError(e),
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
