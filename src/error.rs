//! Crate-wide error taxonomy
//!
//! Each subsystem owns its own error enum (see [`crate::socket::SocketError`],
//! [`crate::auth::AuthError`], [`crate::directory::DirectoryError`],
//! [`crate::command::CommandError`], [`crate::storage::StorageError`]); this
//! module defines the umbrella type a caller several layers up — a binary, an
//! integration test — sees instead of matching on every intermediate enum.

use thiserror::Error;

/// Top-level error for anything exposed across a crate boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// A socket primitive was misused or the transport failed.
    #[error(transparent)]
    Socket(#[from] crate::socket::SocketError),

    /// The proxy engine could not be initialized or failed while running.
    #[error(transparent)]
    Proxy(#[from] crate::proxy::ProxyError),

    /// A broadcast/service composite could not be initialized or failed
    /// while running.
    #[error(transparent)]
    Composite(#[from] crate::composite::CompositeError),

    /// Authentication plane error (ZAP option construction, service failure).
    #[error(transparent)]
    Auth(#[from] crate::auth::AuthError),

    /// Connection-information directory error.
    #[error(transparent)]
    Directory(#[from] crate::directory::DirectoryError),

    /// Module-command subsystem error.
    #[error(transparent)]
    Command(#[from] crate::command::CommandError),

    /// Persistence layer error (process table, counter table, user table).
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    /// Message encode/decode error.
    #[error(transparent)]
    Message(#[from] crate::message::MessageError),

    /// Key material error (generation, Z85 decode).
    #[error(transparent)]
    Keys(#[from] crate::keys::KeyError),

    /// Configuration file could not be parsed into valid options.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Underlying I/O failure not otherwise classified.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the binaries.
pub type Result<T> = std::result::Result<T, Error>;
