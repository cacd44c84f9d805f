//! Error taxonomy for the reactor.
//!
//! Syscall failures stay [`std::io::Error`] inside the `os` module; they are
//! wrapped with the failing operation's name once they cross into the engine.
//! Would-block and interrupted conditions are never represented here - they
//! are control flow, classified by [`crate::os::is_would_block`] and
//! [`crate::os::is_interrupted`] before an error is ever constructed.

use std::io;

/// Errors surfaced by the engine.
///
/// Per-connection faults are absorbed by the poller/writer teardown path and
/// reach the application only through `Handler::on_removed` or a failed
/// synchronous send; this type is what those synchronous paths and the setup
/// entry points (`add_listener`, `connect`) return.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
  /// An OS call failed in a way that is fatal to the operation.
  #[error("{op} failed: {source}")]
  Io {
    op: &'static str,
    #[source]
    source: io::Error,
  },

  /// The TLS library rejected the connection (handshake or record layer).
  #[error("tls failure: {0}")]
  Tls(#[from] rustls::Error),

  /// A collaborator codec (Encoder/Decoder) reported a failure.
  #[error("codec failure: {0}")]
  Codec(String),

  /// A Handler hook reported a failure.
  #[error("handler failure: {0}")]
  Handler(String),

  /// The engine was configured with impossible values.
  #[error("invalid configuration: {0}")]
  Config(String),

  /// The peer misbehaved at the connection-establishment stage.
  #[error("handshake failed: {0}")]
  Handshake(String),

  /// A synchronous send was resolved with the failure sentinel: the channel
  /// closed while the reply was outstanding, or the timeout elapsed.
  #[error("send was not answered before the channel closed or timed out")]
  SendFailed,

  /// The engine is past the point of accepting new work.
  #[error("engine is shutting down")]
  ShuttingDown,
}

impl NetError {
  /// Wrap an [`io::Error`] with the name of the operation that produced it.
  pub fn io(op: &'static str, source: io::Error) -> NetError {
    NetError::Io { op, source }
  }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
