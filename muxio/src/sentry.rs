//! Sentry: the per-connection state machine that drives a socket from "just
//! connected or accepted" to "fully usable".
//!
//! The variant set is closed and fixed at construction: plain TCP waits for
//! writability and checks SO_ERROR; TLS additionally runs the rustls
//! handshake, bouncing between read and write interest until the library
//! reports completion. Every transition happens on the owning poller thread,
//! so no sentry state is ever locked.

use std::sync::{Arc, Mutex};

use rustls::pki_types::ServerName;

use crate::channel::Channel;
use crate::error::{NetError, Result};
use crate::os;
use crate::protocol::{Protocol, TcpProtocol, TlsProtocol, TlsState};
use crate::tls::SockIo;

/// What a sentry asks of the event loop after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentryVerdict {
  NeedRead,
  NeedWrite,
  NeedBoth,
  Complete,
  Ignored,
}

/// Transport/side factory for sentries. One provider per listener or
/// connect call; the variant set is closed, like the sentries it builds.
#[derive(Clone)]
pub enum Provider {
  Tcp,
  TlsClient {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
  },
  TlsServer {
    config: Arc<rustls::ServerConfig>,
  },
}

impl Provider {
  pub(crate) fn create(&self, channel: &Arc<Channel>) -> Result<Sentry> {
    match self {
      Provider::Tcp => Ok(Sentry::Tcp(TcpSentry { channel: channel.clone() })),
      Provider::TlsClient { config, server_name } => {
        let conn = rustls::ClientConnection::new(config.clone(), server_name.clone())?;
        Ok(Sentry::Tls(Box::new(TlsSentry {
          channel: channel.clone(),
          client_side: true,
          conn: rustls::Connection::Client(conn),
          started: false,
        })))
      }
      Provider::TlsServer { config } => {
        let conn = rustls::ServerConnection::new(config.clone())?;
        Ok(Sentry::Tls(Box::new(TlsSentry {
          channel: channel.clone(),
          client_side: false,
          conn: rustls::Connection::Server(conn),
          started: false,
        })))
      }
    }
  }
}

pub enum Sentry {
  Tcp(TcpSentry),
  Tls(Box<TlsSentry>),
}

impl Sentry {
  pub(crate) fn on_readable_event(&mut self) -> Result<SentryVerdict> {
    match self {
      Sentry::Tcp(s) => s.on_readable_event(),
      Sentry::Tls(s) => s.on_readable_event(),
    }
  }

  pub(crate) fn on_writable_event(&mut self) -> Result<SentryVerdict> {
    match self {
      Sentry::Tcp(s) => s.on_writable_event(),
      Sentry::Tls(s) => s.on_writable_event(),
    }
  }

  /// Consume the completed sentry, yielding the steady-state protocol.
  pub(crate) fn into_protocol(self) -> Protocol {
    match self {
      Sentry::Tcp(s) => Protocol::Tcp(TcpProtocol::new(s.channel)),
      Sentry::Tls(s) => {
        Protocol::Tls(TlsProtocol::new(s.channel, Arc::new(Mutex::new(TlsState::new(s.conn)))))
      }
    }
  }

  /// Tear down a sentry that never completed: close its socket.
  pub(crate) fn do_close(&self) {
    let channel = match self {
      Sentry::Tcp(s) => &s.channel,
      Sentry::Tls(s) => &s.channel,
    };
    channel.close_socket();
  }
}

pub struct TcpSentry {
  channel: Arc<Channel>,
}

impl TcpSentry {
  /// A plain connect is only ever signalled through writability.
  fn on_readable_event(&mut self) -> Result<SentryVerdict> {
    Err(NetError::Handshake("unexpected readable event while connecting".into()))
  }

  fn on_writable_event(&mut self) -> Result<SentryVerdict> {
    let err_opt = os::get_err_opt(self.channel.socket())
      .map_err(|e| NetError::io("getsockopt(SO_ERROR)", e))?;
    if err_opt == 0 {
      Ok(SentryVerdict::Complete)
    } else {
      Err(NetError::Handshake(format!(
        "connect failed: {}",
        std::io::Error::from_raw_os_error(err_opt)
      )))
    }
  }
}

pub struct TlsSentry {
  channel: Arc<Channel>,
  client_side: bool,
  conn: rustls::Connection,
  started: bool,
}

impl TlsSentry {
  fn on_readable_event(&mut self) -> Result<SentryVerdict> {
    self.drive()
  }

  fn on_writable_event(&mut self) -> Result<SentryVerdict> {
    if !self.started {
      // First writability doubles as connect completion.
      let err_opt = os::get_err_opt(self.channel.socket())
        .map_err(|e| NetError::io("getsockopt(SO_ERROR)", e))?;
      if err_opt != 0 {
        return Err(NetError::Handshake(format!(
          "connect failed: {}",
          std::io::Error::from_raw_os_error(err_opt)
        )));
      }
      self.started = true;
    }
    self.drive()
  }

  /// Pump the rustls handshake until it blocks on the socket or finishes.
  fn drive(&mut self) -> Result<SentryVerdict> {
    let mut io = SockIo(self.channel.socket());
    loop {
      // Flush whatever the handshake produced before asking for more input.
      while self.conn.wants_write() {
        match self.conn.write_tls(&mut io) {
          Ok(_) => {}
          Err(err) if os::is_would_block(&err) => return Ok(SentryVerdict::NeedWrite),
          Err(err) if os::is_interrupted(&err) => {}
          Err(err) => return Err(NetError::io("write_tls", err)),
        }
      }

      if !self.conn.is_handshaking() {
        self.verify_peer()?;
        return Ok(SentryVerdict::Complete);
      }

      if self.conn.wants_read() {
        match self.conn.read_tls(&mut io) {
          Ok(0) => {
            return Err(NetError::Handshake("peer closed during handshake".into()));
          }
          Ok(_) => {
            self.conn.process_new_packets().map_err(NetError::Tls)?;
          }
          Err(err) if os::is_would_block(&err) => return Ok(SentryVerdict::NeedRead),
          Err(err) if os::is_interrupted(&err) => {}
          Err(err) => return Err(NetError::io("read_tls", err)),
        }
      } else {
        // Handshaking with nothing wanted in either direction cannot make
        // progress on this event; wait for the next one instead of spinning.
        return Ok(SentryVerdict::Ignored);
      }
    }
  }

  /// Chain verification already happened inside the handshake; on the
  /// client side additionally insist the server actually presented a
  /// certificate.
  fn verify_peer(&self) -> Result<()> {
    if self.client_side && self.conn.peer_certificates().is_none_or(|c| c.is_empty()) {
      return Err(NetError::Handshake("server presented no certificate".into()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_verdict_equality_is_structural() {
    assert_eq!(SentryVerdict::NeedRead, SentryVerdict::NeedRead);
    assert_ne!(SentryVerdict::NeedRead, SentryVerdict::NeedWrite);
    assert_ne!(SentryVerdict::Complete, SentryVerdict::Ignored);
  }
}
