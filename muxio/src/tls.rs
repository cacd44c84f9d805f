//! rustls plumbing shared by the Tls sentry and protocol.
//!
//! The engine drives `rustls::Connection` directly through its non-blocking
//! `read_tls`/`write_tls`/`process_new_packets` state machine; there is no
//! async wrapper in between. Certificate management stays with the caller:
//! providers receive ready-made `ClientConfig`/`ServerConfig` values.

use std::io::{self, Read, Write};

use crate::os::{self, Socket};

/// Adapts a non-blocking socket to the `io::Read`/`io::Write` interface
/// rustls wants for its record layer. Would-block passes straight through;
/// rustls treats it as "no progress", exactly like the reactor does.
pub(crate) struct SockIo(pub(crate) Socket);

impl Read for SockIo {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    os::recv(self.0, buf)
  }
}

impl Write for SockIo {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    os::send(self.0, buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::SocketOptions;
  use std::net::SocketAddr;

  #[test]
  fn test_sock_io_would_block_passthrough() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (listener, bound) = os::bind_listener(&addr, &SocketOptions::default(), 4).unwrap();

    let client = os::create_socket(&bound).unwrap();
    os::configure(client, &SocketOptions::default(), false).unwrap();
    os::connect(client, &bound).unwrap();

    let (accepted, _) = loop {
      match os::accept(listener) {
        Ok(pair) => break pair,
        Err(err) if os::is_would_block(&err) => {
          std::thread::sleep(std::time::Duration::from_millis(5))
        }
        Err(err) => panic!("accept failed: {err}"),
      }
    };

    let mut io = SockIo(accepted);
    let mut buf = [0u8; 16];
    let err = io.read(&mut buf).unwrap_err();
    assert!(os::is_would_block(&err));

    os::close_socket(accepted).unwrap();
    os::close_socket(client).unwrap();
    os::close_socket(listener).unwrap();
  }
}
