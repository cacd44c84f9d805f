//! Protocol: steady-state non-blocking I/O for an established connection.
//!
//! Reads run on the poller thread, writes on the writer thread; the two
//! never overlap on plain TCP state. TLS shares one rustls connection
//! between the two threads, guarded by its own mutex - the record layer is
//! the one place where a read can require a socket write and vice versa.
//!
//! `do_write` hides the transport's partial-write semantics: from the
//! writer's point of view, TLS behaves exactly like a plain socket with
//! respect to would-block, plus the possibility of "plaintext accepted but
//! records still queued", reported as a blocked outcome with everything
//! consumed.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::Channel;
use crate::error::{NetError, Result};
use crate::os::{self, interest};
use crate::tls::SockIo;

/// Outcome of a readable event.
pub(crate) enum ReadEvent {
  /// Bytes landed in the scratch buffer; zero means orderly peer shutdown.
  Data(usize),
  /// No data, but the armed interest must become exactly this.
  Rearm(u32),
  /// Spurious wakeup; nothing to do.
  Ignored,
}

/// Outcome of one `do_write` attempt.
pub(crate) enum WriteOutcome {
  /// `consumed` bytes were accepted and are on their way.
  Consumed(usize),
  /// `consumed` bytes were accepted, then the transport blocked; the writer
  /// must arm `need` and retry the remainder later.
  Blocked { consumed: usize, need: u32 },
}

/// What the poller should do with a writable event. The poller applies
/// `rearm` *before* waking the writer: the writer's next interest change is
/// then guaranteed to observe the disarmed state, so its re-arm can never be
/// swallowed by a late disarm.
pub(crate) struct WritableHint {
  pub rearm: u32,
  pub notify_writer: bool,
}

#[derive(Clone)]
pub enum Protocol {
  Tcp(TcpProtocol),
  Tls(TlsProtocol),
}

impl Protocol {
  pub(crate) fn on_readable_event(&self, buf: &mut [u8]) -> Result<ReadEvent> {
    match self {
      Protocol::Tcp(p) => p.on_readable_event(buf),
      Protocol::Tls(p) => p.on_readable_event(buf),
    }
  }

  /// A writable event reached the poller: sends live on the writer, so the
  /// poller re-arms per the hint and then forwards the signal there.
  pub(crate) fn on_writable_event(&self) -> Result<WritableHint> {
    match self {
      Protocol::Tcp(p) => p.on_writable_event(),
      Protocol::Tls(p) => p.on_writable_event(),
    }
  }

  pub(crate) fn do_write(&self, data: &[u8]) -> Result<WriteOutcome> {
    match self {
      Protocol::Tcp(p) => p.do_write(data),
      Protocol::Tls(p) => p.do_write(data),
    }
  }

  pub(crate) fn do_shutdown(&self) -> Result<()> {
    match self {
      Protocol::Tcp(p) => p.do_shutdown(),
      Protocol::Tls(p) => p.do_shutdown(),
    }
  }

  pub(crate) fn do_close(&self) {
    match self {
      Protocol::Tcp(p) => p.channel.close_socket(),
      Protocol::Tls(p) => p.channel.close_socket(),
    }
  }
}

#[derive(Clone)]
pub struct TcpProtocol {
  channel: Arc<Channel>,
}

impl TcpProtocol {
  pub(crate) fn new(channel: Arc<Channel>) -> TcpProtocol {
    TcpProtocol { channel }
  }

  fn on_readable_event(&self, buf: &mut [u8]) -> Result<ReadEvent> {
    match os::recv(self.channel.socket(), buf) {
      Ok(n) => Ok(ReadEvent::Data(n)),
      Err(err) if os::is_would_block(&err) || os::is_interrupted(&err) => Ok(ReadEvent::Ignored),
      Err(err) => Err(NetError::io("recv", err)),
    }
  }

  fn on_writable_event(&self) -> Result<WritableHint> {
    Ok(WritableHint { rearm: interest::READ, notify_writer: true })
  }

  fn do_write(&self, data: &[u8]) -> Result<WriteOutcome> {
    if data.is_empty() {
      return Ok(WriteOutcome::Consumed(0));
    }
    loop {
      match os::send(self.channel.socket(), data) {
        Ok(n) => return Ok(WriteOutcome::Consumed(n)),
        Err(err) if os::is_would_block(&err) => {
          return Ok(WriteOutcome::Blocked { consumed: 0, need: interest::WRITE });
        }
        Err(err) if os::is_interrupted(&err) => {}
        Err(err) => return Err(NetError::io("send", err)),
      }
    }
  }

  fn do_shutdown(&self) -> Result<()> {
    os::shutdown_write(self.channel.socket()).map_err(|e| NetError::io("shutdown", e))
  }
}

pub(crate) struct TlsState {
  conn: rustls::Connection,
  /// An outbound record could not be flushed; the next writable event must
  /// wake the writer even though the poller does not know about backlogs.
  send_blocked: bool,
}

impl TlsState {
  pub(crate) fn new(conn: rustls::Connection) -> TlsState {
    TlsState { conn, send_blocked: false }
  }
}

#[derive(Clone)]
pub struct TlsProtocol {
  channel: Arc<Channel>,
  state: Arc<Mutex<TlsState>>,
}

impl TlsProtocol {
  pub(crate) fn new(channel: Arc<Channel>, state: Arc<Mutex<TlsState>>) -> TlsProtocol {
    TlsProtocol { channel, state }
  }

  fn lock(&self) -> MutexGuard<'_, TlsState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn on_readable_event(&self, buf: &mut [u8]) -> Result<ReadEvent> {
    let mut st = self.lock();
    let mut io = SockIo(self.channel.socket());

    match st.conn.read_tls(&mut io) {
      Ok(0) => return Ok(ReadEvent::Data(0)),
      Ok(_) => {}
      Err(err) if os::is_would_block(&err) || os::is_interrupted(&err) => {
        return Ok(ReadEvent::Ignored);
      }
      Err(err) => return Err(NetError::io("read_tls", err)),
    }

    let io_state = st.conn.process_new_packets().map_err(NetError::Tls)?;

    match st.conn.reader().read(buf) {
      Ok(n) => Ok(ReadEvent::Data(n)),
      Err(err) if os::is_would_block(&err) => {
        if io_state.peer_has_closed() {
          return Ok(ReadEvent::Data(0));
        }
        // The record layer may owe the peer bytes (key updates, alerts).
        if st.conn.wants_write() {
          Ok(ReadEvent::Rearm(interest::READ_WRITE))
        } else {
          Ok(ReadEvent::Ignored)
        }
      }
      Err(err) => Err(NetError::io("tls plaintext read", err)),
    }
  }

  fn on_writable_event(&self) -> Result<WritableHint> {
    let mut st = self.lock();
    let mut io = SockIo(self.channel.socket());
    // Record-layer bytes queued by the read path (alerts, key updates) are
    // flushed here; application data is the writer's business.
    let mut rearm = interest::READ;
    while st.conn.wants_write() {
      match st.conn.write_tls(&mut io) {
        Ok(_) => {}
        Err(err) if os::is_would_block(&err) => {
          rearm = interest::READ_WRITE;
          break;
        }
        Err(err) if os::is_interrupted(&err) => {}
        Err(err) => return Err(NetError::io("write_tls", err)),
      }
    }
    let notify = st.send_blocked;
    st.send_blocked = false;
    Ok(WritableHint { rearm, notify_writer: notify })
  }

  fn do_write(&self, data: &[u8]) -> Result<WriteOutcome> {
    let mut st = self.lock();
    let mut io = SockIo(self.channel.socket());
    let mut consumed = 0usize;

    loop {
      // Flush queued records before (and after) buffering more plaintext.
      while st.conn.wants_write() {
        match st.conn.write_tls(&mut io) {
          Ok(_) => {}
          Err(err) if os::is_would_block(&err) => {
            st.send_blocked = true;
            return Ok(WriteOutcome::Blocked { consumed, need: interest::WRITE });
          }
          Err(err) if os::is_interrupted(&err) => {}
          Err(err) => return Err(NetError::io("write_tls", err)),
        }
      }

      if consumed == data.len() {
        return Ok(WriteOutcome::Consumed(consumed));
      }

      // Plaintext goes into rustls' bounded internal buffer.
      match st.conn.writer().write(&data[consumed..]) {
        Ok(0) => {
          // Buffer full with nothing flushable: wait for the socket.
          st.send_blocked = true;
          return Ok(WriteOutcome::Blocked { consumed, need: interest::WRITE });
        }
        Ok(n) => consumed += n,
        Err(err) => return Err(NetError::io("tls plaintext write", err)),
      }
    }
  }

  fn do_shutdown(&self) -> Result<()> {
    let mut st = self.lock();
    st.conn.send_close_notify();
    let mut io = SockIo(self.channel.socket());
    while st.conn.wants_write() {
      match st.conn.write_tls(&mut io) {
        Ok(_) => {}
        // The close path follows within the grace period either way.
        Err(err) if os::is_would_block(&err) => break,
        Err(err) if os::is_interrupted(&err) => {}
        Err(err) => return Err(NetError::io("write_tls", err)),
      }
    }
    Ok(())
  }
}
