//! OS network library: the thin syscall shim the reactor is built on.
//!
//! One interface, three multiplexer implementations:
//! - epoll on Linux
//! - kqueue on macOS / the BSDs
//! - AFD poll (the wepoll approach over an I/O completion port) on Windows
//!
//! Each platform module owns its own event-struct layout; nothing above this
//! module ever touches a native event record directly. Raw errno never
//! escapes either: would-block and interrupted are classified here and are
//! control flow for the upper layers, not errors.

#[cfg(unix)]
macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}

#[cfg(unix)]
pub(crate) use syscall;

mod socket;

pub use socket::*;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
use self::epoll as sys;

#[cfg(any(
  target_os = "macos",
  target_os = "ios",
  target_os = "freebsd",
  target_os = "dragonfly",
  target_os = "openbsd",
  target_os = "netbsd"
))]
mod kqueue;
#[cfg(any(
  target_os = "macos",
  target_os = "ios",
  target_os = "freebsd",
  target_os = "dragonfly",
  target_os = "openbsd",
  target_os = "netbsd"
))]
use self::kqueue as sys;

#[cfg(windows)]
mod afd;
#[cfg(windows)]
use self::afd as sys;

pub use sys::OsMux;

use std::io;
use std::time::Duration;

/// Raw socket representation: a 32-bit descriptor on POSIX, a pointer-sized
/// handle on Windows.
#[cfg(unix)]
pub type RawSock = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawSock = usize;

/// An opaque native socket handle.
///
/// Immutable once created, owned by exactly one channel, closed exactly once
/// (the owning tables guarantee the latter; this type is plain Copy data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Socket(RawSock);

impl Socket {
  pub(crate) fn new(raw: RawSock) -> Self {
    Socket(raw)
  }

  pub fn raw(&self) -> RawSock {
    self.0
  }
}

impl std::fmt::Display for Socket {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Armed-interest bitmask. The low two bits are the only ones a multiplexer
/// ever sees; the channel's shared state word layers close-coordination bits
/// on top of them.
pub mod interest {
  pub const NONE: u32 = 0;
  pub const READ: u32 = 1;
  pub const WRITE: u32 = 1 << 1;
  pub const READ_WRITE: u32 = READ | WRITE;
}

/// What a decoded native event reports for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  Readable,
  Writable,
}

/// A decoded multiplexer event.
#[derive(Debug, Clone, Copy)]
pub struct MuxEvent {
  pub socket: Socket,
  pub kind: EventKind,
}

/// Trait for OS-specific readiness multiplexers.
///
/// ## Design for cross-platform compatibility
///
/// - **epoll**: a single control op per socket carries both interests
/// - **kqueue**: read and write are separate filters, added and deleted
///   independently
/// - **AFD**: a oneshot poll request per socket, re-armed on every change
///
/// `ctl` therefore takes the transition `(from, to)` rather than a target
/// state, so each platform can compute the minimal set of kernel ops. Equal
/// `from` and `to` is a no-op. Callers own the bookkeeping of `from`; the
/// channel's registration state is the single source of truth for it.
pub trait ReadinessMux {
  /// The native event record used by this implementation.
  type NativeEvent: Copy;

  fn new() -> io::Result<Self>
  where
    Self: Sized;

  /// Transition the armed interest for a socket from `from` to `to`.
  fn ctl(&self, socket: Socket, from: u32, to: u32) -> io::Result<()>;

  /// Block for events up to `timeout`, filling the provided buffer.
  /// Returns the number of records filled.
  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Duration,
  ) -> io::Result<usize>;

  /// Decode a native record into (socket, readable|writable).
  fn decode(event: &Self::NativeEvent) -> MuxEvent;
}

/// Allocate a zeroed native-event buffer for [`ReadinessMux::wait`].
pub fn event_buffer(capacity: usize) -> Vec<<OsMux as ReadinessMux>::NativeEvent> {
  vec![unsafe { std::mem::zeroed() }; capacity]
}

/// Would-block is expected control flow on every non-blocking path.
pub fn is_would_block(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::WouldBlock
}

/// Interrupted waits are retried, never treated as failures.
pub fn is_interrupted(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::Interrupted
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use std::net::TcpListener;

  #[test]
  fn test_event_buffer_capacity() {
    let buf = event_buffer(64);
    assert_eq!(buf.len(), 64);
  }

  #[test]
  fn test_mux_reports_listener_readable() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = {
      use std::os::fd::AsRawFd;
      Socket::new(listener.as_raw_fd())
    };
    let mux = OsMux::new().unwrap();
    mux.ctl(server, interest::NONE, interest::READ).unwrap();

    // No connection yet: the wait must time out empty.
    let mut events = event_buffer(8);
    let n = mux.wait(&mut events, Duration::from_millis(10)).unwrap();
    assert_eq!(n, 0);

    let _client = std::net::TcpStream::connect(addr).unwrap();

    let mut seen = false;
    for _ in 0..100 {
      let n = mux.wait(&mut events, Duration::from_millis(20)).unwrap();
      if n > 0 {
        let ev = OsMux::decode(&events[0]);
        assert_eq!(ev.socket, server);
        assert_eq!(ev.kind, EventKind::Readable);
        seen = true;
        break;
      }
    }
    assert!(seen, "listener never became readable");
    mux.ctl(server, interest::READ, interest::NONE).unwrap();
  }

  #[test]
  fn test_ctl_same_state_is_noop() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server = {
      use std::os::fd::AsRawFd;
      Socket::new(listener.as_raw_fd())
    };
    let mux = OsMux::new().unwrap();
    mux.ctl(server, interest::NONE, interest::NONE).unwrap();
    mux.ctl(server, interest::NONE, interest::READ).unwrap();
    mux.ctl(server, interest::READ, interest::READ).unwrap();
    mux.ctl(server, interest::READ, interest::NONE).unwrap();
  }
}
