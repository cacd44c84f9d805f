//! epoll-backed multiplexer (Linux).
//!
//! Interests are level-triggered and persistent: the reactor's registration
//! state machine decides exactly which interests are armed, so oneshot
//! re-arming would only add syscalls. The socket itself is the event key.

use super::{EventKind, MuxEvent, ReadinessMux, Socket, interest, syscall};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

pub struct OsMux {
  epoll_fd: OwnedFd,
}

fn interest_bits(to: u32) -> u32 {
  let mut events = 0u32;
  if to & interest::READ != 0 {
    events |= libc::EPOLLIN as u32;
  }
  if to & interest::WRITE != 0 {
    events |= libc::EPOLLOUT as u32;
  }
  events | libc::EPOLLRDHUP as u32
}

impl ReadinessMux for OsMux {
  type NativeEvent = libc::epoll_event;

  fn new() -> io::Result<Self> {
    let epoll_fd = unsafe {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      OwnedFd::from_raw_fd(fd)
    };
    Ok(Self { epoll_fd })
  }

  fn ctl(&self, socket: Socket, from: u32, to: u32) -> io::Result<()> {
    if from == to {
      return Ok(());
    }
    let op = match (from, to) {
      (interest::NONE, _) => libc::EPOLL_CTL_ADD,
      (_, interest::NONE) => libc::EPOLL_CTL_DEL,
      _ => libc::EPOLL_CTL_MOD,
    };
    let mut event =
      libc::epoll_event { events: interest_bits(to), u64: socket.raw() as u64 };
    let event_ptr = if op == libc::EPOLL_CTL_DEL {
      // Allowed to be NULL since Linux 2.6.9.
      std::ptr::null_mut()
    } else {
      &mut event as *mut libc::epoll_event
    };
    syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, socket.raw(), event_ptr))
      .map(|_| ())
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Duration,
  ) -> io::Result<usize> {
    let ms = timeout.as_millis();
    let timeout_ms = if ms > i32::MAX as u128 { i32::MAX } else { ms as i32 };

    let ret = syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ms,
    ))?;

    let n = ret as usize;
    debug_assert!(n <= events.len());
    Ok(n)
  }

  fn decode(event: &Self::NativeEvent) -> MuxEvent {
    let socket = Socket::new(event.u64 as super::RawSock);
    // A pure EPOLLOUT is a write-completion signal; anything carrying
    // EPOLLIN, or an error/hangup, is handled through the read path where
    // recv() reports the precise condition.
    let kind = if event.events & libc::EPOLLOUT as u32 != 0
      && event.events & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32
        == 0
    {
      EventKind::Writable
    } else {
      EventKind::Readable
    };
    MuxEvent { socket, kind }
  }
}
