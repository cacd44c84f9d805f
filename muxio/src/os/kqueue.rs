//! kqueue-backed multiplexer (macOS / BSDs).
//!
//! kqueue arms read and write as separate filters, so a single interest
//! transition may need up to two change records; they are submitted in one
//! batched kevent call. Filters are level-triggered to match the epoll
//! implementation. The socket ident doubles as the event key.

use super::{EventKind, MuxEvent, ReadinessMux, Socket, interest, syscall};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use std::ptr;

pub struct OsMux {
  kq_fd: OwnedFd,
}

fn change(socket: Socket, filter: i16, flags: u16) -> libc::kevent {
  libc::kevent {
    ident: socket.raw() as libc::uintptr_t,
    filter,
    flags,
    fflags: 0,
    data: 0,
    udata: ptr::null_mut(),
  }
}

impl ReadinessMux for OsMux {
  type NativeEvent = libc::kevent;

  fn new() -> io::Result<Self> {
    let kq_fd = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
    syscall!(fcntl(kq_fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
    Ok(Self { kq_fd })
  }

  fn ctl(&self, socket: Socket, from: u32, to: u32) -> io::Result<()> {
    if from == to {
      return Ok(());
    }

    let mut changes: [libc::kevent; 2] = unsafe { std::mem::zeroed() };
    let mut n = 0;

    let read_from = from & interest::READ != 0;
    let read_to = to & interest::READ != 0;
    if read_to && !read_from {
      changes[n] = change(socket, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE);
      n += 1;
    } else if read_from && !read_to {
      changes[n] = change(socket, libc::EVFILT_READ, libc::EV_DELETE);
      n += 1;
    }

    let write_from = from & interest::WRITE != 0;
    let write_to = to & interest::WRITE != 0;
    if write_to && !write_from {
      changes[n] = change(socket, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE);
      n += 1;
    } else if write_from && !write_to {
      changes[n] = change(socket, libc::EVFILT_WRITE, libc::EV_DELETE);
      n += 1;
    }

    debug_assert!(n > 0, "ctl with from != to must produce changes");

    match syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      changes.as_ptr(),
      n as libc::c_int,
      ptr::null_mut(),
      0,
      ptr::null(),
    )) {
      Ok(_) => Ok(()),
      // Deleting a filter the kernel already dropped (peer reset) is fine.
      Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
      Err(err) => Err(err),
    }
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Duration,
  ) -> io::Result<usize> {
    let ts = libc::timespec {
      tv_sec: timeout.as_secs() as libc::time_t,
      tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    let ret = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      ptr::null(),
      0,
      events.as_mut_ptr(),
      events.len() as libc::c_int,
      &ts as *const libc::timespec,
    ))?;

    let n = ret as usize;
    debug_assert!(n <= events.len());
    Ok(n)
  }

  fn decode(event: &Self::NativeEvent) -> MuxEvent {
    let socket = Socket::new(event.ident as super::RawSock);
    // One record per filter; EV_EOF and EV_ERROR surface through the read
    // path where recv() reports the precise condition.
    let kind = if event.filter == libc::EVFILT_WRITE
      && event.flags & (libc::EV_EOF | libc::EV_ERROR) == 0
    {
      EventKind::Writable
    } else {
      EventKind::Readable
    };
    MuxEvent { socket, kind }
  }
}
