//! Raw socket operations: create, configure, bind/listen, accept, connect,
//! recv/send, shutdown and close.
//!
//! Everything here returns `std::io::Result`; would-block and interrupted
//! surface as their `io::ErrorKind` and are classified by the helpers in the
//! parent module. Callers never see raw errno.

use std::io;
use std::net::SocketAddr;

use crate::config::SocketOptions;

use super::Socket;

#[cfg(unix)]
pub use self::unix::*;
#[cfg(windows)]
pub use self::windows::*;

#[cfg(unix)]
mod unix {
  use super::*;
  use crate::os::syscall;
  use std::mem;

  /// Create a non-inheritable stream socket for the address family of `addr`.
  pub fn create_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let family = match addr {
      SocketAddr::V4(_) => libc::AF_INET,
      SocketAddr::V6(_) => libc::AF_INET6,
    };
    #[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "netbsd"))]
    let fd = syscall!(socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))?;
    #[cfg(not(any(
      target_os = "linux",
      target_os = "freebsd",
      target_os = "netbsd"
    )))]
    let fd = {
      let fd = syscall!(socket(family, libc::SOCK_STREAM, 0))?;
      if let Err(err) = syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC)) {
        unsafe { libc::close(fd) };
        return Err(err);
      }
      fd
    };
    Ok(Socket::new(fd))
  }

  fn set_opt(
    socket: Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
  ) -> io::Result<()> {
    syscall!(setsockopt(
      socket.raw(),
      level,
      name,
      &value as *const libc::c_int as *const libc::c_void,
      mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
  }

  /// Apply the configured socket options and switch the socket to
  /// non-blocking mode. The reactor only ever works with non-blocking
  /// sockets, so this is not optional.
  pub fn configure(socket: Socket, opts: &SocketOptions, v6: bool) -> io::Result<()> {
    if opts.reuse_addr {
      set_opt(socket, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    }
    if opts.keep_alive {
      set_opt(socket, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    }
    if opts.no_delay {
      set_opt(socket, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    }
    if v6 {
      set_opt(socket, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, opts.ipv6_only as libc::c_int)?;
    }
    // send() uses MSG_NOSIGNAL where available; elsewhere suppress SIGPIPE
    // at the socket level.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    set_opt(socket, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;
    set_nonblocking(socket)
  }

  pub fn set_nonblocking(socket: Socket) -> io::Result<()> {
    let flags = syscall!(fcntl(socket.raw(), libc::F_GETFL))?;
    syscall!(fcntl(socket.raw(), libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
  }

  pub fn bind_socket(socket: Socket, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = addr_into_storage(addr);
    syscall!(bind(
      socket.raw(),
      &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
      len,
    ))
    .map(|_| ())
  }

  pub fn listen_socket(socket: Socket, backlog: i32) -> io::Result<()> {
    syscall!(listen(socket.raw(), backlog)).map(|_| ())
  }

  /// The locally bound address; used to recover the port after binding to
  /// port zero.
  pub fn local_addr(socket: Socket) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
      socket.raw(),
      &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
      &mut len,
    ))?;
    addr_from_storage(&storage)
  }

  /// Accept one pending connection. The returned socket is already
  /// close-on-exec and non-blocking.
  pub fn accept(socket: Socket) -> io::Result<(Socket, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(any(
      target_os = "linux",
      target_os = "freebsd",
      target_os = "dragonfly",
      target_os = "openbsd",
      target_os = "netbsd"
    ))]
    let fd = syscall!(accept4(
      socket.raw(),
      &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
      &mut len,
      libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
    ))?;

    #[cfg(not(any(
      target_os = "linux",
      target_os = "freebsd",
      target_os = "dragonfly",
      target_os = "openbsd",
      target_os = "netbsd"
    )))]
    let fd = {
      let fd = syscall!(accept(
        socket.raw(),
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut len,
      ))?;
      if let Err(err) = syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))
        .and_then(|_| syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK)))
      {
        unsafe { libc::close(fd) };
        return Err(err);
      }
      fd
    };

    Ok((Socket::new(fd), addr_from_storage(&storage)?))
  }

  /// Start a non-blocking connect. `EINPROGRESS` is the expected outcome;
  /// completion is signalled through writability and confirmed with
  /// [`get_err_opt`].
  pub fn connect(socket: Socket, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = addr_into_storage(addr);
    match syscall!(connect(
      socket.raw(),
      &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
      len,
    )) {
      Ok(_) => Ok(()),
      Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
      Err(err) => Err(err),
    }
  }

  pub fn recv(socket: Socket, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(
      socket.raw(),
      buf.as_mut_ptr() as *mut libc::c_void,
      buf.len(),
      0,
    ))?;
    Ok(n as usize)
  }

  pub fn send(socket: Socket, buf: &[u8]) -> io::Result<usize> {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let flags = 0;
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let flags = libc::MSG_NOSIGNAL;
    let n = syscall!(send(
      socket.raw(),
      buf.as_ptr() as *const libc::c_void,
      buf.len(),
      flags,
    ))?;
    Ok(n as usize)
  }

  /// Half-close: no more data will be sent, reads stay open.
  pub fn shutdown_write(socket: Socket) -> io::Result<()> {
    syscall!(shutdown(socket.raw(), libc::SHUT_WR)).map(|_| ())
  }

  pub fn close_socket(socket: Socket) -> io::Result<()> {
    syscall!(close(socket.raw())).map(|_| ())
  }

  /// Read and clear SO_ERROR. Zero means the pending connect succeeded.
  pub fn get_err_opt(socket: Socket) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
      socket.raw(),
      libc::SOL_SOCKET,
      libc::SO_ERROR,
      &mut err as *mut libc::c_int as *mut libc::c_void,
      &mut len,
    ))?;
    Ok(err as i32)
  }

  fn addr_into_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
      SocketAddr::V4(v4) => {
        let sin = libc::sockaddr_in {
          sin_family: libc::AF_INET as libc::sa_family_t,
          sin_port: v4.port().to_be(),
          sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
          ..unsafe { mem::zeroed() }
        };
        unsafe {
          std::ptr::copy_nonoverlapping(
            &sin as *const libc::sockaddr_in as *const u8,
            &mut storage as *mut libc::sockaddr_storage as *mut u8,
            mem::size_of::<libc::sockaddr_in>(),
          );
        }
        (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
      }
      SocketAddr::V6(v6) => {
        let sin6 = libc::sockaddr_in6 {
          sin6_family: libc::AF_INET6 as libc::sa_family_t,
          sin6_port: v6.port().to_be(),
          sin6_flowinfo: v6.flowinfo(),
          sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
          sin6_scope_id: v6.scope_id(),
          ..unsafe { mem::zeroed() }
        };
        unsafe {
          std::ptr::copy_nonoverlapping(
            &sin6 as *const libc::sockaddr_in6 as *const u8,
            &mut storage as *mut libc::sockaddr_storage as *mut u8,
            mem::size_of::<libc::sockaddr_in6>(),
          );
        }
        (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
      }
    }
  }

  fn addr_from_storage(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
      libc::AF_INET => {
        let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
        Ok(SocketAddr::from((
          sin.sin_addr.s_addr.to_ne_bytes(),
          u16::from_be(sin.sin_port),
        )))
      }
      libc::AF_INET6 => {
        let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
        Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
          std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr),
          u16::from_be(sin6.sin6_port),
          sin6.sin6_flowinfo,
          sin6.sin6_scope_id,
        )))
      }
      other => Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unsupported address family: {other}"),
      )),
    }
  }
}

#[cfg(windows)]
mod windows {
  use super::*;
  use std::mem;
  use windows_sys::Win32::Networking::WinSock as ws;

  macro_rules! wsa_syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { ws::$fn($($arg, )*) };
        if res == ws::SOCKET_ERROR {
            Err(std::io::Error::from_raw_os_error(unsafe { ws::WSAGetLastError() }))
        } else {
            Ok(res)
        }
    }};
  }

  pub fn create_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let family = match addr {
      SocketAddr::V4(_) => ws::AF_INET,
      SocketAddr::V6(_) => ws::AF_INET6,
    };
    let raw = unsafe {
      ws::WSASocketW(
        family as i32,
        ws::SOCK_STREAM as i32,
        ws::IPPROTO_TCP,
        std::ptr::null(),
        0,
        ws::WSA_FLAG_OVERLAPPED | ws::WSA_FLAG_NO_HANDLE_INHERIT,
      )
    };
    if raw == ws::INVALID_SOCKET {
      return Err(io::Error::from_raw_os_error(unsafe { ws::WSAGetLastError() }));
    }
    Ok(Socket::new(raw))
  }

  fn set_opt(socket: Socket, level: i32, name: i32, value: i32) -> io::Result<()> {
    wsa_syscall!(setsockopt(
      socket.raw(),
      level,
      name,
      &value as *const i32 as *const u8,
      mem::size_of::<i32>() as i32,
    ))
    .map(|_| ())
  }

  pub fn configure(socket: Socket, opts: &SocketOptions, v6: bool) -> io::Result<()> {
    if opts.reuse_addr {
      set_opt(socket, ws::SOL_SOCKET, ws::SO_REUSEADDR, 1)?;
    }
    if opts.keep_alive {
      set_opt(socket, ws::SOL_SOCKET, ws::SO_KEEPALIVE, 1)?;
    }
    if opts.no_delay {
      set_opt(socket, ws::IPPROTO_TCP, ws::TCP_NODELAY, 1)?;
    }
    if v6 {
      set_opt(socket, ws::IPPROTO_IPV6, ws::IPV6_V6ONLY, opts.ipv6_only as i32)?;
    }
    set_nonblocking(socket)
  }

  pub fn set_nonblocking(socket: Socket) -> io::Result<()> {
    let mut on: u32 = 1;
    wsa_syscall!(ioctlsocket(socket.raw(), ws::FIONBIO, &mut on)).map(|_| ())
  }

  pub fn bind_socket(socket: Socket, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = addr_into_storage(addr);
    wsa_syscall!(bind(socket.raw(), &storage as *const _ as *const ws::SOCKADDR, len))
      .map(|_| ())
  }

  pub fn listen_socket(socket: Socket, backlog: i32) -> io::Result<()> {
    wsa_syscall!(listen(socket.raw(), backlog)).map(|_| ())
  }

  pub fn local_addr(socket: Socket) -> io::Result<SocketAddr> {
    let mut storage: ws::SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<ws::SOCKADDR_STORAGE>() as i32;
    wsa_syscall!(getsockname(
      socket.raw(),
      &mut storage as *mut _ as *mut ws::SOCKADDR,
      &mut len,
    ))?;
    addr_from_storage(&storage)
  }

  pub fn accept(socket: Socket) -> io::Result<(Socket, SocketAddr)> {
    let mut storage: ws::SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<ws::SOCKADDR_STORAGE>() as i32;
    let raw =
      unsafe { ws::accept(socket.raw(), &mut storage as *mut _ as *mut ws::SOCKADDR, &mut len) };
    if raw == ws::INVALID_SOCKET {
      return Err(io::Error::from_raw_os_error(unsafe { ws::WSAGetLastError() }));
    }
    let accepted = Socket::new(raw);
    set_nonblocking(accepted)?;
    Ok((accepted, addr_from_storage(&storage)?))
  }

  pub fn connect(socket: Socket, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = addr_into_storage(addr);
    match wsa_syscall!(connect(socket.raw(), &storage as *const _ as *const ws::SOCKADDR, len)) {
      Ok(_) => Ok(()),
      // Non-blocking connect reports WSAEWOULDBLOCK while in progress.
      Err(err) if err.raw_os_error() == Some(ws::WSAEWOULDBLOCK) => Ok(()),
      Err(err) => Err(err),
    }
  }

  pub fn recv(socket: Socket, buf: &mut [u8]) -> io::Result<usize> {
    let n = wsa_syscall!(recv(socket.raw(), buf.as_mut_ptr(), buf.len() as i32, 0))?;
    Ok(n as usize)
  }

  pub fn send(socket: Socket, buf: &[u8]) -> io::Result<usize> {
    let n = wsa_syscall!(send(socket.raw(), buf.as_ptr(), buf.len() as i32, 0))?;
    Ok(n as usize)
  }

  pub fn shutdown_write(socket: Socket) -> io::Result<()> {
    wsa_syscall!(shutdown(socket.raw(), ws::SD_SEND)).map(|_| ())
  }

  pub fn close_socket(socket: Socket) -> io::Result<()> {
    wsa_syscall!(closesocket(socket.raw())).map(|_| ())
  }

  pub fn get_err_opt(socket: Socket) -> io::Result<i32> {
    let mut err: i32 = 0;
    let mut len = mem::size_of::<i32>() as i32;
    wsa_syscall!(getsockopt(
      socket.raw(),
      ws::SOL_SOCKET,
      ws::SO_ERROR,
      &mut err as *mut i32 as *mut u8,
      &mut len,
    ))?;
    Ok(err)
  }

  fn addr_into_storage(addr: &SocketAddr) -> (ws::SOCKADDR_STORAGE, i32) {
    let mut storage: ws::SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    match addr {
      SocketAddr::V4(v4) => {
        let sin = ws::SOCKADDR_IN {
          sin_family: ws::AF_INET,
          sin_port: v4.port().to_be(),
          sin_addr: ws::IN_ADDR {
            S_un: ws::IN_ADDR_0 { S_addr: u32::from_ne_bytes(v4.ip().octets()) },
          },
          sin_zero: [0; 8],
        };
        unsafe {
          std::ptr::copy_nonoverlapping(
            &sin as *const ws::SOCKADDR_IN as *const u8,
            &mut storage as *mut ws::SOCKADDR_STORAGE as *mut u8,
            mem::size_of::<ws::SOCKADDR_IN>(),
          );
        }
        (storage, mem::size_of::<ws::SOCKADDR_IN>() as i32)
      }
      SocketAddr::V6(v6) => {
        let sin6 = ws::SOCKADDR_IN6 {
          sin6_family: ws::AF_INET6,
          sin6_port: v6.port().to_be(),
          sin6_flowinfo: v6.flowinfo(),
          sin6_addr: ws::IN6_ADDR { u: ws::IN6_ADDR_0 { Byte: v6.ip().octets() } },
          Anonymous: ws::SOCKADDR_IN6_0 { sin6_scope_id: v6.scope_id() },
        };
        unsafe {
          std::ptr::copy_nonoverlapping(
            &sin6 as *const ws::SOCKADDR_IN6 as *const u8,
            &mut storage as *mut ws::SOCKADDR_STORAGE as *mut u8,
            mem::size_of::<ws::SOCKADDR_IN6>(),
          );
        }
        (storage, mem::size_of::<ws::SOCKADDR_IN6>() as i32)
      }
    }
  }

  fn addr_from_storage(storage: &ws::SOCKADDR_STORAGE) -> io::Result<SocketAddr> {
    match storage.ss_family {
      ws::AF_INET => {
        let sin = unsafe { &*(storage as *const _ as *const ws::SOCKADDR_IN) };
        let ip = unsafe { sin.sin_addr.S_un.S_addr };
        Ok(SocketAddr::from((ip.to_ne_bytes(), u16::from_be(sin.sin_port))))
      }
      ws::AF_INET6 => {
        let sin6 = unsafe { &*(storage as *const _ as *const ws::SOCKADDR_IN6) };
        let octets = unsafe { sin6.sin6_addr.u.Byte };
        Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
          std::net::Ipv6Addr::from(octets),
          u16::from_be(sin6.sin6_port),
          sin6.sin6_flowinfo,
          unsafe { sin6.Anonymous.sin6_scope_id },
        )))
      }
      other => Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unsupported address family: {other}"),
      )),
    }
  }
}

/// Create, configure, bind and listen in one step; returns the socket and
/// the actually bound address (relevant when binding port zero).
pub fn bind_listener(
  addr: &SocketAddr,
  opts: &SocketOptions,
  backlog: i32,
) -> io::Result<(Socket, SocketAddr)> {
  let socket = create_socket(addr)?;
  let setup = configure(socket, opts, addr.is_ipv6())
    .and_then(|_| bind_socket(socket, addr))
    .and_then(|_| listen_socket(socket, backlog))
    .and_then(|_| local_addr(socket));
  match setup {
    Ok(bound) => Ok((socket, bound)),
    Err(err) => {
      let _ = close_socket(socket);
      Err(err)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::os;

  #[test]
  fn test_bind_listener_reports_port() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (socket, bound) = bind_listener(&addr, &SocketOptions::default(), 16).unwrap();
    assert_ne!(bound.port(), 0);
    assert!(bound.ip().is_loopback());
    close_socket(socket).unwrap();
  }

  #[test]
  fn test_accept_would_block_when_no_peer() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (socket, _) = bind_listener(&addr, &SocketOptions::default(), 16).unwrap();
    let err = accept(socket).unwrap_err();
    assert!(os::is_would_block(&err));
    close_socket(socket).unwrap();
  }

  #[test]
  fn test_connect_then_err_opt_clean() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (listener, bound) = bind_listener(&addr, &SocketOptions::default(), 16).unwrap();

    let client = create_socket(&bound).unwrap();
    configure(client, &SocketOptions::default(), false).unwrap();
    connect(client, &bound).unwrap();

    // Loopback connects almost immediately; poll SO_ERROR until settled.
    let mut err_opt = -1;
    for _ in 0..100 {
      err_opt = get_err_opt(client).unwrap();
      if err_opt == 0 {
        break;
      }
      std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(err_opt, 0);

    close_socket(client).unwrap();
    close_socket(listener).unwrap();
  }
}
