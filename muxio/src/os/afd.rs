//! AFD-poll multiplexer (Windows).
//!
//! Windows has no readiness multiplexer in its public API, so this follows
//! the wepoll approach: a oneshot AFD poll request per socket is submitted
//! to the ancillary function driver (`\Device\Afd`) and completes through an
//! I/O completion port. `wait` drains the port and re-arms every socket that
//! still has interest, which restores the level-triggered contract the other
//! platforms provide.
//!
//! All layout constants for the AFD poll records live here and nowhere else.

use super::{EventKind, MuxEvent, ReadinessMux, Socket, interest};
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
  CloseHandle, HANDLE, INVALID_HANDLE_VALUE, STATUS_CANCELLED, STATUS_PENDING,
  STATUS_SUCCESS, UNICODE_STRING,
};
use windows_sys::Win32::Networking::WinSock::{
  SIO_BASE_HANDLE, SOCKET_ERROR, WSAGetLastError, WSAIoctl,
};
use windows_sys::Win32::System::IO::{
  CreateIoCompletionPort, GetQueuedCompletionStatusEx, IO_STATUS_BLOCK,
  OVERLAPPED_ENTRY,
};

const IOCTL_AFD_POLL: u32 = 0x0001_2024;

const AFD_POLL_RECEIVE: u32 = 0x0001;
const AFD_POLL_RECEIVE_EXPEDITED: u32 = 0x0002;
const AFD_POLL_SEND: u32 = 0x0004;
const AFD_POLL_DISCONNECT: u32 = 0x0008;
const AFD_POLL_ABORT: u32 = 0x0010;
const AFD_POLL_LOCAL_CLOSE: u32 = 0x0020;
const AFD_POLL_ACCEPT: u32 = 0x0080;
const AFD_POLL_CONNECT_FAIL: u32 = 0x0100;

const READ_MASK: u32 = AFD_POLL_RECEIVE
  | AFD_POLL_RECEIVE_EXPEDITED
  | AFD_POLL_DISCONNECT
  | AFD_POLL_ABORT
  | AFD_POLL_ACCEPT
  | AFD_POLL_CONNECT_FAIL;
const WRITE_MASK: u32 = AFD_POLL_SEND;

#[repr(C)]
#[derive(Clone, Copy)]
struct AfdPollHandleInfo {
  handle: HANDLE,
  events: u32,
  status: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AfdPollInfo {
  timeout: i64,
  number_of_handles: u32,
  exclusive: u32,
  handles: [AfdPollHandleInfo; 1],
}

#[repr(C)]
struct ObjectAttributes {
  length: u32,
  root_directory: HANDLE,
  object_name: *const UNICODE_STRING,
  attributes: u32,
  security_descriptor: *const core::ffi::c_void,
  security_qos: *const core::ffi::c_void,
}

#[link(name = "ntdll")]
unsafe extern "system" {
  fn NtCreateFile(
    file_handle: *mut HANDLE,
    desired_access: u32,
    object_attributes: *const ObjectAttributes,
    io_status_block: *mut IO_STATUS_BLOCK,
    allocation_size: *const i64,
    file_attributes: u32,
    share_access: u32,
    create_disposition: u32,
    create_options: u32,
    ea_buffer: *const core::ffi::c_void,
    ea_length: u32,
  ) -> i32;

  fn NtDeviceIoControlFile(
    file_handle: HANDLE,
    event: HANDLE,
    apc_routine: *const core::ffi::c_void,
    apc_context: *const core::ffi::c_void,
    io_status_block: *mut IO_STATUS_BLOCK,
    io_control_code: u32,
    input_buffer: *const core::ffi::c_void,
    input_buffer_length: u32,
    output_buffer: *mut core::ffi::c_void,
    output_buffer_length: u32,
  ) -> i32;

  fn NtCancelIoFileEx(
    file_handle: HANDLE,
    io_request_to_cancel: *mut IO_STATUS_BLOCK,
    io_status_block: *mut IO_STATUS_BLOCK,
  ) -> i32;
}

/// Per-socket poll state. The IO_STATUS_BLOCK is passed as the APC context
/// and comes back as the completion entry's overlapped pointer, so it must
/// be the first field and the allocation must stay pinned while a poll is
/// pending.
#[repr(C)]
struct PollState {
  iosb: IO_STATUS_BLOCK,
  socket: Socket,
  base: HANDLE,
  armed: u32,
  pending: bool,
  info: AfdPollInfo,
}

pub struct OsMux {
  iocp: HANDLE,
  afd: HANDLE,
  table: Mutex<HashMap<super::RawSock, Box<PollState>>>,
}

// SAFETY: the raw handles are only used through the kernel calls above, all
// of which are documented thread-safe; the table is behind a Mutex.
unsafe impl Send for OsMux {}
unsafe impl Sync for OsMux {}

fn nt_error(status: i32) -> io::Error {
  io::Error::from_raw_os_error(status)
}

fn base_handle(socket: Socket) -> io::Result<HANDLE> {
  let mut base: usize = 0;
  let mut bytes: u32 = 0;
  let rc = unsafe {
    WSAIoctl(
      socket.raw(),
      SIO_BASE_HANDLE,
      std::ptr::null(),
      0,
      &mut base as *mut usize as *mut core::ffi::c_void,
      std::mem::size_of::<usize>() as u32,
      &mut bytes,
      std::ptr::null_mut(),
      None,
    )
  };
  if rc == SOCKET_ERROR {
    return Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() }));
  }
  Ok(base as HANDLE)
}

impl OsMux {
  fn open_afd(iocp: HANDLE) -> io::Result<HANDLE> {
    // "\Device\Afd\Muxio" - the suffix after \Device\Afd is ignored by the
    // driver but required to open a private helper handle.
    const PATH: &[u16] = &[
      b'\\' as u16, b'D' as u16, b'e' as u16, b'v' as u16, b'i' as u16,
      b'c' as u16, b'e' as u16, b'\\' as u16, b'A' as u16, b'f' as u16,
      b'd' as u16, b'\\' as u16, b'M' as u16, b'u' as u16, b'x' as u16,
      b'i' as u16, b'o' as u16,
    ];
    let name = UNICODE_STRING {
      Length: (PATH.len() * 2) as u16,
      MaximumLength: (PATH.len() * 2) as u16,
      Buffer: PATH.as_ptr() as *mut u16,
    };
    let attrs = ObjectAttributes {
      length: std::mem::size_of::<ObjectAttributes>() as u32,
      root_directory: std::ptr::null_mut(),
      object_name: &name,
      attributes: 0,
      security_descriptor: std::ptr::null(),
      security_qos: std::ptr::null(),
    };
    let mut handle: HANDLE = std::ptr::null_mut();
    let mut iosb: IO_STATUS_BLOCK = unsafe { std::mem::zeroed() };
    // SYNCHRONIZE | FILE_SHARE_READ | FILE_SHARE_WRITE, FILE_OPEN.
    let status = unsafe {
      NtCreateFile(
        &mut handle,
        0x0010_0000,
        &attrs,
        &mut iosb,
        std::ptr::null(),
        0,
        3,
        1,
        0,
        std::ptr::null(),
        0,
      )
    };
    if status != STATUS_SUCCESS {
      return Err(nt_error(status));
    }
    let port = unsafe { CreateIoCompletionPort(handle, iocp, 0, 0) };
    if port.is_null() {
      unsafe { CloseHandle(handle) };
      return Err(io::Error::last_os_error());
    }
    Ok(handle)
  }

  fn submit_poll(&self, state: &mut PollState) -> io::Result<()> {
    let mut events = AFD_POLL_LOCAL_CLOSE;
    if state.armed & interest::READ != 0 {
      events |= READ_MASK;
    }
    if state.armed & interest::WRITE != 0 {
      events |= WRITE_MASK | AFD_POLL_CONNECT_FAIL;
    }
    state.info = AfdPollInfo {
      timeout: i64::MAX,
      number_of_handles: 1,
      exclusive: 0,
      handles: [AfdPollHandleInfo { handle: state.base, events, status: 0 }],
    };
    state.iosb.Anonymous.Status = STATUS_PENDING;
    let status = unsafe {
      NtDeviceIoControlFile(
        self.afd,
        std::ptr::null_mut(),
        std::ptr::null(),
        &state.iosb as *const IO_STATUS_BLOCK as *const core::ffi::c_void,
        &mut state.iosb,
        IOCTL_AFD_POLL,
        &state.info as *const AfdPollInfo as *const core::ffi::c_void,
        std::mem::size_of::<AfdPollInfo>() as u32,
        &mut state.info as *mut AfdPollInfo as *mut core::ffi::c_void,
        std::mem::size_of::<AfdPollInfo>() as u32,
      )
    };
    if status != STATUS_SUCCESS && status != STATUS_PENDING {
      return Err(nt_error(status));
    }
    state.pending = true;
    Ok(())
  }

  fn cancel_poll(&self, state: &mut PollState) {
    if state.pending {
      let mut iosb: IO_STATUS_BLOCK = unsafe { std::mem::zeroed() };
      unsafe { NtCancelIoFileEx(self.afd, &mut state.iosb, &mut iosb) };
    }
  }
}

impl ReadinessMux for OsMux {
  type NativeEvent = OVERLAPPED_ENTRY;

  fn new() -> io::Result<Self> {
    let iocp =
      unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 0) };
    if iocp.is_null() {
      return Err(io::Error::last_os_error());
    }
    let afd = match Self::open_afd(iocp) {
      Ok(handle) => handle,
      Err(err) => {
        unsafe { CloseHandle(iocp) };
        return Err(err);
      }
    };
    Ok(Self { iocp, afd, table: Mutex::new(HashMap::new()) })
  }

  fn ctl(&self, socket: Socket, from: u32, to: u32) -> io::Result<()> {
    if from == to {
      return Ok(());
    }
    let mut table = self.table.lock().unwrap();
    if to == interest::NONE {
      if let Some(mut state) = table.remove(&socket.raw()) {
        self.cancel_poll(&mut state);
        // The cancelled completion still posts to the port and will
        // dereference this block, so it must outlive the cancellation.
        // Accepting the small leak keeps the delete path free of a
        // completion-drain handshake.
        std::mem::forget(state);
      }
      return Ok(());
    }
    let state = table.entry(socket.raw()).or_insert_with(|| {
      Box::new(PollState {
        iosb: unsafe { std::mem::zeroed() },
        socket,
        base: std::ptr::null_mut(),
        armed: interest::NONE,
        pending: false,
        info: unsafe { std::mem::zeroed() },
      })
    });
    if state.base.is_null() {
      state.base = base_handle(socket)?;
    }
    state.armed = to;
    self.cancel_poll(state);
    self.submit_poll(state)
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Duration,
  ) -> io::Result<usize> {
    let ms = timeout.as_millis();
    let timeout_ms = if ms > u32::MAX as u128 { u32::MAX } else { ms as u32 };
    let mut removed: u32 = 0;
    let ok = unsafe {
      GetQueuedCompletionStatusEx(
        self.iocp,
        events.as_mut_ptr(),
        events.len() as u32,
        &mut removed,
        timeout_ms,
        0,
      )
    };
    if ok == 0 {
      let err = io::Error::last_os_error();
      // WAIT_TIMEOUT surfaces as TimedOut; an empty wait is not an error.
      return if err.kind() == io::ErrorKind::TimedOut { Ok(0) } else { Err(err) };
    }
    let n = removed as usize;

    // Oneshot semantics: every completed poll must be re-armed while its
    // interest survives.
    let mut table = self.table.lock().unwrap();
    for event in events.iter().take(n) {
      let state_ptr = event.lpOverlapped as *mut PollState;
      if state_ptr.is_null() {
        continue;
      }
      let state = unsafe { &mut *state_ptr };
      state.pending = false;
      if unsafe { state.iosb.Anonymous.Status } == STATUS_CANCELLED {
        continue;
      }
      if table.contains_key(&state.socket.raw()) && state.armed != interest::NONE {
        let _ = self.submit_poll(state);
      }
    }
    Ok(n)
  }

  fn decode(event: &Self::NativeEvent) -> MuxEvent {
    let state = unsafe { &*(event.lpOverlapped as *const PollState) };
    let reported = state.info.handles[0].events;
    let kind = if reported & WRITE_MASK != 0 && reported & READ_MASK == 0 {
      EventKind::Writable
    } else {
      EventKind::Readable
    };
    MuxEvent { socket: state.socket, kind }
  }
}

impl Drop for OsMux {
  fn drop(&mut self) {
    unsafe {
      CloseHandle(self.afd);
      CloseHandle(self.iocp);
    }
  }
}
