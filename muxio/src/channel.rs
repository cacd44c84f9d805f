//! Channel: the connection handle exposed to application code.
//!
//! A channel composes the socket, its peer address, the application handler
//! and the back-references to the poller/writer shard that own the
//! connection. Sends are submitted to the writer thread; synchronous-style
//! sends additionally register a carrier with the poller thread *before* the
//! write is issued, then park until the carrier resolves. They must never
//! be issued from handler callbacks: those run on the channel's own poller
//! thread, and parking it would deadlock the connection.
//!
//! The only channel state touched from more than one thread is the armed
//! interest word, guarded by its own mutex: both the poller and the writer
//! legitimately need to request multiplexer-interest changes for the same
//! socket, and the word doubles as the close-coordination point that makes
//! the socket close exactly once.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{Handler, Msg};
use crate::carrier::TaggedMsg;
use crate::error::{NetError, Result};
use crate::os::{self, ReadinessMux, Socket, interest};
use crate::poller::{Poller, PollerTask};
use crate::wheel::Wheel;
use crate::writer::{Writer, WriterCallback, WriterTask};

/// The reserved ambient tag: the single ordered-request slot used by circle
/// sends. Never issued by the tag counter.
pub const AMBIENT: u32 = 0;

/// Close-coordination bits layered above the interest bits in the channel
/// state word. The side that observes the other side already gone performs
/// the physical close.
pub(crate) const POLLER_GONE: u32 = 1 << 2;
pub(crate) const WRITER_GONE: u32 = 1 << 3;

/// Outcome of a writer-side attempt to arm interest.
pub(crate) enum ArmOutcome {
  Armed,
  PollerGone,
}

pub struct Channel {
  socket: Socket,
  loc: SocketAddr,
  handler: Arc<dyn Handler>,
  poller: Poller,
  writer: Writer,
  wheel: Wheel,
  /// Armed interest (low bits) plus close-coordination flags.
  state: Mutex<u32>,
  tag_counter: AtomicU32,
  shutdown_started: AtomicBool,
  send_timeout: Duration,
  shutdown_timeout: Duration,
}

impl Channel {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    socket: Socket,
    loc: SocketAddr,
    handler: Arc<dyn Handler>,
    poller: Poller,
    writer: Writer,
    wheel: Wheel,
    send_timeout: Duration,
    shutdown_timeout: Duration,
  ) -> Arc<Channel> {
    Arc::new(Channel {
      socket,
      loc,
      handler,
      poller,
      writer,
      wheel,
      // Freshly bound channels wait for writability: connect completion and
      // handshake starts are both signalled through it.
      state: Mutex::new(interest::WRITE),
      tag_counter: AtomicU32::new(AMBIENT + 1),
      shutdown_started: AtomicBool::new(false),
      send_timeout,
      shutdown_timeout,
    })
  }

  pub fn socket(&self) -> Socket {
    self.socket
  }

  /// The observed remote peer address.
  pub fn loc(&self) -> SocketAddr {
    self.loc
  }

  pub fn handler(&self) -> &Arc<dyn Handler> {
    &self.handler
  }

  pub(crate) fn poller(&self) -> &Poller {
    &self.poller
  }

  pub(crate) fn writer(&self) -> &Writer {
    &self.writer
  }

  pub(crate) fn wheel(&self) -> &Wheel {
    &self.wheel
  }

  /// Issue the next correlation tag, skipping the reserved ambient value on
  /// wrap-around.
  fn next_tag(&self) -> u32 {
    let mut current = self.tag_counter.load(Ordering::Relaxed);
    loop {
      let next = if current == u32::MAX { AMBIENT + 1 } else { current + 1 };
      match self.tag_counter.compare_exchange_weak(
        current,
        next,
        Ordering::Relaxed,
        Ordering::Relaxed,
      ) {
        Ok(_) => return current,
        Err(seen) => current = seen,
      }
    }
  }

  /// Fire-and-forget send. Delivery is not acknowledged; the optional
  /// callback only reports whether handing the bytes to the OS succeeded.
  pub fn send_msg(self: &Arc<Self>, msg: Msg) {
    self.send_msg_with_callback(msg, None)
  }

  pub fn send_msg_with_callback(self: &Arc<Self>, msg: Msg, callback: Option<WriterCallback>) {
    self.writer.submit(WriterTask::Single { channel: self.clone(), msg, callback });
  }

  /// Batched fire-and-forget send: all messages are encoded into one buffer
  /// so a single syscall can carry them.
  pub fn send_multiple_msg(self: &Arc<Self>, msgs: Vec<Msg>) {
    self.send_multiple_msg_with_callback(msgs, None)
  }

  pub fn send_multiple_msg_with_callback(
    self: &Arc<Self>,
    msgs: Vec<Msg>,
    callback: Option<WriterCallback>,
  ) {
    self.writer.submit(WriterTask::Multiple { channel: self.clone(), msgs, callback });
  }

  /// Synchronous tagged send: `f` receives a freshly issued tag and builds
  /// the request around it (for protocols where the request embeds its own
  /// correlation id). Blocks until the reply carrying that tag arrives, or
  /// fails after `timeout` (the engine default when `None`).
  pub fn send_tagged_msg<F>(self: &Arc<Self>, f: F, timeout: Option<Duration>) -> Result<Msg>
  where
    F: FnOnce(u32) -> Msg,
  {
    let tag = self.next_tag();
    let msg = f(tag);
    self.send_and_wait(SendShape::One(msg), tag, timeout)
  }

  pub fn send_multiple_tagged_msg<F>(
    self: &Arc<Self>,
    f: F,
    timeout: Option<Duration>,
  ) -> Result<Msg>
  where
    F: FnOnce(u32) -> Vec<Msg>,
  {
    let tag = self.next_tag();
    let msgs = f(tag);
    self.send_and_wait(SendShape::Many(msgs), tag, timeout)
  }

  /// Synchronous send over the reserved ambient slot, for protocols with at
  /// most one outstanding request per channel.
  pub fn send_circle_msg(self: &Arc<Self>, msg: Msg, timeout: Option<Duration>) -> Result<Msg> {
    self.send_and_wait(SendShape::One(msg), AMBIENT, timeout)
  }

  pub fn send_multiple_circle_msg(
    self: &Arc<Self>,
    msgs: Vec<Msg>,
    timeout: Option<Duration>,
  ) -> Result<Msg> {
    self.send_and_wait(SendShape::Many(msgs), AMBIENT, timeout)
  }

  fn send_and_wait(
    self: &Arc<Self>,
    shape: SendShape,
    tag: u32,
    timeout: Option<Duration>,
  ) -> Result<Msg> {
    let timeout = timeout.unwrap_or(self.send_timeout);
    let tagged = TaggedMsg::new(tag);

    // Register before the write goes out, so a fast reply can never beat
    // its own registration. A dead shard can never answer.
    if !self
      .poller
      .submit(PollerTask::Register { channel: self.clone(), tagged: tagged.clone() })
    {
      return Err(NetError::ShuttingDown);
    }

    let on_success = {
      let tagged = tagged.clone();
      move |channel: &Arc<Channel>| {
        let wheel = channel.wheel().clone();
        let poller = channel.poller().clone();
        let channel = channel.clone();
        wheel.schedule(timeout, move || {
          poller.submit(PollerTask::Unregister { channel, tagged });
        });
      }
    };
    let on_failure = {
      let tagged = tagged.clone();
      move |channel: &Arc<Channel>| {
        tagged.carrier.fail();
        channel.poller().submit(PollerTask::Unregister { channel: channel.clone(), tagged });
      }
    };
    let callback = Some(WriterCallback::new(on_success, on_failure));

    let task = match shape {
      SendShape::One(msg) => WriterTask::Single { channel: self.clone(), msg, callback },
      SendShape::Many(msgs) => WriterTask::Multiple { channel: self.clone(), msgs, callback },
    };
    if !self.writer.submit(task) {
      // The registration may or may not have been applied; failing the
      // carrier first makes the resolution unconditional.
      tagged.carrier.fail();
      self.poller.submit(PollerTask::Unregister { channel: self.clone(), tagged: tagged.clone() });
      return Err(NetError::SendFailed);
    }

    tagged.carrier.wait().ok_or(NetError::SendFailed)
  }

  /// Graceful shutdown: run the handler's pre-shutdown hook, then instruct
  /// the writer to half-close once its backlog drains; the full close
  /// follows within `grace` of the half-close. Idempotent.
  pub fn shutdown(self: &Arc<Self>, grace: Duration) {
    if self
      .shutdown_started
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
      .is_err()
    {
      return;
    }
    if let Err(err) = self.handler.on_shutdown(self) {
      tracing::error!(socket = %self.socket, %err, "on_shutdown failed");
      self.writer.submit(WriterTask::Close { channel: self.clone() });
      return;
    }
    self.writer.submit(WriterTask::Shutdown { channel: self.clone(), grace });
  }

  /// [`Channel::shutdown`] with the engine's configured default grace.
  pub fn shutdown_default(self: &Arc<Self>) {
    let grace = self.shutdown_timeout;
    self.shutdown(grace)
  }

  // --- registration-state transitions -----------------------------------
  //
  // All four helpers below lock the shared state word; they are the only
  // code that issues multiplexer ctl calls for an established channel.

  /// Poller-side: arm exactly `expected`, whatever is currently armed.
  pub(crate) fn ctl_interest_exact(&self, expected: u32) -> io::Result<()> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let current = *state & interest::READ_WRITE;
    if current != expected {
      self.poller.mux().ctl(self.socket, current, expected)?;
      *state = (*state - current) + expected;
    }
    Ok(())
  }

  /// Writer-side: add `need` to the armed set, unless the poller has
  /// already torn the channel down.
  pub(crate) fn arm_from_writer(&self, need: u32) -> io::Result<ArmOutcome> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if *state & POLLER_GONE != 0 {
      return Ok(ArmOutcome::PollerGone);
    }
    let from = *state & interest::READ_WRITE;
    let to = from | need;
    if to != from {
      self.poller.mux().ctl(self.socket, from, to)?;
      *state = (*state - from) + to;
    }
    Ok(ArmOutcome::Armed)
  }

  /// Poller-side teardown: disarm everything, mark the poller gone.
  /// Returns true when the writer is already gone, in which case the caller
  /// owns the physical close.
  pub(crate) fn detach_from_poller(&self) -> bool {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let current = *state & interest::READ_WRITE;
    if current != interest::NONE {
      if let Err(err) = self.poller.mux().ctl(self.socket, current, interest::NONE) {
        tracing::debug!(socket = %self.socket, %err, "disarm on teardown failed");
      }
      *state -= current;
    }
    let writer_gone = *state & WRITER_GONE != 0;
    *state |= POLLER_GONE;
    writer_gone
  }

  /// Writer-side teardown: mark the writer gone. Returns true when the
  /// poller is already gone, in which case the caller owns the physical
  /// close.
  pub(crate) fn detach_from_writer(&self) -> bool {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let poller_gone = *state & POLLER_GONE != 0;
    *state |= WRITER_GONE;
    poller_gone
  }

  /// Close the socket. Reached through exactly one of the detach paths.
  pub(crate) fn close_socket(&self) {
    if let Err(err) = os::close_socket(self.socket) {
      tracing::error!(socket = %self.socket, %err, "close failed");
    }
  }
}

enum SendShape {
  One(Msg),
  Many(Vec<Msg>),
}

#[cfg(test)]
mod tests {
  use super::*;

  // next_tag is pure arithmetic on an atomic; exercise the wrap-around
  // without a full channel.
  #[test]
  fn test_tag_counter_skips_ambient_on_wrap() {
    let counter = AtomicU32::new(u32::MAX);
    let next = |current: u32| if current == u32::MAX { AMBIENT + 1 } else { current + 1 };
    let issued = counter.swap(next(u32::MAX), Ordering::Relaxed);
    assert_eq!(issued, u32::MAX);
    assert_eq!(counter.load(Ordering::Relaxed), 1);
    assert_ne!(counter.load(Ordering::Relaxed), AMBIENT);
  }

  #[test]
  fn test_state_bits_do_not_overlap_interest() {
    assert_eq!(POLLER_GONE & interest::READ_WRITE, 0);
    assert_eq!(WRITER_GONE & interest::READ_WRITE, 0);
    assert_ne!(POLLER_GONE, WRITER_GONE);
  }
}
