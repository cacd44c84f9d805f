//! Writer: the per-shard thread that performs every non-blocking send.
//!
//! Encoding and send() both carry real cost; keeping them off the poller
//! thread stops a slow outbound path from starving inbound processing, and
//! keeps all backpressure bookkeeping single-threaded and lock-free. The
//! writer consumes its task queue with a blocking receive - unlike the
//! poller it has no multiplexer to wait on.
//!
//! Per-channel ordering: messages are encoded and attempted in submission
//! order, and anything that cannot be sent lands in a FIFO backlog that is
//! drained from the front. There is no reordering across retries.

use std::collections::{HashMap, VecDeque};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::api::{Encoder, Msg};
use crate::channel::{ArmOutcome, Channel};
use crate::config::NetConfig;
use crate::os::{Socket, interest};
use crate::poller::PollerTask;
use crate::protocol::{Protocol, WriteOutcome};

/// Completion callback for a single submitted send. Success means the bytes
/// were handed to the OS (or queued and later handed over); failure means
/// the connection died first. Exactly one of the two fires, at most once.
pub struct WriterCallback {
  on_success: Option<Box<dyn FnOnce(&Arc<Channel>) + Send>>,
  on_failure: Option<Box<dyn FnOnce(&Arc<Channel>) + Send>>,
}

impl WriterCallback {
  pub fn new(
    on_success: impl FnOnce(&Arc<Channel>) + Send + 'static,
    on_failure: impl FnOnce(&Arc<Channel>) + Send + 'static,
  ) -> WriterCallback {
    WriterCallback {
      on_success: Some(Box::new(on_success)),
      on_failure: Some(Box::new(on_failure)),
    }
  }

  fn invoke_success(mut self, channel: &Arc<Channel>) {
    if let Some(f) = self.on_success.take() {
      f(channel)
    }
  }

  fn invoke_failure(mut self, channel: &Arc<Channel>) {
    if let Some(f) = self.on_failure.take() {
      f(channel)
    }
  }
}

pub(crate) enum WriterTask {
  Initiate { channel: Arc<Channel>, protocol: Protocol, encoder: Box<dyn Encoder> },
  Single { channel: Arc<Channel>, msg: Msg, callback: Option<WriterCallback> },
  Multiple { channel: Arc<Channel>, msgs: Vec<Msg>, callback: Option<WriterCallback> },
  Writable { channel: Arc<Channel> },
  Shutdown { channel: Arc<Channel>, grace: Duration },
  Close { channel: Arc<Channel> },
  PotentialExit,
  Exit,
}

/// Cloneable handle to a writer shard.
#[derive(Clone)]
pub(crate) struct Writer {
  tx: Sender<WriterTask>,
}

impl Writer {
  pub(crate) fn spawn(sequence: usize, config: &NetConfig) -> std::io::Result<(Writer, JoinHandle<()>)> {
    let (tx, rx) = unbounded::<WriterTask>();
    let config = config.clone();
    let handle = std::thread::Builder::new()
      .name(format!("muxio-writer-{sequence}"))
      .spawn(move || run(sequence, rx, config))?;
    Ok((Writer { tx }, handle))
  }

  /// Submission never blocks. Returns false when the shard has already
  /// exited (engine teardown); callers with a waiting carrier must resolve
  /// it themselves then.
  pub(crate) fn submit(&self, task: WriterTask) -> bool {
    self.tx.send(task).is_ok()
  }
}

#[derive(PartialEq)]
enum RunState {
  Running,
  Closing,
}

fn run(sequence: usize, rx: Receiver<WriterTask>, config: NetConfig) {
  info!(sequence, "writer thread starting");
  let mut nodes: HashMap<Socket, WriterNode> = HashMap::with_capacity(config.map_size);
  let mut scratch: Vec<u8> = Vec::with_capacity(config.write_buffer_size);
  let mut state = RunState::Running;

  while let Ok(task) = rx.recv() {
    match task {
      WriterTask::Initiate { channel, protocol, encoder } => {
        let socket = channel.socket();
        nodes.insert(
          socket,
          WriterNode {
            channel,
            protocol,
            encoder,
            backlog: VecDeque::new(),
            pending_shutdown: None,
          },
        );
      }
      WriterTask::Single { channel, msg, callback } => {
        with_node(&mut nodes, &channel, callback, |node, callback| {
          node.on_msg(&mut scratch, std::slice::from_ref(&msg), callback)
        });
      }
      WriterTask::Multiple { channel, msgs, callback } => {
        with_node(&mut nodes, &channel, callback, |node, callback| {
          node.on_msg(&mut scratch, &msgs, callback)
        });
      }
      WriterTask::Writable { channel } => {
        with_node(&mut nodes, &channel, None, |node, _| node.on_writable());
      }
      WriterTask::Shutdown { channel, grace } => {
        with_node(&mut nodes, &channel, None, |node, _| node.on_shutdown(grace));
      }
      WriterTask::Close { channel } => {
        with_node(&mut nodes, &channel, None, |node, _| node.close());
      }
      WriterTask::PotentialExit => {
        if state == RunState::Closing && nodes.is_empty() {
          break;
        }
      }
      WriterTask::Exit => {
        if state == RunState::Running {
          if nodes.is_empty() {
            break;
          }
          // Nodes drain through the shutdowns the poller side initiates.
          state = RunState::Closing;
        }
      }
    }
  }
  info!(sequence, "writer thread exiting");
}

/// Take-out/put-back dispatch: the node is removed from the table while it
/// handles the task, so teardown paths are a plain "don't put it back".
fn with_node<F>(
  nodes: &mut HashMap<Socket, WriterNode>,
  channel: &Arc<Channel>,
  callback: Option<WriterCallback>,
  f: F,
) where
  F: FnOnce(&mut WriterNode, Option<WriterCallback>) -> NodeFate,
{
  let socket = channel.socket();
  let Some(mut node) = nodes.remove(&socket) else {
    // The channel is already gone; a pending synchronous send must still
    // resolve.
    if let Some(cb) = callback {
      cb.invoke_failure(channel);
    }
    return;
  };
  match f(&mut node, callback) {
    NodeFate::Keep => {
      nodes.insert(socket, node);
    }
    NodeFate::Gone => {
      if nodes.is_empty() {
        node.channel.writer().submit(WriterTask::PotentialExit);
      }
    }
  }
}

enum NodeFate {
  Keep,
  Gone,
}

struct BacklogEntry {
  data: BytesMut,
  callback: Option<WriterCallback>,
}

/// Per-socket write state: the established protocol, the encoder, and the
/// FIFO of not-yet-sent buffers while the socket is not writable.
struct WriterNode {
  channel: Arc<Channel>,
  protocol: Protocol,
  encoder: Box<dyn Encoder>,
  backlog: VecDeque<BacklogEntry>,
  /// A shutdown arrived while the backlog was non-empty; performed once the
  /// backlog drains.
  pending_shutdown: Option<Duration>,
}

impl WriterNode {
  fn on_msg(
    &mut self,
    scratch: &mut Vec<u8>,
    msgs: &[Msg],
    callback: Option<WriterCallback>,
  ) -> NodeFate {
    // With a non-empty backlog the scratch buffer may still back queued
    // data, so encode into a fresh heap buffer instead.
    let mut heap;
    let buf: &mut Vec<u8> = if self.backlog.is_empty() {
      scratch.clear();
      scratch
    } else {
      heap = Vec::new();
      &mut heap
    };

    for msg in msgs {
      if let Err(err) = self.encoder.encode(buf, msg) {
        error!(socket = %self.channel.socket(), %err, "encoder failed");
        if let Some(cb) = callback {
          cb.invoke_failure(&self.channel);
        }
        return self.close();
      }
    }

    if buf.is_empty() {
      // Nothing to put on the wire counts as success.
      if let Some(cb) = callback {
        cb.invoke_success(&self.channel);
      }
      return NodeFate::Keep;
    }

    if self.backlog.is_empty() {
      // The scratch buffer never escapes: any unsent remainder is copied
      // into an owned backlog entry before returning.
      let data: &[u8] = buf;
      self.attempt_send(data, callback)
    } else {
      self.backlog.push_back(BacklogEntry {
        data: BytesMut::from(&buf[..]),
        callback,
      });
      NodeFate::Keep
    }
  }

  /// Direct-send path, only taken with an empty backlog. Loops over partial
  /// sends; on would-block the unsent remainder becomes the first backlog
  /// entry and write interest is armed.
  fn attempt_send(&mut self, data: &[u8], callback: Option<WriterCallback>) -> NodeFate {
    let mut offset = 0usize;
    loop {
      match self.protocol.do_write(&data[offset..]) {
        Ok(WriteOutcome::Consumed(n)) => {
          offset += n;
          if offset == data.len() {
            if let Some(cb) = callback {
              cb.invoke_success(&self.channel);
            }
            return NodeFate::Keep;
          }
          if n == 0 {
            // No progress without an explicit block signal; treat it as
            // backpressure rather than spinning.
            self.backlog.push_back(BacklogEntry {
              data: BytesMut::from(&data[offset..]),
              callback,
            });
            return self.arm(interest::WRITE);
          }
        }
        Ok(WriteOutcome::Blocked { consumed, need }) => {
          offset += consumed;
          self.backlog.push_back(BacklogEntry {
            data: BytesMut::from(&data[offset..]),
            callback,
          });
          return self.arm(need);
        }
        Err(err) => {
          error!(socket = %self.channel.socket(), %err, "send failed");
          if let Some(cb) = callback {
            cb.invoke_failure(&self.channel);
          }
          return self.close();
        }
      }
    }
  }

  /// Writability returned: drain the backlog from the front, stopping at
  /// the first entry that still cannot complete.
  fn on_writable(&mut self) -> NodeFate {
    while let Some(mut entry) = self.backlog.pop_front() {
      loop {
        if entry.data.is_empty() {
          // A zero-length entry is a flush marker: the transport accepted
          // the plaintext but still holds queued records.
          match self.protocol.do_write(&[]) {
            Ok(WriteOutcome::Consumed(_)) => break,
            Ok(WriteOutcome::Blocked { need, .. }) => {
              self.backlog.push_front(entry);
              return self.arm(need);
            }
            Err(err) => {
              error!(socket = %self.channel.socket(), %err, "flush failed");
              if let Some(cb) = entry.callback.take() {
                cb.invoke_failure(&self.channel);
              }
              return self.close();
            }
          }
        } else {
          match self.protocol.do_write(&entry.data[..]) {
            Ok(WriteOutcome::Consumed(n)) => {
              entry.data.advance(n);
              if n == 0 {
                self.backlog.push_front(entry);
                return self.arm(interest::WRITE);
              }
            }
            Ok(WriteOutcome::Blocked { consumed, need }) => {
              entry.data.advance(consumed);
              self.backlog.push_front(entry);
              return self.arm(need);
            }
            Err(err) => {
              error!(socket = %self.channel.socket(), %err, "send failed");
              if let Some(cb) = entry.callback.take() {
                cb.invoke_failure(&self.channel);
              }
              return self.close();
            }
          }
        }
      }
      if let Some(cb) = entry.callback {
        cb.invoke_success(&self.channel);
      }
    }

    // Backlog drained; a deferred shutdown can proceed now.
    if let Some(grace) = self.pending_shutdown.take() {
      return self.shutdown_now(grace);
    }
    NodeFate::Keep
  }

  fn on_shutdown(&mut self, grace: Duration) -> NodeFate {
    if self.backlog.is_empty() {
      self.shutdown_now(grace)
    } else {
      // Remember the request and hard-close if draining outlives the grace.
      self.pending_shutdown = Some(grace);
      let channel = self.channel.clone();
      self.channel.wheel().schedule(grace, move || {
        channel.writer().submit(WriterTask::Close { channel: channel.clone() });
      });
      NodeFate::Keep
    }
  }

  /// Half-close now, schedule the full close after the grace period.
  fn shutdown_now(&mut self, grace: Duration) -> NodeFate {
    debug_assert!(self.backlog.is_empty());
    if self.channel.detach_from_writer() {
      self.protocol.do_close();
    } else {
      match self.protocol.do_shutdown() {
        Ok(()) => {
          let channel = self.channel.clone();
          self.channel.wheel().schedule(grace, move || {
            channel.poller().submit(PollerTask::Close { channel: channel.clone() });
          });
        }
        Err(err) => {
          debug!(socket = %self.channel.socket(), %err, "half-close failed");
          self
            .channel
            .poller()
            .submit(PollerTask::Close { channel: self.channel.clone() });
        }
      }
    }
    NodeFate::Gone
  }

  /// Force-remove: fail every queued callback and hand the close to
  /// whichever side is still alive.
  fn close(&mut self) -> NodeFate {
    for entry in self.backlog.drain(..) {
      if let Some(cb) = entry.callback {
        cb.invoke_failure(&self.channel);
      }
    }
    if self.channel.detach_from_writer() {
      self.protocol.do_close();
    } else {
      self
        .channel
        .poller()
        .submit(PollerTask::Close { channel: self.channel.clone() });
    }
    NodeFate::Gone
  }

  /// Ask the multiplexer for `need`; if the poller already tore the channel
  /// down there is nothing left to wait for.
  fn arm(&mut self, need: u32) -> NodeFate {
    match self.channel.arm_from_writer(need) {
      Ok(ArmOutcome::Armed) => NodeFate::Keep,
      Ok(ArmOutcome::PollerGone) => self.close(),
      Err(err) => {
        error!(socket = %self.channel.socket(), %err, "arming write interest failed");
        self.close()
      }
    }
  }
}

