//! Poller: the per-shard thread that owns one multiplexer and every
//! per-socket read-side state machine.
//!
//! The loop waits on the multiplexer with a short timeout, drains its task
//! queue, then dispatches the returned events. Each socket maps to exactly
//! one node: a sentry node while the connection is establishing, atomically
//! swapped for a protocol node on completion. All node state lives on this
//! thread; the rest of the engine reaches it only through tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info};

use crate::api::{Correlation, Decoder, Encoder, Msg};
use crate::carrier::TaggedMsg;
use crate::channel::{AMBIENT, Channel};
use crate::config::NetConfig;
use crate::os::{self, EventKind, OsMux, ReadinessMux, Socket, interest};
use crate::protocol::{Protocol, ReadEvent};
use crate::sentry::{Sentry, SentryVerdict};
use crate::writer::WriterTask;

pub(crate) enum PollerTask {
  /// Insert a sentry node for a freshly created connection. The decoder and
  /// encoder travel with it: the decoder stays on this thread, the encoder
  /// is forwarded to the writer once the handshake completes.
  Bind {
    channel: Arc<Channel>,
    sentry: Sentry,
    decoder: Box<dyn Decoder>,
    encoder: Box<dyn Encoder>,
  },
  /// Cancel a connection that is still in its handshake (connect timeout).
  /// A node that already promoted to protocol is left alone.
  Unbind { channel: Arc<Channel> },
  /// Install a correlation entry before the matching request is written.
  Register { channel: Arc<Channel>, tagged: TaggedMsg },
  /// Remove a correlation entry, resolving it with the failure sentinel if
  /// it is still pending (timeout and teardown paths).
  Unregister { channel: Arc<Channel>, tagged: TaggedMsg },
  /// Force-remove a node and tear the connection down.
  Close { channel: Arc<Channel> },
  PotentialExit,
  Exit { grace: Duration },
}

/// Cloneable handle to a poller shard: its task queue plus the shared
/// multiplexer, which the writer side needs for interest changes.
#[derive(Clone)]
pub(crate) struct Poller {
  tx: Sender<PollerTask>,
  mux: Arc<OsMux>,
}

impl Poller {
  pub(crate) fn spawn(
    sequence: usize,
    config: &NetConfig,
  ) -> std::io::Result<(Poller, JoinHandle<()>)> {
    let mux = Arc::new(OsMux::new()?);
    let (tx, rx) = unbounded::<PollerTask>();
    let thread_mux = Arc::clone(&mux);
    let config = config.clone();
    let handle = std::thread::Builder::new()
      .name(format!("muxio-poller-{sequence}"))
      .spawn(move || run(sequence, thread_mux, rx, config))?;
    Ok((Poller { tx, mux }, handle))
  }

  /// Returns false when the shard has already exited (engine teardown);
  /// callers with a waiting carrier must resolve it themselves then.
  pub(crate) fn submit(&self, task: PollerTask) -> bool {
    self.tx.send(task).is_ok()
  }

  pub(crate) fn mux(&self) -> &OsMux {
    &self.mux
  }
}

#[derive(PartialEq, Clone, Copy)]
enum RunState {
  Running,
  Closing,
  Stopped,
}

fn run(sequence: usize, mux: Arc<OsMux>, rx: Receiver<PollerTask>, config: NetConfig) {
  info!(sequence, "poller thread starting");
  let mut nodes: HashMap<Socket, PollerNode> = HashMap::with_capacity(config.map_size);
  let mut events = os::event_buffer(config.max_events);
  let mut scratch: Vec<Vec<u8>> =
    (0..config.max_events).map(|_| vec![0u8; config.read_buffer_size]).collect();
  let mut state = RunState::Running;

  loop {
    let n = match mux.wait(&mut events, config.mux_timeout) {
      Ok(n) => n,
      Err(err) if os::is_interrupted(&err) => continue,
      Err(err) => {
        // Multiplexer-level faults are the only ones allowed to take the
        // thread down; everything still in the table is torn down first.
        error!(sequence, %err, "mux wait failed, terminating poller");
        break;
      }
    };

    state = drain_tasks(&mut nodes, &rx, state);
    if state == RunState::Stopped {
      break;
    }

    for index in 0..n {
      let event = OsMux::decode(&events[index]);
      dispatch_event(&mut nodes, event.socket, event.kind, &mut scratch[index]);
    }
  }

  for (_, node) in nodes.drain() {
    match node {
      PollerNode::Sentry(sentry) => sentry.close(),
      PollerNode::Protocol(mut protocol) => protocol.close(),
    }
  }
  info!(sequence, "poller thread exiting");
}

fn drain_tasks(
  nodes: &mut HashMap<Socket, PollerNode>,
  rx: &Receiver<PollerTask>,
  mut state: RunState,
) -> RunState {
  while let Ok(task) = rx.try_recv() {
    match task {
      PollerTask::Bind { channel, sentry, decoder, encoder } => {
        let socket = channel.socket();
        nodes.insert(socket, PollerNode::Sentry(SentryNode { channel, sentry, decoder, encoder }));
      }
      PollerTask::Unbind { channel } => {
        let socket = channel.socket();
        let still_handshaking = matches!(
          nodes.get(&socket),
          Some(PollerNode::Sentry(node)) if Arc::ptr_eq(&node.channel, &channel)
        );
        if still_handshaking {
          if let Some(PollerNode::Sentry(node)) = nodes.remove(&socket) {
            debug!(socket = %socket, "handshake cancelled");
            node.close();
            check_potential_exit(nodes, &channel);
          }
        }
      }
      PollerTask::Register { channel, tagged } => {
        match nodes.get_mut(&channel.socket()) {
          Some(PollerNode::Protocol(node)) if Arc::ptr_eq(&node.channel, &channel) => {
            node.register(tagged);
          }
          // No established node: the send can never be answered, so the
          // waiting caller is released immediately.
          _ => {
            tagged.carrier.fail();
          }
        }
      }
      PollerTask::Unregister { channel, tagged } => {
        match nodes.get_mut(&channel.socket()) {
          Some(PollerNode::Protocol(node)) if Arc::ptr_eq(&node.channel, &channel) => {
            node.unregister(&tagged);
          }
          _ => {
            tagged.carrier.fail();
          }
        }
      }
      PollerTask::Close { channel } => {
        let socket = channel.socket();
        let matches_channel = match nodes.get(&socket) {
          Some(node) => Arc::ptr_eq(node.channel(), &channel),
          None => false,
        };
        if matches_channel {
          match nodes.remove(&socket) {
            Some(PollerNode::Sentry(node)) => node.close(),
            Some(PollerNode::Protocol(mut node)) => node.close(),
            None => {}
          }
          check_potential_exit(nodes, &channel);
        }
      }
      PollerTask::PotentialExit => {
        if state == RunState::Closing && nodes.is_empty() {
          return RunState::Stopped;
        }
      }
      PollerTask::Exit { grace } => {
        if state == RunState::Running {
          if nodes.is_empty() {
            return RunState::Stopped;
          }
          let sockets: Vec<Socket> = nodes.keys().copied().collect();
          for socket in sockets {
            match nodes.remove(&socket) {
              Some(PollerNode::Sentry(node)) => node.close(),
              Some(PollerNode::Protocol(node)) => {
                node.channel.shutdown(grace);
                nodes.insert(socket, PollerNode::Protocol(node));
              }
              None => {}
            }
          }
          if nodes.is_empty() {
            return RunState::Stopped;
          }
          state = RunState::Closing;
        }
      }
    }
  }
  state
}

fn dispatch_event(
  nodes: &mut HashMap<Socket, PollerNode>,
  socket: Socket,
  kind: EventKind,
  scratch: &mut [u8],
) {
  // Take-out/put-back: the node is owned while it runs, which lets the
  // sentry -> protocol promotion replace it without aliasing the table.
  let Some(node) = nodes.remove(&socket) else {
    return;
  };
  match node {
    PollerNode::Sentry(node) => {
      let channel = node.channel.clone();
      match node.handle(kind) {
        Some(next) => {
          nodes.insert(socket, next);
        }
        None => check_potential_exit(nodes, &channel),
      }
    }
    PollerNode::Protocol(mut node) => {
      let keep = match kind {
        EventKind::Readable => node.on_readable(scratch),
        EventKind::Writable => node.on_writable(),
      };
      if keep {
        nodes.insert(socket, PollerNode::Protocol(node));
      } else {
        check_potential_exit(nodes, &node.channel);
      }
    }
  }
}

fn check_potential_exit(nodes: &HashMap<Socket, PollerNode>, channel: &Arc<Channel>) {
  if nodes.is_empty() {
    channel.poller().submit(PollerTask::PotentialExit);
  }
}

pub(crate) enum PollerNode {
  Sentry(SentryNode),
  Protocol(ProtocolNode),
}

impl PollerNode {
  fn channel(&self) -> &Arc<Channel> {
    match self {
      PollerNode::Sentry(node) => &node.channel,
      PollerNode::Protocol(node) => &node.channel,
    }
  }
}

/// Read-side state while the connection is establishing.
pub(crate) struct SentryNode {
  channel: Arc<Channel>,
  sentry: Sentry,
  decoder: Box<dyn Decoder>,
  encoder: Box<dyn Encoder>,
}

impl SentryNode {
  /// Returns the node to keep in the table, or `None` when the connection
  /// was torn down.
  fn handle(mut self, kind: EventKind) -> Option<PollerNode> {
    let verdict = match kind {
      EventKind::Readable => self.sentry.on_readable_event(),
      EventKind::Writable => self.sentry.on_writable_event(),
    };
    match verdict {
      Ok(SentryVerdict::NeedRead) => self.rearm(interest::READ),
      Ok(SentryVerdict::NeedWrite) => self.rearm(interest::WRITE),
      Ok(SentryVerdict::NeedBoth) => self.rearm(interest::READ_WRITE),
      Ok(SentryVerdict::Ignored) => Some(PollerNode::Sentry(self)),
      Ok(SentryVerdict::Complete) => self.promote(),
      Err(err) => {
        error!(socket = %self.channel.socket(), %err, "handshake failed");
        self.close();
        None
      }
    }
  }

  /// Arm exactly what the sentry asked for, never more.
  fn rearm(self, to: u32) -> Option<PollerNode> {
    match self.channel.ctl_interest_exact(to) {
      Ok(()) => Some(PollerNode::Sentry(self)),
      Err(err) => {
        error!(socket = %self.channel.socket(), %err, "interest change failed");
        self.close();
        None
      }
    }
  }

  /// Handshake complete: notify the application, fall back to read-only
  /// interest, swap in the protocol node and let the paired writer start
  /// accepting sends.
  fn promote(self) -> Option<PollerNode> {
    if let Err(err) = self.channel.handler().on_connected(&self.channel) {
      error!(socket = %self.channel.socket(), %err, "on_connected failed");
      self.close();
      return None;
    }
    if let Err(err) = self.channel.ctl_interest_exact(interest::READ) {
      error!(socket = %self.channel.socket(), %err, "interest change failed");
      self.close();
      return None;
    }
    let SentryNode { channel, sentry, decoder, encoder } = self;
    let protocol = sentry.into_protocol();
    channel.writer().submit(WriterTask::Initiate {
      channel: channel.clone(),
      protocol: protocol.clone(),
      encoder,
    });
    Some(PollerNode::Protocol(ProtocolNode::new(channel, protocol, decoder)))
  }

  fn close(self) {
    self.sentry.do_close();
    self.channel.handler().on_removed(&self.channel);
  }
}

/// Read-side state for an established connection: the protocol, the decoder
/// with its straddling residue, and the registered correlation entries.
pub(crate) struct ProtocolNode {
  channel: Arc<Channel>,
  protocol: Protocol,
  decoder: Box<dyn Decoder>,
  /// Bytes received but not yet decodable; new reads are appended before
  /// decoding so messages may straddle any number of events.
  residue: BytesMut,
  msg_map: HashMap<u32, TaggedMsg>,
  /// The single ordered-request slot addressed by the reserved ambient tag.
  ambient: Option<TaggedMsg>,
  out: Vec<Msg>,
}

impl ProtocolNode {
  fn new(channel: Arc<Channel>, protocol: Protocol, decoder: Box<dyn Decoder>) -> ProtocolNode {
    ProtocolNode {
      channel,
      protocol,
      decoder,
      residue: BytesMut::new(),
      msg_map: HashMap::new(),
      ambient: None,
      out: Vec::new(),
    }
  }

  /// Returns false when the node closed itself.
  fn on_readable(&mut self, scratch: &mut [u8]) -> bool {
    match self.protocol.on_readable_event(scratch) {
      Ok(ReadEvent::Data(0)) => {
        debug!(socket = %self.channel.socket(), "peer closed");
        self.close();
        false
      }
      Ok(ReadEvent::Data(n)) => self.on_receive(n, scratch),
      Ok(ReadEvent::Rearm(to)) => self.rearm(to),
      Ok(ReadEvent::Ignored) => true,
      Err(err) => {
        error!(socket = %self.channel.socket(), %err, "read failed");
        self.close();
        false
      }
    }
  }

  /// A writable event on an established connection means a pending write is
  /// newly possible. Sends live on the writer, so the signal is forwarded
  /// there - but only after the interest fallback has been applied, so the
  /// writer's re-arm cannot be swallowed by this disarm.
  fn on_writable(&mut self) -> bool {
    match self.protocol.on_writable_event() {
      Ok(hint) => {
        if !self.rearm(hint.rearm) {
          return false;
        }
        if hint.notify_writer {
          self.channel.writer().submit(WriterTask::Writable { channel: self.channel.clone() });
        }
        true
      }
      Err(err) => {
        error!(socket = %self.channel.socket(), %err, "writable event failed");
        self.close();
        false
      }
    }
  }

  fn rearm(&mut self, to: u32) -> bool {
    match self.channel.ctl_interest_exact(to) {
      Ok(()) => true,
      Err(err) => {
        error!(socket = %self.channel.socket(), %err, "interest change failed");
        self.close();
        false
      }
    }
  }

  fn on_receive(&mut self, len: usize, scratch: &[u8]) -> bool {
    self.residue.extend_from_slice(&scratch[..len]);
    if let Err(err) = self.decoder.decode(&mut self.residue, &mut self.out) {
      error!(socket = %self.channel.socket(), %err, "decoder failed");
      self.close();
      return false;
    }

    let mut decoded = std::mem::take(&mut self.out);
    for msg in decoded.drain(..) {
      match self.channel.handler().on_recv(&self.channel, msg) {
        Ok(Correlation::None) => {}
        Ok(Correlation::Ambient(reply)) => {
          if let Some(tagged) = self.ambient.take() {
            tagged.carrier.resolve(reply);
          }
          // No circle send in flight: the pushed message is dropped.
        }
        Ok(Correlation::Tag(tag, reply)) => {
          if let Some(tagged) = self.msg_map.remove(&tag) {
            tagged.carrier.resolve(reply);
          }
        }
        Err(err) => {
          error!(socket = %self.channel.socket(), %err, "on_recv failed");
          self.close();
          return false;
        }
      }
    }
    self.out = decoded;
    true
  }

  /// Callers are trusted not to register conflicting tags; if one slips
  /// through, the older carrier is released with the failure sentinel
  /// rather than left to hang.
  fn register(&mut self, tagged: TaggedMsg) {
    if tagged.tag == AMBIENT {
      if let Some(old) = self.ambient.replace(tagged) {
        old.carrier.fail();
      }
    } else if let Some(old) = self.msg_map.insert(tagged.tag, tagged) {
      old.carrier.fail();
    }
  }

  /// Remove a registration, resolving it with the failure sentinel. The
  /// carrier identity check keeps a timed-out unregister from cancelling a
  /// newer registration that reused the tag.
  fn unregister(&mut self, tagged: &TaggedMsg) {
    if tagged.tag == AMBIENT {
      if self.ambient.as_ref().is_some_and(|t| t.same_carrier(tagged)) {
        if let Some(old) = self.ambient.take() {
          old.carrier.fail();
        }
      }
    } else if self.msg_map.get(&tagged.tag).is_some_and(|t| t.same_carrier(tagged)) {
      if let Some(old) = self.msg_map.remove(&tagged.tag) {
        old.carrier.fail();
      }
    }
  }

  /// Remove and tear down: every outstanding carrier resolves with the
  /// failure sentinel, then the close is handed to whichever side of the
  /// channel is still alive.
  fn close(&mut self) {
    self.residue.clear();
    for (_, tagged) in self.msg_map.drain() {
      tagged.carrier.fail();
    }
    if let Some(tagged) = self.ambient.take() {
      tagged.carrier.fail();
    }
    if self.channel.detach_from_poller() {
      self.protocol.do_close();
    } else {
      self.channel.writer().submit(WriterTask::Close { channel: self.channel.clone() });
    }
    self.channel.handler().on_removed(&self.channel);
  }
}
