//! Net: the engine front object.
//!
//! Owns the poller and writer shards, the timer wheel and every master
//! thread. Application code builds one `Net`, registers listeners and/or
//! dials out, then eventually calls `shutdown`, which drains everything
//! cooperatively: masters stop accepting, every live channel is asked to
//! shut down within the grace period, and the shard threads exit once their
//! tables empty.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use crate::api::{DecoderSupplier, EncoderSupplier, HandlerSupplier};
use crate::channel::Channel;
use crate::config::{NetConfig, SocketOptions};
use crate::error::{NetError, Result};
use crate::master::{self, ListenerConfig, Master};
use crate::os;
use crate::poller::{Poller, PollerTask};
use crate::sentry::Provider;
use crate::wheel::Wheel;
use crate::writer::{Writer, WriterTask};

/// The per-engine shard set handed to masters and `connect`: pick a
/// poller/writer pair round-robin, plus the shared wheel.
#[derive(Clone)]
pub(crate) struct Shards {
  pollers: Arc<Vec<Poller>>,
  writers: Arc<Vec<Writer>>,
  wheel: Wheel,
}

impl Shards {
  pub(crate) fn poller(&self, seq: usize) -> &Poller {
    &self.pollers[seq % self.pollers.len()]
  }

  pub(crate) fn writer(&self, seq: usize) -> &Writer {
    &self.writers[seq % self.writers.len()]
  }

  pub(crate) fn wheel(&self) -> &Wheel {
    &self.wheel
  }
}

pub struct Net {
  config: NetConfig,
  shards: Shards,
  poller_threads: Vec<JoinHandle<()>>,
  writer_threads: Vec<JoinHandle<()>>,
  wheel_thread: JoinHandle<()>,
  masters: Mutex<Vec<Master>>,
  counter: AtomicUsize,
  closing: AtomicBool,
}

impl Net {
  /// Spawn the shard threads. No sockets exist until a listener is added or
  /// a connection dialed.
  pub fn new(config: NetConfig) -> Result<Net> {
    if config.poller_count == 0 || config.writer_count == 0 {
      return Err(NetError::Config("shard counts must be non-zero".into()));
    }
    let (wheel, wheel_thread) = Wheel::spawn();

    let mut pollers = Vec::with_capacity(config.poller_count);
    let mut poller_threads = Vec::with_capacity(config.poller_count);
    for sequence in 0..config.poller_count {
      let (poller, thread) =
        Poller::spawn(sequence, &config).map_err(|e| NetError::io("spawn poller", e))?;
      pollers.push(poller);
      poller_threads.push(thread);
    }

    let mut writers = Vec::with_capacity(config.writer_count);
    let mut writer_threads = Vec::with_capacity(config.writer_count);
    for sequence in 0..config.writer_count {
      let (writer, thread) =
        Writer::spawn(sequence, &config).map_err(|e| NetError::io("spawn writer", e))?;
      writers.push(writer);
      writer_threads.push(thread);
    }

    info!(
      pollers = config.poller_count,
      writers = config.writer_count,
      "engine started"
    );
    Ok(Net {
      shards: Shards {
        pollers: Arc::new(pollers),
        writers: Arc::new(writers),
        wheel,
      },
      config,
      poller_threads,
      writer_threads,
      wheel_thread,
      masters: Mutex::new(Vec::new()),
      counter: AtomicUsize::new(0),
      closing: AtomicBool::new(false),
    })
  }

  /// Bind a listening address and start accepting on it. Returns the bound
  /// address, which differs from the requested one when port zero was used.
  pub fn add_listener(&self, listener: ListenerConfig) -> Result<SocketAddr> {
    if self.closing.load(Ordering::Acquire) {
      return Err(NetError::ShuttingDown);
    }
    let mut masters = self.masters.lock().unwrap_or_else(|e| e.into_inner());
    let sequence = masters.len();
    let (master, bound) =
      Master::spawn(sequence, listener, self.shards.clone(), &self.config)?;
    masters.push(master);
    Ok(bound)
  }

  /// Dial out. The returned channel is still handshaking; it becomes usable
  /// when the handler's `on_connected` fires. A handshake that outlives the
  /// configured connect timeout is torn down.
  pub fn connect(
    &self,
    remote: SocketAddr,
    provider: Provider,
    encoder: EncoderSupplier,
    decoder: DecoderSupplier,
    handler: HandlerSupplier,
    socket_options: SocketOptions,
  ) -> Result<Arc<Channel>> {
    if self.closing.load(Ordering::Acquire) {
      return Err(NetError::ShuttingDown);
    }
    let socket = os::create_socket(&remote).map_err(|e| NetError::io("socket", e))?;
    if let Err(err) = os::configure(socket, &socket_options, remote.is_ipv6())
      .and_then(|_| os::connect(socket, &remote))
    {
      let _ = os::close_socket(socket);
      return Err(NetError::io("connect", err));
    }

    let listener = ListenerConfig {
      loc: remote,
      provider,
      socket_options,
      encoder,
      decoder,
      handler,
    };
    let seq = self.counter.fetch_add(1, Ordering::Relaxed);
    let channel =
      master::bind_connection(&listener, &self.shards, &self.config, socket, remote, seq)?;

    // A sentry that never completes is cancelled; Unbind ignores channels
    // that already promoted.
    let poller = channel.poller().clone();
    let pending = channel.clone();
    self.shards.wheel().schedule(self.config.connect_timeout, move || {
      poller.submit(PollerTask::Unbind { channel: pending });
    });
    Ok(channel)
  }

  /// Cooperative shutdown: stop accepting, ask every channel to drain and
  /// close within `grace`, then join all engine threads.
  pub fn shutdown(self, grace: Duration) {
    self.closing.store(true, Ordering::Release);

    let masters: Vec<Master> =
      self.masters.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
    for master in masters {
      master.stop();
    }

    for poller in self.shards.pollers.iter() {
      poller.submit(PollerTask::Exit { grace });
    }
    for writer in self.shards.writers.iter() {
      writer.submit(WriterTask::Exit);
    }
    for thread in self.poller_threads {
      let _ = thread.join();
    }
    for thread in self.writer_threads {
      let _ = thread.join();
    }

    self.shards.wheel.stop();
    let _ = self.wheel_thread.join();
    info!("engine stopped");
  }
}
