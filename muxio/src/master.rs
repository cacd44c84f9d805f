//! Master: the accept loop.
//!
//! One dedicated thread per listening address. It owns the listening socket
//! and its own small multiplexer, waits with a bounded timeout so shutdown
//! is observed promptly, and on readability accepts until would-block. Each
//! accepted socket is configured, wrapped in a channel, assigned to a
//! round-robin poller/writer pair and bound there as a sentry. The master
//! never decodes, encodes or dispatches application messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::api::{DecoderSupplier, EncoderSupplier, HandlerSupplier};
use crate::channel::Channel;
use crate::config::{NetConfig, SocketOptions};
use crate::error::{NetError, Result};
use crate::net::Shards;
use crate::os::{self, EventKind, OsMux, ReadinessMux, Socket, interest};
use crate::poller::PollerTask;
use crate::sentry::Provider;

/// Everything a listening address needs: where to bind, which transport to
/// speak, and the factories producing per-connection codec/handler state.
#[derive(Clone)]
pub struct ListenerConfig {
  pub loc: SocketAddr,
  pub provider: Provider,
  pub socket_options: SocketOptions,
  pub encoder: EncoderSupplier,
  pub decoder: DecoderSupplier,
  pub handler: HandlerSupplier,
}

pub(crate) struct Master {
  running: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
}

impl Master {
  /// Bind the listening socket on the caller's thread (so the bound address
  /// can be returned synchronously, port zero included), then start the
  /// accept loop.
  pub(crate) fn spawn(
    sequence: usize,
    listener: ListenerConfig,
    shards: Shards,
    config: &NetConfig,
  ) -> Result<(Master, SocketAddr)> {
    let (socket, bound) =
      os::bind_listener(&listener.loc, &listener.socket_options, config.backlog)
        .map_err(|e| NetError::io("bind/listen", e))?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let config = config.clone();
    let thread = std::thread::Builder::new()
      .name(format!("muxio-master-{sequence}"))
      .spawn(move || run(sequence, socket, bound, listener, shards, config, flag))
      .map_err(|e| NetError::io("spawn master", e))?;

    Ok((Master { running, thread: Some(thread) }, bound))
  }

  pub(crate) fn stop(mut self) {
    self.running.store(false, Ordering::Release);
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
  }
}

#[allow(clippy::too_many_arguments)]
fn run(
  sequence: usize,
  socket: Socket,
  bound: SocketAddr,
  listener: ListenerConfig,
  shards: Shards,
  config: NetConfig,
  running: Arc<AtomicBool>,
) {
  info!(sequence, %bound, "listening");
  let mux = match OsMux::new() {
    Ok(mux) => mux,
    Err(err) => {
      error!(sequence, %err, "failed to create accept mux");
      let _ = os::close_socket(socket);
      return;
    }
  };
  if let Err(err) = mux.ctl(socket, interest::NONE, interest::READ) {
    error!(sequence, %err, "failed to arm listening socket");
    let _ = os::close_socket(socket);
    return;
  }

  let mut events = os::event_buffer(config.max_events);
  let mut rr: usize = 0;

  while running.load(Ordering::Acquire) {
    let n = match mux.wait(&mut events, config.mux_timeout) {
      Ok(n) => n,
      Err(err) if os::is_interrupted(&err) => continue,
      Err(err) => {
        error!(sequence, %err, "mux wait failed, terminating master");
        break;
      }
    };

    for index in 0..n {
      let event = OsMux::decode(&events[index]);
      if event.socket != socket || event.kind != EventKind::Readable {
        continue;
      }
      accept_burst(&listener, &shards, &config, socket, &mut rr);
    }
  }

  info!(sequence, %bound, "master exiting");
  let _ = os::close_socket(socket);
}

/// Accept until the listening socket would block. A failed accept aborts the
/// burst but never the master.
fn accept_burst(
  listener: &ListenerConfig,
  shards: &Shards,
  config: &NetConfig,
  socket: Socket,
  rr: &mut usize,
) {
  loop {
    let (client, peer) = match os::accept(socket) {
      Ok(pair) => pair,
      Err(err) if os::is_would_block(&err) => return,
      Err(err) if os::is_interrupted(&err) => continue,
      Err(err) => {
        error!(%err, "accept failed");
        return;
      }
    };
    if let Err(err) = os::configure(client, &listener.socket_options, peer.is_ipv6()) {
      warn!(%peer, %err, "failed to configure accepted socket");
      let _ = os::close_socket(client);
      continue;
    }
    let seq = *rr;
    *rr = rr.wrapping_add(1);
    let _ = bind_connection(listener, shards, config, client, peer, seq);
  }
}

/// Shared between the accept path and `Net::connect`: wrap a configured
/// socket into a channel, build its sentry and hand both to a poller shard
/// with write interest armed.
pub(crate) fn bind_connection(
  listener: &ListenerConfig,
  shards: &Shards,
  config: &NetConfig,
  client: Socket,
  peer: SocketAddr,
  seq: usize,
) -> Result<Arc<Channel>> {
  let poller = shards.poller(seq);
  let writer = shards.writer(seq);
  let channel = Channel::new(
    client,
    peer,
    (listener.handler)(),
    poller.clone(),
    writer.clone(),
    shards.wheel().clone(),
    config.send_timeout,
    config.shutdown_timeout,
  );
  let sentry = match listener.provider.create(&channel) {
    Ok(sentry) => sentry,
    Err(err) => {
      error!(%peer, %err, "failed to create sentry");
      let _ = os::close_socket(client);
      return Err(err);
    }
  };
  poller.submit(PollerTask::Bind {
    channel: channel.clone(),
    sentry,
    decoder: (listener.decoder)(),
    encoder: (listener.encoder)(),
  });
  // The bind task is already queued, so the first writable event cannot
  // outrun it: tasks drain before events every poller iteration.
  if let Err(err) = poller.mux().ctl(client, interest::NONE, interest::WRITE) {
    error!(%peer, %err, "failed to arm accepted socket");
    poller.submit(PollerTask::Close { channel });
    return Err(NetError::io("arm socket", err));
  }
  Ok(channel)
}
