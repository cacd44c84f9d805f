//! Configuration surface for the engine.

use std::time::Duration;

/// Socket options applied to listening and accepted/connected sockets.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
  /// SO_REUSEADDR on the listening socket.
  pub reuse_addr: bool,
  /// SO_KEEPALIVE on established sockets.
  pub keep_alive: bool,
  /// TCP_NODELAY on established sockets.
  pub no_delay: bool,
  /// IPV6_V6ONLY for IPv6 sockets.
  pub ipv6_only: bool,
}

impl Default for SocketOptions {
  fn default() -> Self {
    Self { reuse_addr: true, keep_alive: false, no_delay: true, ipv6_only: false }
  }
}

/// Engine-wide configuration: shard counts, buffer sizes and timeouts.
#[derive(Debug, Clone)]
pub struct NetConfig {
  /// Number of poller threads. Incoming connections are spread over them
  /// round-robin.
  pub poller_count: usize,
  /// Number of writer threads.
  pub writer_count: usize,
  /// Capacity of the event array handed to each multiplexer wait.
  pub max_events: usize,
  /// Bounded wait applied to every multiplexer wait so poller and master
  /// threads can observe shutdown promptly.
  pub mux_timeout: Duration,
  /// Size of each poller's per-slot scratch read buffer.
  pub read_buffer_size: usize,
  /// Size of each writer's reusable scratch write buffer.
  pub write_buffer_size: usize,
  /// Initial capacity of the per-thread socket tables.
  pub map_size: usize,
  /// Listen backlog.
  pub backlog: i32,
  /// How long an outbound connection may stay in its handshake before the
  /// sentry is torn down.
  pub connect_timeout: Duration,
  /// Default timeout for synchronous sends when the caller passes `None`.
  pub send_timeout: Duration,
  /// Default grace period for `Channel::shutdown`.
  pub shutdown_timeout: Duration,
}

impl Default for NetConfig {
  fn default() -> Self {
    Self {
      poller_count: 1,
      writer_count: 1,
      max_events: 256,
      mux_timeout: Duration::from_millis(25),
      read_buffer_size: 64 * 1024,
      write_buffer_size: 64 * 1024,
      map_size: 1024,
      backlog: 1024,
      connect_timeout: Duration::from_secs(5),
      send_timeout: Duration::from_secs(30),
      shutdown_timeout: Duration::from_secs(5),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_sane() {
    let cfg = NetConfig::default();
    assert!(cfg.poller_count >= 1);
    assert!(cfg.writer_count >= 1);
    assert!(cfg.max_events > 0);
    assert!(cfg.mux_timeout < cfg.connect_timeout);
    assert!(cfg.read_buffer_size > 0 && cfg.write_buffer_size > 0);
  }
}
