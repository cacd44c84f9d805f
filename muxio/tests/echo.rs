//! End-to-end reactor tests over loopback TCP.

mod common;

use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use muxio::{ListenerConfig, Net, NetConfig, NetError, Provider, SocketOptions};

fn quick_config() -> NetConfig {
  NetConfig {
    mux_timeout: Duration::from_millis(10),
    ..NetConfig::default()
  }
}

#[test]
fn test_circle_send_gets_pong() {
  let net = Net::new(quick_config()).unwrap();
  let (server_events, server_rx) = unbounded();
  let bound = net
    .add_listener(ListenerConfig {
      loc: "127.0.0.1:0".parse().unwrap(),
      provider: Provider::Tcp,
      socket_options: SocketOptions::default(),
      encoder: common::line_encoder(),
      decoder: common::line_decoder(),
      handler: common::pong_handler(server_events),
    })
    .unwrap();

  let (connected_tx, connected_rx) = unbounded();
  let channel = net
    .connect(
      bound,
      Provider::Tcp,
      common::line_encoder(),
      common::line_decoder(),
      common::ambient_client(connected_tx),
      SocketOptions::default(),
    )
    .unwrap();

  connected_rx
    .recv_timeout(Duration::from_secs(5))
    .expect("client never connected");

  let reply = channel
    .send_circle_msg(Box::new("PING".to_string()), Some(Duration::from_secs(5)))
    .expect("circle send failed");
  assert_eq!(*reply.downcast::<String>().unwrap(), "PONG");

  // The server must have connected before it received anything.
  let first = server_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(first, "connected");
  let second = server_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(second, "recv:PING");

  net.shutdown(Duration::from_secs(1));
}

#[test]
fn test_tagged_send_resolves_matching_tag() {
  // The peer echoes the tag back inside the reply line; the client handler
  // parses it out and correlates.
  use muxio::{Channel, Correlation, Handler, Msg};
  use std::sync::Arc;

  struct TagEchoServer;
  impl Handler for TagEchoServer {
    fn on_connected(&self, _c: &Arc<Channel>) -> muxio::Result<()> {
      Ok(())
    }
    fn on_recv(&self, channel: &Arc<Channel>, msg: Msg) -> muxio::Result<Correlation> {
      let text = msg.downcast::<String>().unwrap();
      channel.send_msg(Box::new(format!("{text}:reply")));
      Ok(Correlation::None)
    }
    fn on_shutdown(&self, _c: &Arc<Channel>) -> muxio::Result<()> {
      Ok(())
    }
    fn on_removed(&self, _c: &Arc<Channel>) {}
  }

  struct TagParseClient {
    connected: crossbeam_channel::Sender<()>,
  }
  impl Handler for TagParseClient {
    fn on_connected(&self, _c: &Arc<Channel>) -> muxio::Result<()> {
      let _ = self.connected.send(());
      Ok(())
    }
    fn on_recv(&self, _c: &Arc<Channel>, msg: Msg) -> muxio::Result<Correlation> {
      let text = msg.downcast::<String>().unwrap();
      let tag: u32 = text.split(':').next().unwrap().parse().unwrap();
      Ok(Correlation::Tag(tag, text))
    }
    fn on_shutdown(&self, _c: &Arc<Channel>) -> muxio::Result<()> {
      Ok(())
    }
    fn on_removed(&self, _c: &Arc<Channel>) {}
  }

  let net = Net::new(quick_config()).unwrap();
  let bound = net
    .add_listener(ListenerConfig {
      loc: "127.0.0.1:0".parse().unwrap(),
      provider: Provider::Tcp,
      socket_options: SocketOptions::default(),
      encoder: common::line_encoder(),
      decoder: common::line_decoder(),
      handler: Arc::new(|| Arc::new(TagEchoServer)),
    })
    .unwrap();

  let (connected_tx, connected_rx) = unbounded();
  let channel = net
    .connect(
      bound,
      Provider::Tcp,
      common::line_encoder(),
      common::line_decoder(),
      Arc::new(move || Arc::new(TagParseClient { connected: connected_tx.clone() })),
      SocketOptions::default(),
    )
    .unwrap();
  connected_rx.recv_timeout(Duration::from_secs(5)).unwrap();

  for _ in 0..3 {
    let reply = channel
      .send_tagged_msg(|tag| Box::new(format!("{tag}")), Some(Duration::from_secs(5)))
      .expect("tagged send failed");
    let text = reply.downcast::<String>().unwrap();
    assert!(text.ends_with(":reply"));
  }

  net.shutdown(Duration::from_secs(1));
}

#[test]
fn test_circle_send_times_out_against_silent_peer() {
  let (lines_tx, _lines_rx) = unbounded();
  let net = Net::new(quick_config()).unwrap();
  let bound = net
    .add_listener(ListenerConfig {
      loc: "127.0.0.1:0".parse().unwrap(),
      provider: Provider::Tcp,
      socket_options: SocketOptions::default(),
      encoder: common::line_encoder(),
      decoder: common::line_decoder(),
      // Collects and never answers.
      handler: common::collect_handler(lines_tx),
    })
    .unwrap();

  let (connected_tx, connected_rx) = unbounded();
  let channel = net
    .connect(
      bound,
      Provider::Tcp,
      common::line_encoder(),
      common::line_decoder(),
      common::ambient_client(connected_tx),
      SocketOptions::default(),
    )
    .unwrap();
  connected_rx.recv_timeout(Duration::from_secs(5)).unwrap();

  let start = Instant::now();
  let result =
    channel.send_circle_msg(Box::new("anyone there".to_string()), Some(Duration::from_millis(300)));
  let elapsed = start.elapsed();

  assert!(matches!(result, Err(NetError::SendFailed)));
  assert!(elapsed >= Duration::from_millis(250), "timed out too early: {elapsed:?}");
  assert!(elapsed < Duration::from_secs(5), "timed out far too late: {elapsed:?}");

  net.shutdown(Duration::from_secs(1));
}

#[test]
fn test_straddled_stream_decodes_identically() {
  // Feed one multi-message byte stream split at awkward boundaries through
  // a raw client; the decoded sequence must come out intact and in order.
  use std::io::Write;

  let (lines_tx, lines_rx) = unbounded();
  let net = Net::new(quick_config()).unwrap();
  let bound = net
    .add_listener(ListenerConfig {
      loc: "127.0.0.1:0".parse().unwrap(),
      provider: Provider::Tcp,
      socket_options: SocketOptions::default(),
      encoder: common::line_encoder(),
      decoder: common::line_decoder(),
      handler: common::collect_handler(lines_tx),
    })
    .unwrap();

  let expected: Vec<String> = (0..20).map(|i| format!("message-{i:04}")).collect();
  let stream_bytes: Vec<u8> =
    expected.iter().flat_map(|m| format!("{m}\n").into_bytes()).collect();

  let mut raw = std::net::TcpStream::connect(bound).unwrap();
  raw.set_nodelay(true).unwrap();
  // Split at boundaries that never align with message frames.
  for chunk in stream_bytes.chunks(7) {
    raw.write_all(chunk).unwrap();
    raw.flush().unwrap();
    std::thread::sleep(Duration::from_millis(2));
  }

  let mut received = Vec::new();
  for _ in 0..expected.len() {
    received.push(lines_rx.recv_timeout(Duration::from_secs(5)).unwrap());
  }
  assert_eq!(received, expected);

  drop(raw);
  net.shutdown(Duration::from_secs(1));
}

#[test]
fn test_peer_eof_fails_outstanding_send() {
  use std::sync::Arc;

  let net = Net::new(quick_config()).unwrap();
  let (lines_tx, _lines_rx) = unbounded();
  let bound = net
    .add_listener(ListenerConfig {
      loc: "127.0.0.1:0".parse().unwrap(),
      provider: Provider::Tcp,
      socket_options: SocketOptions::default(),
      encoder: common::line_encoder(),
      decoder: common::line_decoder(),
      handler: common::collect_handler(lines_tx),
    })
    .unwrap();

  let (connected_tx, connected_rx) = unbounded();
  let channel = net
    .connect(
      bound,
      Provider::Tcp,
      common::line_encoder(),
      common::line_decoder(),
      common::ambient_client(connected_tx),
      SocketOptions::default(),
    )
    .unwrap();
  connected_rx.recv_timeout(Duration::from_secs(5)).unwrap();

  // Ask for a reply that will never come, from another thread, then tear
  // the client channel down: the parked sender must resolve with failure,
  // well before its 30s timeout.
  let sender = Arc::clone(&channel);
  let waiter = std::thread::spawn(move || {
    sender.send_circle_msg(Box::new("still there?".to_string()), Some(Duration::from_secs(30)))
  });
  std::thread::sleep(Duration::from_millis(100));
  channel.shutdown(Duration::from_millis(100));

  let result = waiter.join().unwrap();
  assert!(matches!(result, Err(NetError::SendFailed)));

  net.shutdown(Duration::from_secs(1));
}
