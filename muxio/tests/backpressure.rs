//! Write-path tests: backlog ordering under backpressure, batched sends and
//! shutdown draining.

mod common;

use std::io::Read;
use std::time::Duration;

use crossbeam_channel::unbounded;
use muxio::{ListenerConfig, Net, NetConfig, Provider, SocketOptions};

fn quick_config() -> NetConfig {
  NetConfig {
    mux_timeout: Duration::from_millis(10),
    ..NetConfig::default()
  }
}

#[test]
fn test_backlog_drains_in_submission_order() {
  // A raw peer that refuses to read for a while forces the client's socket
  // buffer full, so later sends land in the writer backlog. Once the peer
  // drains, every byte must arrive in submission order, and the shutdown
  // must not half-close before the backlog empties.
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  let remote = listener.local_addr().unwrap();

  let server = std::thread::spawn(move || {
    let (mut stream, _) = listener.accept().unwrap();
    // Let the sender hit backpressure.
    std::thread::sleep(Duration::from_millis(300));
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    all
  });

  let net = Net::new(quick_config()).unwrap();
  let (connected_tx, connected_rx) = unbounded();
  let channel = net
    .connect(
      remote,
      Provider::Tcp,
      common::line_encoder(),
      common::line_decoder(),
      common::ambient_client(connected_tx),
      SocketOptions::default(),
    )
    .unwrap();
  connected_rx.recv_timeout(Duration::from_secs(5)).unwrap();

  // Far more than loopback socket buffers will absorb.
  let payloads: Vec<String> = [b'A', b'B', b'C']
    .iter()
    .map(|&b| String::from_utf8(vec![b; 1024 * 1024]).unwrap())
    .collect();
  let mut expected = Vec::new();
  for payload in &payloads {
    expected.extend_from_slice(payload.as_bytes());
    expected.push(b'\n');
    channel.send_msg(Box::new(payload.clone()));
  }

  // Shutdown with a generous grace: the half-close may only happen after
  // the backlog has fully drained.
  channel.shutdown(Duration::from_secs(5));

  let received = server.join().unwrap();
  assert_eq!(received.len(), expected.len());
  assert_eq!(received, expected);

  net.shutdown(Duration::from_secs(1));
}

#[test]
fn test_multiple_msg_is_one_ordered_batch() {
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

  channel.send_multiple_msg(vec![
    Box::new("first".to_string()),
    Box::new("second".to_string()),
    Box::new("third".to_string()),
  ]);

  for expected in ["first", "second", "third"] {
    let line = lines_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(line, expected);
  }

  net.shutdown(Duration::from_secs(1));
}

#[test]
fn test_send_callback_success_fires_once() {
  use std::sync::Arc;
  use std::sync::atomic::{AtomicU32, Ordering};

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

  let successes = Arc::new(AtomicU32::new(0));
  let failures = Arc::new(AtomicU32::new(0));
  let (s, f) = (Arc::clone(&successes), Arc::clone(&failures));
  let (done_tx, done_rx) = unbounded();
  channel.send_msg_with_callback(
    Box::new("counted".to_string()),
    Some(muxio::WriterCallback::new(
      move |_| {
        s.fetch_add(1, Ordering::SeqCst);
        let _ = done_tx.send(());
      },
      move |_| {
        f.fetch_add(1, Ordering::SeqCst);
      },
    )),
  );

  done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(lines_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "counted");
  assert_eq!(successes.load(Ordering::SeqCst), 1);
  assert_eq!(failures.load(Ordering::SeqCst), 0);

  net.shutdown(Duration::from_secs(1));
}
