//! Line-echo client: `cargo run --example echo_client -- 127.0.0.1:9000`
//!
//! Demonstrates the synchronous circle send: each line is answered by the
//! echo server over the ambient slot.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{Sender, bounded};
use muxio::{
  Channel, Correlation, Decoder, Encoder, Handler, Msg, Net, NetConfig, NetError, Provider,
  SocketOptions,
};

struct LineEncoder;

impl Encoder for LineEncoder {
  fn encode(&mut self, buf: &mut Vec<u8>, msg: &Msg) -> muxio::Result<()> {
    let line =
      msg.downcast_ref::<String>().ok_or_else(|| NetError::Codec("expected String".into()))?;
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    Ok(())
  }
}

struct LineDecoder;

impl Decoder for LineDecoder {
  fn decode(&mut self, buf: &mut BytesMut, out: &mut Vec<Msg>) -> muxio::Result<()> {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
      let line = buf.split_to(pos + 1);
      let text = String::from_utf8_lossy(&line[..pos]).into_owned();
      out.push(Box::new(text));
    }
    Ok(())
  }
}

struct ClientHandler {
  connected: Sender<()>,
}

impl Handler for ClientHandler {
  fn on_connected(&self, _channel: &Arc<Channel>) -> muxio::Result<()> {
    let _ = self.connected.send(());
    Ok(())
  }

  fn on_recv(&self, _channel: &Arc<Channel>, msg: Msg) -> muxio::Result<Correlation> {
    Ok(Correlation::Ambient(msg))
  }

  fn on_shutdown(&self, _channel: &Arc<Channel>) -> muxio::Result<()> {
    Ok(())
  }

  fn on_removed(&self, _channel: &Arc<Channel>) {
    println!("connection closed");
  }
}

fn main() {
  tracing_subscriber::fmt::init();
  let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:9000".into());

  let net = Net::new(NetConfig::default()).expect("engine start failed");
  let (connected_tx, connected_rx) = bounded(1);
  let channel = net
    .connect(
      addr.parse().expect("bad address"),
      Provider::Tcp,
      Arc::new(|| Box::new(LineEncoder)),
      Arc::new(|| Box::new(LineDecoder)),
      Arc::new(move || Arc::new(ClientHandler { connected: connected_tx.clone() })),
      SocketOptions::default(),
    )
    .expect("connect failed");
  connected_rx.recv_timeout(Duration::from_secs(5)).expect("connect timed out");

  for i in 0..5 {
    let request = format!("hello {i}");
    match channel.send_circle_msg(Box::new(request.clone()), Some(Duration::from_secs(5))) {
      Ok(reply) => {
        println!("{request} -> {}", reply.downcast::<String>().unwrap())
      }
      Err(err) => {
        eprintln!("{request} failed: {err}");
        break;
      }
    }
  }

  channel.shutdown_default();
  net.shutdown(Duration::from_secs(2));
}
