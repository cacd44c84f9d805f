//! Line-echo server: `cargo run --example echo_server -- 127.0.0.1:9000`

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use muxio::{
  Channel, Correlation, Decoder, Encoder, Handler, ListenerConfig, Msg, Net, NetConfig, NetError,
  Provider, SocketOptions,
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

struct EchoHandler;

impl Handler for EchoHandler {
  fn on_connected(&self, channel: &Arc<Channel>) -> muxio::Result<()> {
    println!("+ {}", channel.loc());
    Ok(())
  }

  fn on_recv(&self, channel: &Arc<Channel>, msg: Msg) -> muxio::Result<Correlation> {
    let line = msg.downcast::<String>().map_err(|_| NetError::Codec("not a String".into()))?;
    channel.send_msg(line);
    Ok(Correlation::None)
  }

  fn on_shutdown(&self, _channel: &Arc<Channel>) -> muxio::Result<()> {
    Ok(())
  }

  fn on_removed(&self, channel: &Arc<Channel>) {
    println!("- {}", channel.loc());
  }
}

fn main() {
  tracing_subscriber::fmt::init();
  let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:9000".into());

  let net = Net::new(NetConfig::default()).expect("engine start failed");
  let bound = net
    .add_listener(ListenerConfig {
      loc: addr.parse().expect("bad address"),
      provider: Provider::Tcp,
      socket_options: SocketOptions::default(),
      encoder: Arc::new(|| Box::new(LineEncoder)),
      decoder: Arc::new(|| Box::new(LineDecoder)),
      handler: Arc::new(|| Arc::new(EchoHandler)),
    })
    .expect("listen failed");
  println!("echo server on {bound}, ctrl-c to stop");

  loop {
    std::thread::sleep(Duration::from_secs(60));
  }
}
