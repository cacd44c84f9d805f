//! Shared fixtures: a newline-delimited string codec and handlers that
//! report their callbacks over channels so tests can assert ordering.
#![allow(dead_code)]

use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_channel::Sender;
use muxio::{
  Channel, Correlation, Decoder, DecoderSupplier, Encoder, EncoderSupplier, Handler,
  HandlerSupplier, Msg, NetError,
};

pub struct LineEncoder;

impl Encoder for LineEncoder {
  fn encode(&mut self, buf: &mut Vec<u8>, msg: &Msg) -> muxio::Result<()> {
    let line = msg
      .downcast_ref::<String>()
      .ok_or_else(|| NetError::Codec("expected String message".into()))?;
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    Ok(())
  }
}

pub struct LineDecoder;

impl Decoder for LineDecoder {
  fn decode(&mut self, buf: &mut BytesMut, out: &mut Vec<Msg>) -> muxio::Result<()> {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
      let line = buf.split_to(pos + 1);
      let text = std::str::from_utf8(&line[..pos])
        .map_err(|e| NetError::Codec(e.to_string()))?
        .to_string();
      out.push(Box::new(text));
    }
    Ok(())
  }
}

/// Server side: logs lifecycle events and answers every received line with
/// "PONG". Replies are uncorrelated pushes from this side's point of view.
pub struct PongHandler {
  pub events: Sender<String>,
}

impl Handler for PongHandler {
  fn on_connected(&self, _channel: &Arc<Channel>) -> muxio::Result<()> {
    let _ = self.events.send("connected".into());
    Ok(())
  }

  fn on_recv(&self, channel: &Arc<Channel>, msg: Msg) -> muxio::Result<Correlation> {
    let text = msg.downcast::<String>().map_err(|_| NetError::Codec("not a String".into()))?;
    let _ = self.events.send(format!("recv:{text}"));
    channel.send_msg(Box::new("PONG".to_string()));
    Ok(Correlation::None)
  }

  fn on_shutdown(&self, _channel: &Arc<Channel>) -> muxio::Result<()> {
    let _ = self.events.send("shutdown".into());
    Ok(())
  }

  fn on_removed(&self, _channel: &Arc<Channel>) {
    let _ = self.events.send("removed".into());
  }
}

/// Client side: every inbound message resolves the ambient slot, and
/// `on_connected` is reported so tests know when sends may start.
pub struct AmbientClientHandler {
  pub connected: Sender<()>,
}

impl Handler for AmbientClientHandler {
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

  fn on_removed(&self, _channel: &Arc<Channel>) {}
}

/// Collects every received line without replying.
pub struct CollectHandler {
  pub lines: Sender<String>,
}

impl Handler for CollectHandler {
  fn on_connected(&self, _channel: &Arc<Channel>) -> muxio::Result<()> {
    Ok(())
  }

  fn on_recv(&self, _channel: &Arc<Channel>, msg: Msg) -> muxio::Result<Correlation> {
    let text = msg.downcast::<String>().map_err(|_| NetError::Codec("not a String".into()))?;
    let _ = self.lines.send(*text);
    Ok(Correlation::None)
  }

  fn on_shutdown(&self, _channel: &Arc<Channel>) -> muxio::Result<()> {
    Ok(())
  }

  fn on_removed(&self, _channel: &Arc<Channel>) {}
}

pub fn line_encoder() -> EncoderSupplier {
  Arc::new(|| Box::new(LineEncoder))
}

pub fn line_decoder() -> DecoderSupplier {
  Arc::new(|| Box::new(LineDecoder))
}

pub fn pong_handler(events: Sender<String>) -> HandlerSupplier {
  Arc::new(move || Arc::new(PongHandler { events: events.clone() }))
}

pub fn ambient_client(connected: Sender<()>) -> HandlerSupplier {
  Arc::new(move || Arc::new(AmbientClientHandler { connected: connected.clone() }))
}

pub fn collect_handler(lines: Sender<String>) -> HandlerSupplier {
  Arc::new(move || Arc::new(CollectHandler { lines: lines.clone() }))
}
