//! Interfaces supplied by collaborators: codecs, the application handler and
//! the transport provider. The engine owns none of the wire format - it only
//! moves bytes and correlates replies.

use std::any::Any;
use std::sync::Arc;

use bytes::BytesMut;

use crate::channel::Channel;
use crate::error::Result;

/// An application message. The engine never looks inside one; codecs and
/// handlers downcast to their own types.
pub type Msg = Box<dyn Any + Send>;

/// Serializes one application message, appending its bytes to `buf`.
///
/// Runs on the writer thread. A returned error is fatal to the connection.
pub trait Encoder: Send {
  fn encode(&mut self, buf: &mut Vec<u8>, msg: &Msg) -> Result<()>;
}

/// Consumes as much of `buf` as forms complete messages, pushing each decoded
/// message to `out` and advancing the buffer past the consumed bytes. Bytes
/// left in `buf` are retained by the engine and presented again, extended,
/// on the next readable event.
///
/// Runs on the poller thread. A returned error is fatal to the connection.
pub trait Decoder: Send {
  fn decode(&mut self, buf: &mut BytesMut, out: &mut Vec<Msg>) -> Result<()>;
}

/// What a received message correlates to.
///
/// `None` and `Ambient` are deliberately distinct: `None` means the message
/// answers nothing (it is consumed by the handler alone), while `Ambient`
/// resolves the channel's single ordered-request slot used by circle sends.
/// A numbered `Tag` resolves the matching registered tagged send, if any;
/// an unmatched tag is dropped.
pub enum Correlation {
  None,
  Ambient(Msg),
  Tag(u32, Msg),
}

/// Application callbacks for the lifetime of a channel.
///
/// All hooks run on the channel's poller thread and must return promptly;
/// long-running work belongs on the application's own threads. Errors from
/// the fallible hooks are fatal to that connection only.
pub trait Handler: Send + Sync {
  /// The connection completed its handshake and is usable. Fires before any
  /// `on_recv` for the channel.
  fn on_connected(&self, channel: &Arc<Channel>) -> Result<()>;

  /// One decoded message arrived.
  fn on_recv(&self, channel: &Arc<Channel>, msg: Msg) -> Result<Correlation>;

  /// `Channel::shutdown` was invoked, before the half-close is submitted.
  fn on_shutdown(&self, channel: &Arc<Channel>) -> Result<()>;

  /// The channel has been removed from its tables and its socket is on the
  /// close path. Last callback for the channel; must not fail.
  fn on_removed(&self, channel: &Arc<Channel>);
}

/// Factory closures handed to a listener so every accepted connection gets
/// fresh codec and handler state.
pub type EncoderSupplier = Arc<dyn Fn() -> Box<dyn Encoder> + Send + Sync>;
pub type DecoderSupplier = Arc<dyn Fn() -> Box<dyn Decoder> + Send + Sync>;
pub type HandlerSupplier = Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>;

#[cfg(test)]
mod tests {
  use super::*;

  struct NoopDecoder;

  impl Decoder for NoopDecoder {
    fn decode(&mut self, buf: &mut BytesMut, out: &mut Vec<Msg>) -> Result<()> {
      // Take everything as one message.
      if !buf.is_empty() {
        let all = buf.split_to(buf.len());
        out.push(Box::new(all.to_vec()));
      }
      Ok(())
    }
  }

  #[test]
  fn test_decoder_contract_advances_buffer() {
    let mut decoder = NoopDecoder;
    let mut buf = BytesMut::from(&b"hello"[..]);
    let mut out = Vec::new();
    decoder.decode(&mut buf, &mut out).unwrap();
    assert!(buf.is_empty());
    assert_eq!(out.len(), 1);
    let bytes = out.pop().unwrap().downcast::<Vec<u8>>().unwrap();
    assert_eq!(*bytes, b"hello".to_vec());
  }
}
