//! # Muxio - Multiplexed Network I/O Reactor
//!
//! Muxio unifies the native readiness multiplexers (epoll, kqueue and the
//! Windows AFD poll) behind one reactor model, for plain TCP and TLS
//! connections alike.
//!
//! ## Architecture
//!
//! | Thread    | Role                                                      |
//! |-----------|-----------------------------------------------------------|
//! | Master    | accept loop, one per listening address                    |
//! | Poller    | per-shard read side: handshakes, reads, decode, dispatch  |
//! | Writer    | per-shard write side: encode, send, backpressure backlog  |
//! | Wheel     | deadline thread for timeouts and grace periods            |
//!
//! A connection is a [`Channel`]. Until its handshake completes it is
//! driven by a [`Sentry`] state machine on the poller thread; afterwards a
//! [`Protocol`] handles steady-state I/O, reads on the poller and writes on
//! the paired writer. Cross-thread interaction is task queues only - no
//! table is ever touched from two threads.
//!
//! ## Sends
//!
//! Fire-and-forget sends enqueue and return. The synchronous shapes
//! ([`Channel::send_tagged_msg`], [`Channel::send_circle_msg`] and their
//! batched variants) park the calling thread until the correlated reply
//! arrives or the timeout fires - each registers a one-shot carrier with
//! the poller *before* the write is issued, so a fast reply can never race
//! past its registration.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use muxio::{ListenerConfig, Net, NetConfig, Provider, SocketOptions};
//! # fn suppliers() -> (muxio::EncoderSupplier, muxio::DecoderSupplier, muxio::HandlerSupplier) { unimplemented!() }
//!
//! let net = Net::new(NetConfig::default()).unwrap();
//! let (encoder, decoder, handler) = suppliers();
//! let bound = net
//!   .add_listener(ListenerConfig {
//!     loc: "127.0.0.1:0".parse().unwrap(),
//!     provider: Provider::Tcp,
//!     socket_options: SocketOptions::default(),
//!     encoder,
//!     decoder,
//!     handler,
//!   })
//!   .unwrap();
//! println!("listening on {bound}");
//! ```
//!
//! ## Error handling
//!
//! Nothing that goes wrong on one connection escapes its own teardown: OS
//! and codec failures close that channel and surface through
//! `Handler::on_removed`, while failed or timed-out synchronous sends
//! return [`NetError::SendFailed`]. Only multiplexer-level faults terminate
//! a shard thread, and even then every in-flight carrier is failed first.

mod api;
mod carrier;
mod channel;
mod config;
mod error;
mod master;
mod net;
pub mod os;
mod poller;
mod protocol;
mod sentry;
mod tls;
mod wheel;
mod writer;

pub use api::{
  Correlation, Decoder, DecoderSupplier, Encoder, EncoderSupplier, Handler, HandlerSupplier, Msg,
};
pub use carrier::{Carrier, TaggedMsg};
pub use channel::{AMBIENT, Channel};
pub use config::{NetConfig, SocketOptions};
pub use error::{NetError, Result};
pub use master::ListenerConfig;
pub use net::Net;
pub use protocol::Protocol;
pub use sentry::{Provider, Sentry, SentryVerdict};
pub use writer::WriterCallback;
