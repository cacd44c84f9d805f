//! Carrier: the single-assignment slot that lets a blocked caller await one
//! specific reply out of an asynchronous byte stream.
//!
//! A carrier is created by the thread that will wait on it and resolved by
//! the poller thread (with a decoded reply) or by a timeout/teardown path
//! (with the failure sentinel). Resolution happens exactly once: the first
//! state transition wins, later attempts are no-ops. This holds even when a
//! timeout task and a real reply race.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, Thread};

use crate::api::Msg;

const HOLDING: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;
const FAILED: u8 = 3;

pub struct Carrier {
  /// The parked caller; captured at construction.
  thread: Thread,
  state: AtomicU8,
  slot: UnsafeCell<Option<Msg>>,
}

// SAFETY: `slot` is written only by the single thread that wins the
// HOLDING -> RESOLVING transition, and read only by the waiter after it
// observes RESOLVED with acquire ordering.
unsafe impl Send for Carrier {}
unsafe impl Sync for Carrier {}

impl Carrier {
  /// Create a carrier owned by the calling thread. Only that thread may
  /// call [`Carrier::wait`].
  pub fn new() -> Arc<Carrier> {
    Arc::new(Carrier {
      thread: thread::current(),
      state: AtomicU8::new(HOLDING),
      slot: UnsafeCell::new(None),
    })
  }

  /// Resolve with a decoded reply. Returns false if the carrier was already
  /// resolved.
  pub fn resolve(&self, msg: Msg) -> bool {
    if self
      .state
      .compare_exchange(HOLDING, RESOLVING, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      return false;
    }
    unsafe { *self.slot.get() = Some(msg) };
    self.state.store(RESOLVED, Ordering::Release);
    self.thread.unpark();
    true
  }

  /// Resolve with the failure sentinel. Returns false if the carrier was
  /// already resolved.
  pub fn fail(&self) -> bool {
    if self
      .state
      .compare_exchange(HOLDING, FAILED, Ordering::AcqRel, Ordering::Relaxed)
      .is_err()
    {
      return false;
    }
    self.thread.unpark();
    true
  }

  /// Park the owning thread until the carrier resolves. Spurious unparks
  /// are absorbed by the state check.
  pub fn wait(&self) -> Option<Msg> {
    loop {
      match self.state.load(Ordering::Acquire) {
        RESOLVED => return unsafe { (*self.slot.get()).take() },
        FAILED => return None,
        _ => thread::park(),
      }
    }
  }
}

/// A correlation registration: the tag a reply must carry, paired with the
/// carrier its arrival resolves. The reserved tag [`crate::channel::AMBIENT`]
/// addresses the channel's single ordered-request slot.
#[derive(Clone)]
pub struct TaggedMsg {
  pub tag: u32,
  pub carrier: Arc<Carrier>,
}

impl TaggedMsg {
  pub fn new(tag: u32) -> TaggedMsg {
    TaggedMsg { tag, carrier: Carrier::new() }
  }

  /// Identity comparison: unregister must only remove the registration it
  /// was issued for, never a newer one that reused the tag.
  pub fn same_carrier(&self, other: &TaggedMsg) -> bool {
    Arc::ptr_eq(&self.carrier, &other.carrier)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_resolve_wakes_waiter() {
    let carrier = Carrier::new();
    let resolver = Arc::clone(&carrier);

    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(30));
      assert!(resolver.resolve(Box::new(7u32)));
    });

    let msg = carrier.wait().expect("expected a reply");
    assert_eq!(*msg.downcast::<u32>().unwrap(), 7);
    handle.join().unwrap();
  }

  #[test]
  fn test_fail_wakes_waiter_with_sentinel() {
    let carrier = Carrier::new();
    let failer = Arc::clone(&carrier);

    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(30));
      assert!(failer.fail());
    });

    assert!(carrier.wait().is_none());
    handle.join().unwrap();
  }

  #[test]
  fn test_resolution_happens_exactly_once() {
    let carrier = Carrier::new();
    assert!(carrier.resolve(Box::new(1u32)));
    assert!(!carrier.resolve(Box::new(2u32)));
    assert!(!carrier.fail());
    let msg = carrier.wait().unwrap();
    assert_eq!(*msg.downcast::<u32>().unwrap(), 1);
  }

  #[test]
  fn test_racing_reply_and_timeout_resolve_once() {
    for _ in 0..64 {
      let carrier = Carrier::new();
      let a = Arc::clone(&carrier);
      let b = Arc::clone(&carrier);

      let t1 = std::thread::spawn(move || a.resolve(Box::new(1u32)));
      let t2 = std::thread::spawn(move || b.fail());

      let won_resolve = t1.join().unwrap();
      let won_fail = t2.join().unwrap();
      assert!(won_resolve ^ won_fail, "exactly one resolution must win");

      match carrier.wait() {
        Some(msg) => {
          assert!(won_resolve);
          assert_eq!(*msg.downcast::<u32>().unwrap(), 1);
        }
        None => assert!(won_fail),
      }
    }
  }

  #[test]
  fn test_unregister_identity_check() {
    let first = TaggedMsg::new(5);
    let second = TaggedMsg::new(5);
    assert!(first.same_carrier(&first.clone()));
    assert!(!first.same_carrier(&second));
  }
}
