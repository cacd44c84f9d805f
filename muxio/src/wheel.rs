//! Deadline scheduler: a dedicated thread that fires closures at their due
//! time. Used for synchronous-send timeouts, connect timeouts and shutdown
//! grace periods.
//!
//! Precision here is deliberately coarse; every consumer treats the deadline
//! as "no earlier than".

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

type Job = Box<dyn FnOnce() + Send>;

struct Entry {
  deadline: Instant,
  seq: u64,
  job: Job,
}

impl PartialEq for Entry {
  fn eq(&self, other: &Self) -> bool {
    self.deadline == other.deadline && self.seq == other.seq
  }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Entry {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
  }
}

enum Cmd {
  Schedule(Entry),
  Stop,
}

/// Cloneable handle to the wheel thread. Scheduling onto a stopped wheel is
/// a silent no-op, which is the right behavior during engine teardown.
#[derive(Clone)]
pub(crate) struct Wheel {
  tx: Sender<Cmd>,
}

impl Wheel {
  pub fn spawn() -> (Wheel, JoinHandle<()>) {
    let (tx, rx) = unbounded::<Cmd>();
    let handle = thread::Builder::new()
      .name("muxio-wheel".into())
      .spawn(move || run(rx))
      .expect("failed to spawn wheel thread");
    (Wheel { tx }, handle)
  }

  /// Run `job` once `delay` has elapsed.
  pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
    let entry = Entry {
      deadline: Instant::now() + delay,
      seq: 0,
      job: Box::new(job),
    };
    let _ = self.tx.send(Cmd::Schedule(entry));
  }

  pub fn stop(&self) {
    let _ = self.tx.send(Cmd::Stop);
  }
}

fn run(rx: Receiver<Cmd>) {
  let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
  let mut seq: u64 = 0;
  loop {
    // Fire everything due before going back to sleep.
    let now = Instant::now();
    while heap.peek().is_some_and(|Reverse(entry)| entry.deadline <= now) {
      let Reverse(entry) = heap.pop().unwrap();
      (entry.job)();
    }

    let cmd = match heap.peek() {
      Some(Reverse(next)) => {
        let timeout = next.deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
          Ok(cmd) => cmd,
          Err(RecvTimeoutError::Timeout) => continue,
          Err(RecvTimeoutError::Disconnected) => return,
        }
      }
      None => match rx.recv() {
        Ok(cmd) => cmd,
        Err(_) => return,
      },
    };

    match cmd {
      Cmd::Schedule(mut entry) => {
        seq += 1;
        entry.seq = seq;
        heap.push(Reverse(entry));
      }
      Cmd::Stop => return,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn test_job_fires_after_delay() {
    let (wheel, handle) = Wheel::spawn();
    let fired = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&fired);

    let start = Instant::now();
    let (done_tx, done_rx) = unbounded();
    wheel.schedule(Duration::from_millis(40), move || {
      flag.store(1, Ordering::SeqCst);
      let _ = done_tx.send(());
    });

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    wheel.stop();
    handle.join().unwrap();
  }

  #[test]
  fn test_jobs_fire_in_deadline_order() {
    let (wheel, handle) = Wheel::spawn();
    let (tx, rx) = unbounded();

    for (delay, id) in [(90u64, 3u32), (30, 1), (60, 2)] {
      let tx = tx.clone();
      wheel.schedule(Duration::from_millis(delay), move || {
        let _ = tx.send(id);
      });
    }

    let mut got = Vec::new();
    for _ in 0..3 {
      got.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
    assert_eq!(got, vec![1, 2, 3]);

    wheel.stop();
    handle.join().unwrap();
  }

  #[test]
  fn test_schedule_after_stop_is_noop() {
    let (wheel, handle) = Wheel::spawn();
    wheel.stop();
    handle.join().unwrap();
    wheel.schedule(Duration::from_millis(1), || panic!("must never fire"));
    thread::sleep(Duration::from_millis(20));
  }
}
