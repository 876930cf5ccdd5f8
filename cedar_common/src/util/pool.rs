use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::{
  collections::BinaryHeap,
  panic::{self, AssertUnwindSafe},
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
  },
  thread,
  time::{Duration, Instant},
};

/// The status of a task spawned on a [`ThreadPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
  /// The task is waiting for a worker (or, for delayed tasks, waiting for its
  /// deadline).
  Queued,
  /// A worker is currently executing the task. A running task cannot be
  /// cancelled.
  Running,
  Success,
  /// The task panicked. The worker that ran it survives.
  Error,
  /// The task was cancelled before a worker picked it up.
  Cancelled,
}

impl TaskStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Success | TaskStatus::Error | TaskStatus::Cancelled)
  }
}

struct HandleState {
  status:     TaskStatus,
  queued_at:  Instant,
  started_at: Option<Instant>,
  // Frozen copies of the two timers, set when the task leaves the
  // corresponding state.
  queued:     Duration,
  running:    Duration,
}

struct HandleInner {
  state: Mutex<HandleState>,
  done:  Condvar,
}

/// A handle to a task spawned on a [`ThreadPool`]. Handles observe the task;
/// they do not own it, so dropping a handle does not cancel anything.
#[derive(Clone)]
pub struct TaskHandle {
  inner: Arc<HandleInner>,
}

impl TaskHandle {
  fn new() -> Self {
    TaskHandle {
      inner: Arc::new(HandleInner {
        state: Mutex::new(HandleState {
          status:     TaskStatus::Queued,
          queued_at:  Instant::now(),
          started_at: None,
          queued:     Duration::ZERO,
          running:    Duration::ZERO,
        }),
        done:  Condvar::new(),
      }),
    }
  }
  fn cancelled() -> Self {
    let handle = TaskHandle::new();
    handle.inner.state.lock().status = TaskStatus::Cancelled;
    handle
  }

  pub fn status(&self) -> TaskStatus { self.inner.state.lock().status }

  /// Returns how long the task has been (or was) queued for. For a task that
  /// has started this is frozen at the moment a worker picked it up.
  pub fn queued_time(&self) -> Duration {
    let s = self.inner.state.lock();
    match s.status {
      TaskStatus::Queued => s.queued_at.elapsed(),
      _ => s.queued,
    }
  }
  /// Returns how long the task has been (or was) running for.
  pub fn run_time(&self) -> Duration {
    let s = self.inner.state.lock();
    match s.status {
      TaskStatus::Running => s.started_at.map(|at| at.elapsed()).unwrap_or(Duration::ZERO),
      _ => s.running,
    }
  }

  /// Blocks until the task reaches a terminal state, and returns that state.
  pub fn wait(&self) -> TaskStatus {
    let mut s = self.inner.state.lock();
    while !s.status.is_terminal() {
      self.inner.done.wait(&mut s);
    }
    s.status
  }

  /// Cancels the task if it has not started yet. Returns `true` if the task
  /// was cancelled. A `Running` task always completes.
  pub fn cancel(&self) -> bool {
    let mut s = self.inner.state.lock();
    if s.status == TaskStatus::Queued {
      s.status = TaskStatus::Cancelled;
      s.queued = s.queued_at.elapsed();
      self.inner.done.notify_all();
      true
    } else {
      false
    }
  }
}

struct Job {
  task:   Box<dyn FnOnce() + Send>,
  handle: TaskHandle,
}

enum Message {
  Run(Job),
  Exit,
}

#[derive(Default)]
struct WorkerCounters {
  executed:      AtomicU64,
  failed:        AtomicU64,
  run_time_nano: AtomicU64,
}

/// A snapshot of one worker's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
  pub executed: u64,
  pub failed:   u64,
  pub run_time: Duration,
}

struct DelayedTask {
  deadline: Instant,
  seq:      u64,
  job:      Job,
}

impl PartialEq for DelayedTask {
  fn eq(&self, other: &Self) -> bool { self.deadline == other.deadline && self.seq == other.seq }
}
impl Eq for DelayedTask {}
impl PartialOrd for DelayedTask {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl Ord for DelayedTask {
  // BinaryHeap is a max-heap, so reverse the comparison to pop the earliest
  // deadline first.
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
  }
}

struct TimerState {
  heap:     BinaryHeap<DelayedTask>,
  next_seq: u64,
  shutdown: bool,
}

struct Timer {
  state: Mutex<TimerState>,
  cond:  Condvar,
}

/// A pool of worker threads with support for delayed tasks.
///
/// Ready tasks run in FIFO order. Delayed tasks sit on a min-heap until their
/// deadline, at which point a dedicated timer thread promotes them onto the
/// ready queue. The ready queue is unbounded; the pool never grows threads.
pub struct ThreadPool {
  tx:       Sender<Message>,
  timer:    Arc<Timer>,
  // Shared with the workers: once set, anything still queued is cancelled
  // instead of run.
  shutdown: Arc<AtomicBool>,
  counters: Vec<Arc<WorkerCounters>>,
  threads:  Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
  /// Creates a thread pool with the same number of workers as cores on the
  /// system.
  pub fn auto(name: &str) -> Self { ThreadPool::new(name, crate::util::num_cpus() as u32) }

  /// Creates a thread pool with the given number of worker threads.
  ///
  /// # Panics
  ///
  /// Panics if the number of workers is 0.
  pub fn new(name: &str, workers: u32) -> Self {
    if workers == 0 {
      panic!("cannot create a thread pool with no workers");
    }
    let (tx, rx): (Sender<Message>, Receiver<Message>) = crossbeam_channel::unbounded();
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut counters = Vec::with_capacity(workers as usize);
    let mut threads = Vec::with_capacity(workers as usize + 1);
    for i in 0..workers {
      let rx = rx.clone();
      let shutdown = shutdown.clone();
      let c = Arc::new(WorkerCounters::default());
      counters.push(c.clone());
      threads.push(
        thread::Builder::new()
          .name(format!("{name}-{i}"))
          .spawn(move || {
            while let Ok(msg) = rx.recv() {
              match msg {
                Message::Run(job) if shutdown.load(Ordering::SeqCst) => cancel_job(&job),
                Message::Run(job) => Self::run_job(job, &c),
                Message::Exit => break,
              }
            }
          })
          .expect("failed to spawn worker thread"),
      );
    }
    let timer = Arc::new(Timer {
      state: Mutex::new(TimerState { heap: BinaryHeap::new(), next_seq: 0, shutdown: false }),
      cond:  Condvar::new(),
    });
    {
      let timer = timer.clone();
      let tx = tx.clone();
      threads.push(
        thread::Builder::new()
          .name(format!("{name}-timer"))
          .spawn(move || Self::timer_loop(&timer, &tx))
          .expect("failed to spawn timer thread"),
      );
    }
    ThreadPool { tx, timer, shutdown, counters, threads: Mutex::new(threads) }
  }

  fn run_job(job: Job, counters: &WorkerCounters) {
    {
      let mut s = job.handle.inner.state.lock();
      if s.status != TaskStatus::Queued {
        // Cancelled while waiting in the queue.
        return;
      }
      s.status = TaskStatus::Running;
      s.queued = s.queued_at.elapsed();
      s.started_at = Some(Instant::now());
    }
    let start = Instant::now();
    let res = panic::catch_unwind(AssertUnwindSafe(job.task));
    let elapsed = start.elapsed();
    counters.executed.fetch_add(1, Ordering::Relaxed);
    counters.run_time_nano.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    let mut s = job.handle.inner.state.lock();
    s.running = elapsed;
    s.status = match res {
      Ok(()) => TaskStatus::Success,
      Err(e) => {
        counters.failed.fetch_add(1, Ordering::Relaxed);
        let msg = e
          .downcast_ref::<&str>()
          .map(|s| s.to_string())
          .or_else(|| e.downcast_ref::<String>().cloned())
          .unwrap_or_else(|| "unknown panic".into());
        warn!("task panicked: {msg}");
        TaskStatus::Error
      }
    };
    job.handle.inner.done.notify_all();
  }

  fn timer_loop(timer: &Timer, tx: &Sender<Message>) {
    let mut s = timer.state.lock();
    loop {
      if s.shutdown {
        // Anything still on the heap will never run.
        for task in s.heap.drain() {
          cancel_job(&task.job);
        }
        return;
      }
      let now = Instant::now();
      match s.heap.peek() {
        None => {
          timer.cond.wait(&mut s);
        }
        Some(task) if task.deadline <= now => {
          let task = s.heap.pop().expect("peeked task disappeared");
          // The workers hold the other end of this channel for the lifetime
          // of the pool, so sends only fail during teardown.
          let _ = tx.send(Message::Run(task.job));
        }
        Some(task) => {
          let dur = task.deadline - now;
          timer.cond.wait_for(&mut s, dur);
        }
      }
    }
  }

  /// Enqueues the given task immediately.
  pub fn spawn(&self, f: impl FnOnce() + Send + 'static) -> TaskHandle {
    if self.shutdown.load(Ordering::SeqCst) {
      return TaskHandle::cancelled();
    }
    let handle = TaskHandle::new();
    let job = Job { task: Box::new(f), handle: handle.clone() };
    let _ = self.tx.send(Message::Run(job));
    handle
  }

  /// Enqueues the given task after a delay. The task can be cancelled through
  /// its handle at any point before a worker picks it up.
  pub fn spawn_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TaskHandle {
    if self.shutdown.load(Ordering::SeqCst) {
      return TaskHandle::cancelled();
    }
    let handle = TaskHandle::new();
    let job = Job { task: Box::new(f), handle: handle.clone() };
    let mut s = self.timer.state.lock();
    let seq = s.next_seq;
    s.next_seq += 1;
    s.heap.push(DelayedTask { deadline: Instant::now() + delay, seq, job });
    self.timer.cond.notify_one();
    handle
  }

  /// Returns a snapshot of each worker's counters.
  pub fn worker_stats(&self) -> Vec<WorkerStats> {
    self
      .counters
      .iter()
      .map(|c| WorkerStats {
        executed: c.executed.load(Ordering::Relaxed),
        failed:   c.failed.load(Ordering::Relaxed),
        run_time: Duration::from_nanos(c.run_time_nano.load(Ordering::Relaxed)),
      })
      .collect()
  }

  pub fn workers(&self) -> usize { self.counters.len() }

  /// Shuts the pool down. Queued tasks are cancelled, in-flight tasks run to
  /// completion, and all threads are joined. Tasks spawned after this returns
  /// come back already `Cancelled`.
  pub fn shutdown(&self) {
    if self.shutdown.swap(true, Ordering::SeqCst) {
      return;
    }
    {
      let mut s = self.timer.state.lock();
      s.shutdown = true;
      // Cancel everything still waiting on a deadline. The timer thread also
      // cancels anything racing in, on its way out.
      for task in s.heap.drain() {
        cancel_job(&task.job);
      }
      self.timer.cond.notify_one();
    }
    // One exit message per worker. These land behind anything already queued;
    // the workers see the shutdown flag and cancel those instead of running
    // them, then exit.
    for _ in 0..self.counters.len() {
      let _ = self.tx.send(Message::Exit);
    }
    let threads = {
      let mut lock = self.threads.lock();
      std::mem::take(&mut *lock)
    };
    for t in threads {
      let _ = t.join();
    }
  }
}

fn cancel_job(job: &Job) { job.handle.cancel(); }

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn fifo_order() {
    let pool = ThreadPool::new("test", 1);
    let order = Arc::new(Mutex::new(vec![]));
    let mut handles = vec![];
    for i in 0..10 {
      let order = order.clone();
      handles.push(pool.spawn(move || order.lock().push(i)));
    }
    for h in &handles {
      assert_eq!(h.wait(), TaskStatus::Success);
    }
    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
  }

  #[test]
  fn delayed_tasks_run_in_deadline_order() {
    let pool = ThreadPool::new("test", 1);
    let order = Arc::new(Mutex::new(vec![]));
    let o = order.clone();
    let late = pool.spawn_after(Duration::from_millis(80), move || o.lock().push("late"));
    let o = order.clone();
    let early = pool.spawn_after(Duration::from_millis(20), move || o.lock().push("early"));
    assert_eq!(late.wait(), TaskStatus::Success);
    assert_eq!(early.wait(), TaskStatus::Success);
    assert_eq!(*order.lock(), vec!["early", "late"]);
  }

  #[test]
  fn cancel_before_run() {
    let pool = ThreadPool::new("test", 1);
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let handle = pool.spawn_after(Duration::from_secs(30), move || r.store(true, Ordering::SeqCst));
    assert!(handle.cancel());
    assert_eq!(handle.wait(), TaskStatus::Cancelled);
    assert!(!ran.load(Ordering::SeqCst));
    // Cancelling twice does nothing.
    assert!(!handle.cancel());
  }

  #[test]
  fn panic_is_recorded_and_worker_survives() {
    let pool = ThreadPool::new("test", 1);
    let bad = pool.spawn(|| panic!("boom"));
    assert_eq!(bad.wait(), TaskStatus::Error);
    // The single worker must still be alive to run this.
    let good = pool.spawn(|| {});
    assert_eq!(good.wait(), TaskStatus::Success);
    let stats = pool.worker_stats();
    assert_eq!(stats[0].executed, 2);
    assert_eq!(stats[0].failed, 1);
  }

  #[test]
  fn wait_and_timers() {
    let pool = ThreadPool::new("test", 2);
    let handle = pool.spawn(|| thread::sleep(Duration::from_millis(20)));
    assert_eq!(handle.wait(), TaskStatus::Success);
    assert!(handle.run_time() >= Duration::from_millis(20));
  }

  #[test]
  fn shutdown_cancels_queued() {
    let pool = ThreadPool::new("test", 1);
    let count = Arc::new(AtomicUsize::new(0));
    // The first task blocks the single worker while we queue more.
    let c = count.clone();
    let blocker = pool.spawn(move || {
      thread::sleep(Duration::from_millis(50));
      c.fetch_add(1, Ordering::SeqCst);
    });
    let c = count.clone();
    let queued = pool.spawn(move || {
      c.fetch_add(1, Ordering::SeqCst);
    });
    let delayed = pool.spawn_after(Duration::from_secs(60), || {});
    pool.shutdown();
    // In-flight work completed; the queued and delayed tasks did not.
    assert_eq!(blocker.status(), TaskStatus::Success);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(queued.status(), TaskStatus::Cancelled);
    assert_eq!(delayed.status(), TaskStatus::Cancelled);
    // New work is refused.
    assert_eq!(pool.spawn(|| {}).status(), TaskStatus::Cancelled);
  }
}
