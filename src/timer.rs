//! Injected timing capability (spec §6): wall clock, monotonic clock, and a
//! cancellable one-shot sleep callback. The teacher delegated all of this to
//! io_uring's timeout opcode; this crate has no syscall layer, so the
//! reference implementation below uses a dedicated thread servicing a
//! min-heap of deadlines instead, following the same
//! dedicated-thread-plus-channel shape as [`crate::executor::ThreadPoolExecutor`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait CancelHandle: Send {
    /// Cancels the pending delivery. Safe to call after the thunk already
    /// ran; at-most-once delivery is guaranteed regardless.
    fn cancel(&self);
}

pub trait Timer: Send + Sync {
    fn now_millis(&self) -> i64;
    fn monotonic_nanos(&self) -> i64;
    fn sleep(&self, duration: Duration, thunk: Box<dyn FnOnce() + Send>) -> Box<dyn CancelHandle>;
}

enum Command {
    Schedule(u64, Instant, Box<dyn FnOnce() + Send>),
    Cancel(u64),
}

/// Reference timer backed by one worker thread and a `BinaryHeap` of
/// deadlines, following `src/time.rs`'s doc-comment voice even though its
/// own `sleep` delegated to io_uring rather than a heap.
pub struct WheelTimer {
    sender: mpsc::Sender<Command>,
    next_id: AtomicU64,
    _worker: std::thread::JoinHandle<()>,
}

impl WheelTimer {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("fiberglass-timer".to_string())
            .spawn(move || worker_loop(receiver))
            .expect("failed to spawn fiberglass timer thread");

        WheelTimer {
            sender,
            next_id: AtomicU64::new(0),
            _worker: worker,
        }
    }
}

impl Default for WheelTimer {
    fn default() -> Self {
        WheelTimer::new()
    }
}

impl Timer for WheelTimer {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    fn monotonic_nanos(&self) -> i64 {
        // relative to process start; Instant has no fixed epoch.
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = *START.get_or_init(Instant::now);
        Instant::now().duration_since(start).as_nanos() as i64
    }

    fn sleep(&self, duration: Duration, thunk: Box<dyn FnOnce() + Send>) -> Box<dyn CancelHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + duration;
        let _ = self.sender.send(Command::Schedule(id, deadline, thunk));
        Box::new(WheelCancelHandle {
            id,
            sender: self.sender.clone(),
        })
    }
}

struct WheelCancelHandle {
    id: u64,
    sender: mpsc::Sender<Command>,
}

impl CancelHandle for WheelCancelHandle {
    fn cancel(&self) {
        let _ = self.sender.send(Command::Cancel(self.id));
    }
}

fn worker_loop(receiver: mpsc::Receiver<Command>) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut thunks: HashMap<u64, Box<dyn FnOnce() + Send>> = HashMap::new();

    loop {
        let command = match heap.peek() {
            Some(Reverse((deadline, _))) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(timeout) {
                    Ok(command) => Some(command),
                    Err(mpsc::RecvTimeoutError::Timeout) => None,
                    Err(mpsc::RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match receiver.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            },
        };

        match command {
            Some(Command::Schedule(id, deadline, thunk)) => {
                heap.push(Reverse((deadline, id)));
                thunks.insert(id, thunk);
            }
            Some(Command::Cancel(id)) => {
                thunks.remove(&id);
            }
            None => {
                let now = Instant::now();
                while let Some(&Reverse((deadline, id))) = heap.peek() {
                    if deadline > now {
                        break;
                    }
                    heap.pop();
                    if let Some(thunk) = thunks.remove(&id) {
                        thunk();
                    }
                }
            }
        }
    }
}
