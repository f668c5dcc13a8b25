//! Injected execution capability (spec §6). The interpreter never steals or
//! balances work itself; it only submits closures and trusts the executor
//! to run them. A rejected submission (pool shut down) silently stops the
//! affected fiber from making further progress, the same way a dropped
//! `Waker` silently stops a `Future` from being polled again.

/// A unit of work the interpreter hands to an [`Executor`]: resume one
/// fiber from where it suspended.
pub type Task = Box<dyn FnOnce() + Send>;

pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Reference executor: a fixed pool of worker threads draining a shared
/// queue. Generalizes the teacher's top-level event loop
/// (`crossbeam_channel::unbounded` plus a pop-and-run loop) from one thread
/// to a pool, since fibers here migrate across threads rather than living
/// on one thread-local runtime.
pub struct ThreadPoolExecutor {
    sender: crossbeam_channel::Sender<Task>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let worker_count = worker_count.max(1);

        let workers = (0..worker_count)
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("fiberglass-worker-{index}"))
                    .spawn(move || {
                        for task in receiver.iter() {
                            task();
                        }
                    })
                    .expect("failed to spawn fiberglass worker thread")
            })
            .collect();

        log::debug!("thread pool executor started with {worker_count} workers");
        ThreadPoolExecutor { sender, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) {
        if self.sender.send(task).is_err() {
            log::warn!("executor rejected submission, worker pool is shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_submitted_tasks() {
        let executor = ThreadPoolExecutor::new(2);
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            executor.execute(Box::new(move || tx.send(i).unwrap()));
        }
        drop(tx);
        let mut results: Vec<i32> = rx.iter().collect();
        results.sort_unstable();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn assert_send_sync() {
        fn assert_bounds<T: Send + Sync>() {}
        assert_bounds::<ThreadPoolExecutor>();
    }
}
