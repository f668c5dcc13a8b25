//! Fiber lifecycle (spec §3 Fiber, §4.3 cancellation, §4.5 join): spawn,
//! run, cancel, join. A fiber owns its stacks exclusively while resident on
//! one worker thread; [`Shared`] is the handful of fields other threads
//! (joiners, cancellers, async callbacks) are allowed to touch.

pub(crate) mod async_state;
pub(crate) mod callback;
pub(crate) mod interpreter;
pub mod race;
pub(crate) mod stacks;

use crate::effect::{Callback, Effect, OnCaseFn};
use crate::executor::Executor;
use crate::fiber::async_state::AsyncCell;
use crate::fiber::callback::{CallbackRegistry, Listener};
use crate::fiber::stacks::Stacks;
use crate::outcome::Outcome;
use crate::timer::Timer;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Mask-id partition size: a child fiber's `init_mask` is its parent's
/// `init_mask + MASK_GENERATION`, so an `Unmask(id)` node only ever matches
/// the specific `Uncancelable` that produced it (spec §3 Mask IDs).
pub(crate) const MASK_GENERATION: u32 = 255;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide, monotonically increasing fiber identity used for log
/// correlation. Generalizes the teacher's `FiberIndex`/slab-key identity
/// (unique only within one thread's arena) now that fibers migrate across
/// worker threads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// State other threads are allowed to touch (spec §5 Concurrency model).
pub(crate) struct Shared {
    pub(crate) id: FiberId,
    pub(crate) timer: Arc<dyn Timer>,
    pub(crate) canceled: AtomicBool,
    pub(crate) suspended: AtomicBool,
    pub(crate) outcome: Mutex<Option<Outcome>>,
    pub(crate) callback: CallbackRegistry,
    /// The `AsyncCell` a suspended fiber is currently parked on, if any.
    /// Lets a canceller that wins the `suspended` CAS find the parked
    /// `RunContext` to steal without the `Fiber` handle needing to carry
    /// one around for every effect node, only for `Async`.
    pub(crate) current_async: Mutex<Option<Arc<AsyncCell>>>,
}

/// An `OnCase` finalizer together with the executor it was registered on
/// (spec §4.1: a finalizer pins execution to the executor captured at
/// registration time, via `EvalOn` wrapping if the executor changed by the
/// time it fires).
pub(crate) struct PinnedFinalizer {
    pub(crate) f: OnCaseFn,
    pub(crate) executor: Arc<dyn Executor>,
}

impl PinnedFinalizer {
    pub(crate) fn run(self, outcome: &Outcome) -> Effect {
        (self.f)(outcome)
    }
}

/// State only the resident worker thread touches; moved by value across
/// executor submissions.
pub(crate) struct Exclusive {
    pub(crate) stacks: Stacks,
    pub(crate) finalizers: Vec<PinnedFinalizer>,
    pub(crate) masks: u32,
    pub(crate) init_mask: u32,
}

pub(crate) struct RunContext {
    pub(crate) shared: Arc<Shared>,
    pub(crate) exclusive: Exclusive,
}

impl RunContext {
    pub(crate) fn current_executor(&self) -> Arc<dyn Executor> {
        self.exclusive.stacks.current_ctx()
    }

    pub(crate) fn unmasked(&self) -> bool {
        self.exclusive.masks == self.exclusive.init_mask
    }
}

/// Handle to a running (or finished) fiber. Cheaply `Clone`, since many
/// parties may want to `cancel` or `join` the same fiber.
#[derive(Clone)]
pub struct Fiber {
    pub(crate) shared: Arc<Shared>,
}

impl Fiber {
    pub fn id(&self) -> FiberId {
        self.shared.id
    }

    /// Requests cancellation (spec §4.3). Idempotent. If the fiber is
    /// currently suspended on an async op, this call steals finalizer
    /// execution itself; otherwise the fiber discovers it at its next
    /// cancellation gate.
    pub fn cancel(&self) {
        cancel_fiber(&self.shared);
    }

    /// An effect that completes with this fiber's terminal [`Outcome`] once
    /// published (spec §4.5, §6 `join`). Registering before or after
    /// termination both observe the same outcome.
    pub fn join(&self) -> Effect {
        let shared = self.shared.clone();
        crate::effect::async_effect(move |callback: Callback| {
            let listener: Listener = Box::new(move |outcome: &Outcome| {
                let value = match outcome {
                    Outcome::Completed(value) => value.clone(),
                    Outcome::Errored(error) => {
                        callback.fail(error.clone());
                        return;
                    }
                    Outcome::Canceled => {
                        callback.fail(crate::Error::Cancelled);
                        return;
                    }
                };
                callback.succeed(value);
            });
            shared.callback.register(listener, &shared.outcome);
            crate::effect::no_cancel()
        })
    }
}

/// Spawns the root fiber for `program`, running it to completion on
/// `executor`. Returns a handle usable for cancellation and joining.
pub fn run(program: Effect, executor: Arc<dyn Executor>, timer: Arc<dyn Timer>) -> Fiber {
    spawn_with_mask(program, executor, timer, 0)
}

pub(crate) fn spawn_with_mask(
    program: Effect,
    executor: Arc<dyn Executor>,
    timer: Arc<dyn Timer>,
    init_mask: u32,
) -> Fiber {
    let shared = Arc::new(Shared {
        id: FiberId::next(),
        timer,
        canceled: AtomicBool::new(false),
        suspended: AtomicBool::new(false),
        outcome: Mutex::new(None),
        callback: CallbackRegistry::new(),
        current_async: Mutex::new(None),
    });

    let ctx = RunContext {
        shared: shared.clone(),
        exclusive: Exclusive {
            stacks: Stacks::new(executor.clone()),
            finalizers: Vec::new(),
            masks: init_mask,
            init_mask,
        },
    };

    log::trace!("spawning {}", shared.id);
    executor.execute(Box::new(move || {
        interpreter::run_loop(ctx, program, 0);
    }));

    Fiber { shared }
}

/// Spawns a child fiber of `parent`, one generation deeper in mask space
/// (spec §3 Mask IDs, §4.3 Start).
pub(crate) fn spawn_child(parent: &RunContext, program: Effect) -> Fiber {
    let executor = parent.current_executor();
    let init_mask = parent.exclusive.init_mask + MASK_GENERATION;
    spawn_with_mask(program, executor, parent.shared.timer.clone(), init_mask)
}

/// Cancellation (spec §4.3): set the flag, then try to steal finalizer
/// execution from a suspended fiber. If the fiber isn't suspended, it will
/// discover cancellation itself at its next gate check.
pub(crate) fn cancel_fiber(shared: &Arc<Shared>) {
    if shared.canceled.swap(true, Ordering::Relaxed) {
        return; // already requested
    }
    log::trace!("cancel requested for {}", shared.id);

    if shared
        .suspended
        .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        // We stole the suspended fiber from whatever async op it was
        // waiting on. Its parked context lives inside the `AsyncCell` the
        // registrar pushed.
        interpreter::steal_suspended(shared.clone());
    }
}

pub(crate) fn publish_outcome(shared: &Arc<Shared>, outcome: Outcome) -> bool {
    let mut guard = shared.outcome.lock().unwrap();
    if guard.is_some() {
        return false;
    }
    log::debug!("{} terminated: {:?}", shared.id, outcome);
    *guard = Some(outcome);
    let published = guard.as_ref().unwrap();
    shared.callback.publish(published);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_implements_traits() {
        use impls::impls;
        use std::fmt::Debug;

        assert!(impls!(Fiber: Send & Sync & Clone & !Debug));
    }

    #[test]
    fn fiber_id_implements_traits() {
        use impls::impls;
        use std::fmt::Debug;

        assert!(impls!(FiberId: Send & Sync & Debug & Clone & Copy));
    }
}
