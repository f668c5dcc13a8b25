//! The async registration/delivery handshake (spec §4.2): mediates the race
//! between the registering fiber (deciding whether to suspend) and the
//! delivering callback (which may run on any thread, at any time, including
//! synchronously inside the registrar itself).
//!
//! Grounded on `src/sync/oneshot_notify.rs`'s three-state enum
//! (`NothingHappened` / `Notified` / `Waiting`), translated from a
//! single-threaded `Rc<RefCell<_>>` to a cross-thread `Mutex`-guarded state
//! machine. A `Mutex` stands in for the raw CAS loop the teacher's
//! `task.rs` reference counting uses, since our payload (a boxed value or
//! error) isn't `Copy` the way an atomic needs; the lock is held only for
//! the duration of one state transition; no wait ever occurs under it.

use crate::effect::Value;
use crate::executor::Executor;
use crate::fiber::RunContext;
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

enum State {
    Initial,
    RegisteredNoFinalizer,
    RegisteredWithFinalizer,
    Complete(Result<Value, Error>),
}

pub(crate) enum RegisterOutcome {
    Registered,
    AlreadyComplete(Result<Value, Error>),
}

pub(crate) enum DeliveryTarget {
    /// The registering thread hasn't reached its own check yet; it will
    /// see `Complete` there and continue inline.
    RegistrarPending,
    /// The registering thread already suspended; this delivery must steal
    /// the parked context and resume it.
    Suspended { had_finalizer: bool },
}

/// Cell shared between the registering fiber and the (possibly foreign
/// thread) delivery callback for exactly one [`crate::effect::Effect::Async`]
/// node.
pub(crate) struct AsyncCell {
    done: AtomicBool,
    state: Mutex<State>,
    parked: Mutex<Option<RunContext>>,
}

impl AsyncCell {
    pub(crate) fn new() -> Self {
        AsyncCell {
            done: AtomicBool::new(false),
            state: Mutex::new(State::Initial),
            parked: Mutex::new(None),
        }
    }

    /// Registrar side: attempt `Initial -> Registered{With,No}Finalizer`.
    pub(crate) fn try_register(&self, with_finalizer: bool) -> RegisterOutcome {
        let mut guard = self.state.lock().unwrap();
        match &*guard {
            State::Initial => {
                *guard = if with_finalizer {
                    State::RegisteredWithFinalizer
                } else {
                    State::RegisteredNoFinalizer
                };
                RegisterOutcome::Registered
            }
            State::Complete(_) => match std::mem::replace(&mut *guard, State::Initial) {
                State::Complete(result) => RegisterOutcome::AlreadyComplete(result),
                _ => unreachable!(),
            },
            _ => unreachable!("async cell registered twice"),
        }
    }

    /// Registrar side: park the rest of the fiber's execution here, then
    /// publish `suspended = true` so a racing delivery can find it.
    pub(crate) fn suspend(self: &std::sync::Arc<Self>, ctx: RunContext) {
        let shared = ctx.shared.clone();
        *shared.current_async.lock().unwrap() = Some(self.clone());
        *self.parked.lock().unwrap() = Some(ctx);
        shared.suspended.store(true, Ordering::Release);
    }


    /// Delivery side: mark complete (idempotent past the first call per
    /// `done`), reporting what the registering side had reached.
    pub(crate) fn deliver(&self, result: Result<Value, Error>) -> Option<DeliveryTarget> {
        if self.done.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut guard = self.state.lock().unwrap();
        let previous = std::mem::replace(&mut *guard, State::Complete(result));
        Some(match previous {
            State::Initial => DeliveryTarget::RegistrarPending,
            State::RegisteredNoFinalizer => DeliveryTarget::Suspended { had_finalizer: false },
            State::RegisteredWithFinalizer => DeliveryTarget::Suspended { had_finalizer: true },
            State::Complete(_) => unreachable!("delivered twice past the `done` guard"),
        })
    }

    pub(crate) fn take_complete(&self) -> Result<Value, Error> {
        let mut guard = self.state.lock().unwrap();
        match std::mem::replace(&mut *guard, State::Initial) {
            State::Complete(result) => result,
            _ => unreachable!("take_complete called before delivery"),
        }
    }

    /// Registrar-failure path (spec §4.2: the registrar itself may fail
    /// synchronously after a racing callback already delivered). Marks the
    /// cell done and reports whether a delivery got there first, without
    /// going through the `state` transition `deliver` uses — there is no
    /// result to stash here, just a yes/no.
    pub(crate) fn mark_done_for_registrar_failure(&self) -> bool {
        self.done.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn take_parked(&self) -> RunContext {
        self.parked
            .lock()
            .unwrap()
            .take()
            .expect("parked context missing on resume")
    }
}

/// Delivery side entry point, called from the [`crate::effect::Callback`]
/// closure on whatever thread invokes it. Spins briefly if it observes the
/// registering thread mid-transition (state already `Registered*` but
/// `suspended` not yet flipped) — the registering thread always sets
/// `suspended` right after parking, so this resolves in bounded time.
pub(crate) fn deliver(
    shared: &std::sync::Arc<super::Shared>,
    cell: &std::sync::Arc<AsyncCell>,
    result: Result<Value, Error>,
) {
    let target = match cell.deliver(result) {
        Some(target) => target,
        None => return,
    };

    let had_finalizer = match target {
        DeliveryTarget::RegistrarPending => return,
        DeliveryTarget::Suspended { had_finalizer } => had_finalizer,
    };

    loop {
        match shared
            .suspended
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                shared.current_async.lock().unwrap().take();
                let mut ctx = cell.take_parked();
                if shared.outcome.lock().unwrap().is_none() {
                    if had_finalizer {
                        ctx.exclusive.finalizers.pop();
                    }
                    // Resume on the fiber's own executor (spec §4.2/§5:
                    // "async_continue submits a task to current_ctx"), not on
                    // whatever foreign thread happened to deliver the
                    // result — otherwise e.g. `WheelTimer`'s single timer
                    // thread would end up running the rest of the fiber
                    // itself, starving every other pending timer.
                    let executor = ctx.current_executor();
                    let result = cell.take_complete();
                    executor.execute(Box::new(move || {
                        crate::fiber::interpreter::async_continue(ctx, result);
                    }));
                }
                return;
            }
            Err(_) => {
                if shared.outcome.lock().unwrap().is_some() {
                    // fiber already cancelled and finalized by someone else.
                    return;
                }
                std::hint::spin_loop();
            }
        }
    }
}
