//! `RacePair` reification (spec §4.4): the first child to complete
//! successfully wins immediately. An error only wins outright if the other
//! side has already cancelled; otherwise it's stashed and the race waits to
//! see what the other side does. Two cancellations cancel the racing fiber
//! itself.
//!
//! Grounded on `src/runtime/mod.rs`'s parent/child bookkeeping (`children:
//! BTreeSet<FiberIndex>`, `cancel` walking the child set), generalized here
//! to exactly two named children plus the race atomics spec §4.4 describes.

use crate::effect::{Callback, Effect, Value};
use crate::fiber::callback::Listener;
use crate::fiber::{self, Fiber, RunContext, Shared};
use crate::outcome::Outcome;
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The result of a race: the winning side's value paired with a handle to
/// the loser, which keeps running and is still independently joinable and
/// cancelable by the caller.
pub enum RaceOutcome {
    Left(Value, Fiber),
    Right(Fiber, Value),
}

enum Side {
    Left,
    Right,
}

struct RaceState {
    first_error: Mutex<Option<Error>>,
    first_canceled: AtomicBool,
}

/// Reifies `RacePair` as an `Async` node. Both children inherit `ctx`'s
/// current mask id directly — the mask level at the point `RacePair` is
/// reified, not whatever level a nested `poll` inside one of the racers
/// might later read. This is the fix the spec's open question asks for:
/// without it, a `RacePair` run inside a nested `poll` would capture the
/// poll's *unmasked* level from the wrong side of the mask boundary and
/// could deadlock the outer fiber on cancellation.
pub(crate) fn race_pair(ctx: &RunContext, left: Effect, right: Effect) -> Effect {
    let parent_shared = ctx.shared.clone();
    let executor = ctx.current_executor();
    let timer = parent_shared.timer.clone();
    // `init_mask`, not `masks`: the ambient ancestry this `RacePair` was
    // constructed under, not whatever mask depth happens to be live at the
    // instant it's dispatched. Using `masks` here is the bug the spec's
    // open question names — a `RacePair` built inside a `poll`-revealed
    // region but dispatched while still nested in the enclosing
    // `Uncancelable` would otherwise hand its children a mask level they
    // can never climb back out of.
    let init_mask = ctx.exclusive.init_mask + fiber::MASK_GENERATION;

    crate::effect::async_effect(move |callback: Callback| {
        let fiber_a = fiber::spawn_with_mask(left, executor.clone(), timer.clone(), init_mask);
        let fiber_b = fiber::spawn_with_mask(right, executor.clone(), timer.clone(), init_mask);

        let state = Arc::new(RaceState {
            first_error: Mutex::new(None),
            first_canceled: AtomicBool::new(false),
        });

        let cancel_a = fiber_a.clone();
        let cancel_b = fiber_b.clone();

        install(
            fiber_a.shared.clone(),
            fiber_b.clone(),
            Side::Left,
            callback.clone(),
            state.clone(),
            parent_shared.clone(),
        );
        install(
            fiber_b.shared.clone(),
            fiber_a,
            Side::Right,
            callback,
            state,
            parent_shared,
        );

        crate::effect::with_cancel(crate::effect::delay(move || {
            cancel_a.cancel();
            cancel_b.cancel();
            crate::effect::value(())
        }))
    })
}

/// Registers the race listener on `winner_shared`'s joiner registry.
/// `other` is the sibling fiber, carried along so the winning side's
/// [`RaceOutcome`] can hand it back to the caller.
fn install(
    winner_shared: Arc<Shared>,
    other: Fiber,
    side: Side,
    callback: Callback,
    state: Arc<RaceState>,
    parent_shared: Arc<Shared>,
) {
    let listener: Listener = Box::new(move |outcome: &Outcome| match outcome {
        Outcome::Completed(value) => {
            let race_outcome = match side {
                Side::Left => RaceOutcome::Left(value.clone(), other),
                Side::Right => RaceOutcome::Right(other, value.clone()),
            };
            callback.succeed(crate::effect::value(race_outcome));
        }

        Outcome::Errored(error) => {
            let mut guard = state.first_error.lock().unwrap();
            if guard.is_some() {
                drop(guard);
                callback.fail(error.clone());
            } else {
                *guard = Some(error.clone());
                let already_canceled = state.first_canceled.load(Ordering::Acquire);
                drop(guard);
                if already_canceled {
                    callback.fail(error.clone());
                }
            }
        }

        Outcome::Canceled => {
            if state.first_canceled.swap(true, Ordering::AcqRel) {
                // Both sides canceled; the race itself has nothing left to
                // offer, so it cancels the fiber that started it.
                fiber::cancel_fiber(&parent_shared);
            } else if let Some(error) = state.first_error.lock().unwrap().clone() {
                callback.fail(error);
            }
        }
    });

    let outcome_cell = &winner_shared.outcome;
    winner_shared.callback.register(listener, outcome_cell);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect;
    use crate::executor::ThreadPoolExecutor;
    use crate::timer::WheelTimer;
    use std::sync::mpsc;
    use std::time::Duration;

    fn harness() -> (Arc<ThreadPoolExecutor>, Arc<WheelTimer>) {
        (Arc::new(ThreadPoolExecutor::new(2)), Arc::new(WheelTimer::new()))
    }

    #[test]
    fn first_success_wins_immediately() {
        let (executor, timer) = harness();
        let fast = effect::pure(effect::value(1i32));
        let slow = effect::flat_map(effect::sleep(Duration::from_millis(200)), |_| {
            effect::pure(effect::value(2i32))
        });

        let (tx, rx) = mpsc::channel();
        let program = effect::flat_map(effect::race_pair(fast, slow), move |value| {
            let outcome = value.downcast_ref::<RaceOutcome>().unwrap();
            let winner = match outcome {
                RaceOutcome::Left(v, loser) => {
                    loser.cancel();
                    *v.downcast_ref::<i32>().unwrap()
                }
                RaceOutcome::Right(_, _) => -1,
            };
            let _ = tx.send(winner);
            effect::pure(effect::value(()))
        });

        fiber::run(program, executor, timer);
        let winner = rx.recv_timeout(Duration::from_secs(2)).expect("race never resolved");
        assert_eq!(winner, 1);
    }

    #[test]
    fn second_error_always_delivers() {
        let (executor, timer) = harness();
        let first_error = effect::raise_error(Error::Raised(effect::value("left".to_string())));
        let second_error = effect::flat_map(effect::sleep(Duration::from_millis(20)), |_| {
            effect::raise_error(Error::Raised(effect::value("right".to_string())))
        });

        let (tx, rx) = mpsc::channel();
        let program = effect::handle_error_with(
            effect::race_pair(first_error, second_error),
            move |error| {
                let message = error
                    .downcast_ref::<String>()
                    .cloned()
                    .unwrap_or_default();
                let _ = tx.send(message);
                effect::pure(effect::value(()))
            },
        );

        fiber::run(program, executor, timer);
        let message = rx.recv_timeout(Duration::from_secs(2)).expect("race never resolved");
        assert_eq!(message, "right", "the second side's error must always deliver");
    }

    #[test]
    fn canceling_a_pending_race_cancels_both_children() {
        // Neither side has resolved yet when the racing fiber itself is
        // cancelled; its `with_cancel` finalizer must reach into both
        // children and cancel them, and the race's own outcome is Canceled.
        let (executor, timer) = harness();
        let left = effect::sleep(Duration::from_millis(500));
        let right = effect::sleep(Duration::from_millis(500));

        let program = effect::flat_map(effect::race_pair(left, right), |_| {
            effect::pure(effect::value(()))
        });

        let fiber = fiber::run(program, executor, timer);
        std::thread::sleep(Duration::from_millis(20));
        fiber.cancel();

        let (tx, rx) = mpsc::channel();
        let listener: Listener = Box::new(move |outcome: &Outcome| {
            let _ = tx.send(outcome.is_canceled());
        });
        fiber.shared.callback.register(listener, &fiber.shared.outcome);
        let was_canceled = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never terminated");
        assert!(was_canceled);
    }
}
