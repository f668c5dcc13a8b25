//! The trampoline (spec §4.1): `dispatch` advances one effect node at a
//! time, `succeed`/`fail` unwind the continuation stack with a value or an
//! error. Every function here takes the fiber's [`RunContext`] by value and
//! either returns it embedded in the next step or hands it off to an
//! executor/async cell — there is never a moment where two threads could
//! reach for the same `RunContext` at once.
//!
//! The teacher's `task.rs` reifies a native call stack and reattaches it
//! across a bounded depth before trampolining (`MAX_STACK_DEPTH`); written
//! this way, the loop below never recurses per continuation frame in the
//! first place, so that safeguard has no counterpart here (see DESIGN.md).

use crate::effect::{CancelSlot, Callback, Effect, Value};
use crate::executor::Executor;
use crate::fiber::async_state::{AsyncCell, RegisterOutcome};
use crate::fiber::stacks::{ContTag, StackSlot};
use crate::fiber::{self, RunContext, Shared};
use crate::outcome::Outcome;
use crate::{catch_panic, Error};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Cede budget: after this many steps without suspending, a fiber cedes the
/// worker thread regardless of what it's running, so one greedy fiber can't
/// starve everything else on the executor (spec §4.1 fairness).
const FUEL: u32 = 512;

enum Step {
    Continue(RunContext, Effect),
    Done,
}

pub(crate) fn run_loop(mut ctx: RunContext, mut current: Effect, mut fuel: u32) {
    loop {
        if ctx.shared.canceled.load(Ordering::Relaxed) && ctx.unmasked() {
            begin_cancellation_finalization(ctx);
            return;
        }

        fuel += 1;
        if fuel >= FUEL {
            let executor = ctx.current_executor();
            executor.execute(Box::new(move || run_loop(ctx, current, 0)));
            return;
        }

        match dispatch(ctx, current) {
            Step::Continue(next_ctx, next_effect) => {
                ctx = next_ctx;
                current = next_effect;
            }
            Step::Done => return,
        }
    }
}

fn dispatch(mut ctx: RunContext, effect: Effect) -> Step {
    match effect {
        Effect::Pure(value) => succeed(ctx, value),

        Effect::Delay(thunk) => match catch_panic(AssertUnwindSafe(thunk)) {
            Ok(value) => succeed(ctx, value),
            Err(error) => fail(ctx, error),
        },

        Effect::Error(error) => fail(ctx, error),

        Effect::Async(registrar) => {
            let cell = Arc::new(AsyncCell::new());
            ctx.exclusive.stacks.conts.push(ContTag::Async);
            ctx.exclusive
                .stacks
                .object_state
                .push(StackSlot::AsyncCell(cell.clone()));
            let callback = make_callback(ctx.shared.clone(), cell);
            Step::Continue(ctx, registrar(callback))
        }

        Effect::ReadExecutor => {
            let executor = ctx.current_executor();
            succeed(ctx, crate::effect::value(executor))
        }

        Effect::EvalOn(inner, executor) => {
            ctx.exclusive.stacks.push_ctx(executor.clone());
            ctx.exclusive.stacks.conts.push(ContTag::EvalOn);
            hand_off(ctx, executor, *inner)
        }

        Effect::Map(inner, f) => {
            ctx.exclusive.stacks.conts.push(ContTag::Map);
            ctx.exclusive.stacks.object_state.push(StackSlot::Map(f));
            Step::Continue(ctx, *inner)
        }

        Effect::FlatMap(inner, f) => {
            ctx.exclusive.stacks.conts.push(ContTag::FlatMap);
            ctx.exclusive
                .stacks
                .object_state
                .push(StackSlot::FlatMap(f));
            Step::Continue(ctx, *inner)
        }

        Effect::HandleErrorWith(inner, f) => {
            ctx.exclusive.stacks.conts.push(ContTag::HandleErrorWith);
            ctx.exclusive
                .stacks
                .object_state
                .push(StackSlot::HandleErrorWith(f));
            Step::Continue(ctx, *inner)
        }

        Effect::OnCase(inner, f) => {
            let executor = ctx.current_executor();
            ctx.exclusive
                .finalizers
                .push(fiber::PinnedFinalizer { f, executor });
            ctx.exclusive.stacks.conts.push(ContTag::OnCase);
            Step::Continue(ctx, *inner)
        }

        Effect::Uncancelable(body) => {
            ctx.exclusive.masks += 1;
            let poll_id = ctx.exclusive.masks;
            ctx.exclusive.stacks.conts.push(ContTag::Uncancelable);
            let next = body(crate::effect::Poll(poll_id));
            Step::Continue(ctx, next)
        }

        Effect::Canceled => {
            ctx.shared.canceled.store(true, Ordering::Relaxed);
            succeed(ctx, crate::effect::value(()))
        }

        Effect::Start(inner) => {
            let child = fiber::spawn_child(&ctx, *inner);
            succeed(ctx, crate::effect::value(child))
        }

        Effect::RacePair(left, right) => {
            let effect = fiber::race::race_pair(&ctx, *left, *right);
            Step::Continue(ctx, effect)
        }

        Effect::Sleep(duration) => {
            let timer = ctx.shared.timer.clone();
            let effect = crate::effect::async_effect(move |callback: Callback| {
                let handle = timer.sleep(
                    duration,
                    Box::new(move || callback.succeed(crate::effect::value(()))),
                );
                crate::effect::with_cancel(crate::effect::delay(move || {
                    handle.cancel();
                    crate::effect::value(())
                }))
            });
            Step::Continue(ctx, effect)
        }

        Effect::RealTime => {
            let now = ctx.shared.timer.now_millis();
            succeed(ctx, crate::effect::value(now))
        }

        Effect::Monotonic => {
            let now = ctx.shared.timer.monotonic_nanos();
            succeed(ctx, crate::effect::value(now))
        }

        Effect::Cede => {
            let executor = ctx.current_executor();
            hand_off(ctx, executor, Effect::Pure(crate::effect::value(())))
        }

        Effect::Unmask(inner, mask_id) => {
            if ctx.exclusive.masks == mask_id {
                ctx.exclusive.masks -= 1;
                ctx.exclusive.stacks.conts.push(ContTag::Unmask);
            }
            Step::Continue(ctx, *inner)
        }
    }
}

fn hand_off(ctx: RunContext, executor: Arc<dyn Executor>, effect: Effect) -> Step {
    executor.execute(Box::new(move || run_loop(ctx, effect, 0)));
    Step::Done
}

fn succeed(mut ctx: RunContext, mut value: Value) -> Step {
    loop {
        return match ctx.exclusive.stacks.conts.pop() {
            None => terminate(ctx, Outcome::Completed(value)),

            Some(ContTag::CancellationLoop) => {
                ctx.exclusive.masks -= 1;
                cancellation_loop_step(ctx)
            }

            Some(ContTag::Async) => {
                let cell = pop_async_cell(&mut ctx);
                registrar_succeeded(ctx, cell, value)
            }

            Some(ContTag::EvalOn) => {
                ctx.exclusive.stacks.pop_ctx();
                let executor = ctx.current_executor();
                hand_off(ctx, executor, Effect::Pure(value))
            }

            Some(ContTag::Map) => {
                let f = pop_map(&mut ctx);
                match catch_panic(AssertUnwindSafe(move || f(value))) {
                    Ok(next) => {
                        value = next;
                        continue;
                    }
                    Err(error) => fail(ctx, error),
                }
            }

            Some(ContTag::FlatMap) => {
                let f = pop_flat_map(&mut ctx);
                match catch_panic(AssertUnwindSafe(move || f(value))) {
                    Ok(next) => Step::Continue(ctx, next),
                    Err(error) => fail(ctx, error),
                }
            }

            Some(ContTag::HandleErrorWith) => {
                pop_handle_error_with(&mut ctx);
                continue;
            }

            Some(ContTag::OnCase) => {
                let finalizer = ctx
                    .exclusive
                    .finalizers
                    .pop()
                    .expect("OnCase cont without a matching finalizer");
                let outcome = Outcome::Completed(value);
                let registered_on = finalizer.executor.clone();
                ctx.exclusive.masks += 1;
                match catch_panic(AssertUnwindSafe(|| finalizer.run(&outcome))) {
                    Ok(cleanup) => {
                        let value = match outcome {
                            Outcome::Completed(value) => value,
                            _ => unreachable!(),
                        };
                        ctx.exclusive.stacks.boolean_state.push(true);
                        ctx.exclusive
                            .stacks
                            .object_state
                            .push(StackSlot::PendingValue(value));
                        ctx.exclusive.stacks.conts.push(ContTag::OnCaseForwarder);
                        let cleanup = pin_to_executor(&ctx, registered_on, cleanup);
                        Step::Continue(ctx, cleanup)
                    }
                    Err(error) => fail(ctx, error),
                }
            }

            Some(ContTag::OnCaseForwarder) => oncase_forward(ctx),

            Some(ContTag::Uncancelable) => {
                ctx.exclusive.masks -= 1;
                continue;
            }

            Some(ContTag::Unmask) => {
                ctx.exclusive.masks += 1;
                continue;
            }
        };
    }
}

fn fail(mut ctx: RunContext, mut error: Error) -> Step {
    loop {
        return match ctx.exclusive.stacks.conts.pop() {
            None => terminate(ctx, Outcome::Errored(error)),

            Some(ContTag::CancellationLoop) => {
                ctx.exclusive.masks -= 1;
                cancellation_loop_step(ctx)
            }

            Some(ContTag::Async) => {
                let cell = pop_async_cell(&mut ctx);
                registrar_failed(ctx, cell, error)
            }

            Some(ContTag::EvalOn) => {
                ctx.exclusive.stacks.pop_ctx();
                let executor = ctx.current_executor();
                hand_off(ctx, executor, Effect::Error(error))
            }

            // Map/FlatMap don't observe errors; only HandleErrorWith does.
            Some(ContTag::Map) => {
                pop_map(&mut ctx);
                continue;
            }
            Some(ContTag::FlatMap) => {
                pop_flat_map(&mut ctx);
                continue;
            }

            Some(ContTag::HandleErrorWith) => {
                let f = pop_handle_error_with(&mut ctx);
                match catch_panic(AssertUnwindSafe(move || f(error))) {
                    Ok(next) => Step::Continue(ctx, next),
                    Err(next_error) => {
                        error = next_error;
                        continue;
                    }
                }
            }

            Some(ContTag::OnCase) => {
                let finalizer = ctx
                    .exclusive
                    .finalizers
                    .pop()
                    .expect("OnCase cont without a matching finalizer");
                let outcome = Outcome::Errored(error);
                let registered_on = finalizer.executor.clone();
                ctx.exclusive.masks += 1;
                match catch_panic(AssertUnwindSafe(|| finalizer.run(&outcome))) {
                    Ok(cleanup) => {
                        let error = match outcome {
                            Outcome::Errored(error) => error,
                            _ => unreachable!(),
                        };
                        ctx.exclusive.stacks.boolean_state.push(false);
                        ctx.exclusive
                            .stacks
                            .object_state
                            .push(StackSlot::PendingError(error));
                        ctx.exclusive.stacks.conts.push(ContTag::OnCaseForwarder);
                        let cleanup = pin_to_executor(&ctx, registered_on, cleanup);
                        Step::Continue(ctx, cleanup)
                    }
                    Err(panic_error) => fail(ctx, panic_error),
                }
            }

            Some(ContTag::OnCaseForwarder) => oncase_forward(ctx),

            Some(ContTag::Uncancelable) => {
                ctx.exclusive.masks -= 1;
                continue;
            }

            Some(ContTag::Unmask) => {
                ctx.exclusive.masks += 1;
                continue;
            }
        };
    }
}

fn oncase_forward(mut ctx: RunContext) -> Step {
    ctx.exclusive.masks -= 1;
    let was_success = ctx
        .exclusive
        .stacks
        .boolean_state
        .pop()
        .expect("OnCaseForwarder cont without a pending outcome");
    if was_success {
        match ctx.exclusive.stacks.object_state.pop() {
            Some(StackSlot::PendingValue(value)) => succeed(ctx, value),
            _ => unreachable!("OnCaseForwarder expected a pending value"),
        }
    } else {
        match ctx.exclusive.stacks.object_state.pop() {
            Some(StackSlot::PendingError(error)) => fail(ctx, error),
            _ => unreachable!("OnCaseForwarder expected a pending error"),
        }
    }
}

/// The registrar's own evaluation finished successfully, resolving to a
/// [`CancelSlot`] (spec §4.2's `Option<cancel-effect>`).
fn registrar_succeeded(mut ctx: RunContext, cell: Arc<AsyncCell>, value: Value) -> Step {
    let slot = value
        .downcast_ref::<CancelSlot>()
        .expect("Async registrar must resolve via no_cancel()/with_cancel()");
    let cancel_effect = slot.lock().unwrap().take();

    let with_finalizer = ctx.unmasked() && cancel_effect.is_some();
    if with_finalizer {
        let cancel_effect = cancel_effect.unwrap();
        let executor = ctx.current_executor();
        let f: crate::effect::OnCaseFn = Box::new(move |outcome| match outcome {
            Outcome::Canceled => cancel_effect,
            _ => Effect::Pure(crate::effect::value(())),
        });
        ctx.exclusive
            .finalizers
            .push(fiber::PinnedFinalizer { f, executor });
    }

    if ctx.shared.canceled.load(Ordering::Relaxed) {
        // A cancellation request may have landed while the registrar was
        // running. Park anyway; the cancelling thread's `suspended` CAS
        // will steal this exact context right back out.
        cell.suspend(ctx);
        return Step::Done;
    }

    match cell.try_register(with_finalizer) {
        RegisterOutcome::Registered => {
            cell.suspend(ctx);
            Step::Done
        }
        RegisterOutcome::AlreadyComplete(result) => {
            if with_finalizer {
                ctx.exclusive.finalizers.pop();
            }
            async_continue_via_executor(ctx, result)
        }
    }
}

/// The registrar's own evaluation failed. A delivery may have already
/// raced ahead of it (the callback fired, then the registrar's remaining
/// cleanup code threw); if so, honor the delivered result instead.
fn registrar_failed(ctx: RunContext, cell: Arc<AsyncCell>, error: Error) -> Step {
    if cell.mark_done_for_registrar_failure() {
        let result = cell.take_complete();
        async_continue_via_executor(ctx, result)
    } else {
        fail(ctx, error)
    }
}

fn pop_async_cell(ctx: &mut RunContext) -> Arc<AsyncCell> {
    match ctx.exclusive.stacks.object_state.pop() {
        Some(StackSlot::AsyncCell(cell)) => cell,
        _ => unreachable!("Async cont without a matching AsyncCell"),
    }
}

fn pop_map(ctx: &mut RunContext) -> crate::effect::MapFn {
    match ctx.exclusive.stacks.object_state.pop() {
        Some(StackSlot::Map(f)) => f,
        _ => unreachable!("Map cont without a matching closure"),
    }
}

fn pop_flat_map(ctx: &mut RunContext) -> crate::effect::FlatMapFn {
    match ctx.exclusive.stacks.object_state.pop() {
        Some(StackSlot::FlatMap(f)) => f,
        _ => unreachable!("FlatMap cont without a matching closure"),
    }
}

fn pop_handle_error_with(ctx: &mut RunContext) -> crate::effect::HandleFn {
    match ctx.exclusive.stacks.object_state.pop() {
        Some(StackSlot::HandleErrorWith(f)) => f,
        _ => unreachable!("HandleErrorWith cont without a matching closure"),
    }
}

fn make_callback(shared: Arc<Shared>, cell: Arc<AsyncCell>) -> Callback {
    Callback(Arc::new(move |result: Result<Value, Error>| {
        crate::fiber::async_state::deliver(&shared, &cell, result);
    }))
}

fn async_continue_via_executor(ctx: RunContext, result: Result<Value, Error>) -> Step {
    let executor = ctx.current_executor();
    executor.execute(Box::new(move || async_continue(ctx, result)));
    Step::Done
}

/// Entry point for resuming a fiber once an async result is in hand,
/// whether that's this thread continuing past a synchronously-resolved
/// registrar or a foreign thread's callback waking a parked one.
pub(crate) fn async_continue(ctx: RunContext, result: Result<Value, Error>) {
    let step = match result {
        Ok(value) => succeed(ctx, value),
        Err(error) => fail(ctx, error),
    };
    run_step(step);
}

fn run_step(step: Step) {
    if let Step::Continue(ctx, effect) = step {
        run_loop(ctx, effect, 0);
    }
}

/// A cancelling thread that won the race to steal a suspended fiber calls
/// this with the `Shared` it was parked under.
pub(crate) fn steal_suspended(shared: Arc<Shared>) {
    let cell = shared
        .current_async
        .lock()
        .unwrap()
        .take()
        .expect("stole suspended without a current_async pointer");
    let ctx = cell.take_parked();

    if ctx.unmasked() {
        begin_cancellation_finalization(ctx);
    } else {
        // Cancellation requested while masked; the fiber will finalize
        // itself once it unmasks. Re-park so a future delivery (or a
        // second cancel) can still find it.
        cell.suspend(ctx);
    }
}

/// Publishes `Canceled` and runs finalizers LIFO (spec §4.3, §4.4).
pub(crate) fn begin_cancellation_finalization(ctx: RunContext) {
    fiber::publish_outcome(&ctx.shared, Outcome::Canceled);
    run_step(cancellation_loop_step(ctx));
}

fn cancellation_loop_step(mut ctx: RunContext) -> Step {
    match ctx.exclusive.finalizers.pop() {
        None => Step::Done,
        Some(finalizer) => {
            ctx.exclusive.masks += 1;
            ctx.exclusive.stacks.conts.push(ContTag::CancellationLoop);
            let registered_on = finalizer.executor.clone();
            let effect = finalizer.run(&Outcome::Canceled);
            let effect = pin_to_executor(&ctx, registered_on, effect);
            Step::Continue(ctx, effect)
        }
    }
}

/// Wraps `cleanup` in `Effect::EvalOn` back to `registered_on` if the fiber
/// is no longer resident on the executor the finalizer was registered under
/// (spec §4.1 executor pinning for finalizers).
fn pin_to_executor(ctx: &RunContext, registered_on: Arc<dyn Executor>, cleanup: Effect) -> Effect {
    if Arc::ptr_eq(&ctx.current_executor(), &registered_on) {
        cleanup
    } else {
        Effect::EvalOn(Box::new(cleanup), registered_on)
    }
}

/// Normal run terminus: the continuation stack ran out. Publishes whatever
/// the program actually computed, unconditionally. A `Canceled` outcome is
/// never produced here — it can only come from the cancellation gate in
/// [`run_loop`] or from [`begin_cancellation_finalization`], both of which
/// only act when the fiber is unmasked, so a program that finished under a
/// mask without its `poll` ever revealing a cancellation point is never
/// retroactively reclassified (spec Testable Property #4).
fn terminate(ctx: RunContext, computed: Outcome) -> Step {
    fiber::publish_outcome(&ctx.shared, computed);
    Step::Done
}
