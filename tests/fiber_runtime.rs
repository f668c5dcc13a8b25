//! Integration tests for the full effect tree -> fiber -> executor/timer
//! pipeline, covering spec §8's scenario list end to end.

use fiberglass::effect;
use fiberglass::executor::ThreadPoolExecutor;
use fiberglass::fiber::race::RaceOutcome;
use fiberglass::fiber::{self, Fiber};
use fiberglass::outcome::Outcome;
use fiberglass::timer::WheelTimer;
use fiberglass::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn harness() -> (Arc<ThreadPoolExecutor>, Arc<WheelTimer>) {
    // Timing-sensitive tests (sleeps, races, concurrent cancels) are the
    // ones most likely to flake; a logger one can enable with RUST_LOG
    // makes a stuck run's fiber lifecycle visible instead of a bare timeout.
    let _ = env_logger::builder().is_test(true).try_init();
    (Arc::new(ThreadPoolExecutor::new(4)), Arc::new(WheelTimer::new()))
}

/// Spawns a tiny driver fiber whose whole body is `target.join()`, reporting
/// the resolved [`Outcome`] back over `tx`. This is how every test below
/// observes a program's result without the core exposing a blocking join
/// (the core stays async-only; blocking is a caller concern).
fn watch(target: &Fiber, executor: Arc<ThreadPoolExecutor>, timer: Arc<WheelTimer>, tx: mpsc::Sender<Outcome>) {
    let target = target.clone();
    let ok_tx = tx.clone();
    let driver = effect::flat_map(target.join(), move |value| {
        let _ = ok_tx.send(Outcome::Completed(value));
        effect::pure(effect::value(()))
    });
    let driver = effect::handle_error_with(driver, move |error| {
        let outcome = match error {
            Error::Cancelled => Outcome::Canceled,
            other => Outcome::Errored(other),
        };
        let _ = tx.send(outcome);
        effect::pure(effect::value(()))
    });

    fiber::run(driver, executor, timer);
}

fn run_and_watch(program: effect::Effect, executor: Arc<ThreadPoolExecutor>, timer: Arc<WheelTimer>) -> (Fiber, mpsc::Receiver<Outcome>) {
    let fiber = fiber::run(program, executor.clone(), timer.clone());
    let (tx, rx) = mpsc::channel();
    watch(&fiber, executor, timer, tx);
    (fiber, rx)
}

#[test]
fn pure_program_completes_with_its_value() {
    let (executor, timer) = harness();
    let program = effect::flat_map(effect::pure(effect::value(41i32)), move |value| {
        let n = *value.downcast_ref::<i32>().unwrap();
        effect::pure(effect::value(n + 1))
    });

    let (_fiber, rx) = run_and_watch(program, executor, timer);
    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never terminated");
    match outcome {
        Outcome::Completed(value) => assert_eq!(*value.downcast_ref::<i32>().unwrap(), 42),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn error_is_caught_by_handle_error_with() {
    let (executor, timer) = harness();
    let boom = effect::raise_error(Error::Raised(effect::value("boom".to_string())));
    let recovered = effect::handle_error_with(boom, |_error| effect::pure(effect::value(7i32)));

    let (_fiber, rx) = run_and_watch(recovered, executor, timer);
    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never terminated");
    match outcome {
        Outcome::Completed(value) => assert_eq!(*value.downcast_ref::<i32>().unwrap(), 7),
        other => panic!("expected recovered completion, got {other:?}"),
    }
}

#[test]
fn uncancelable_body_runs_to_completion_despite_concurrent_cancel() {
    // Masking protects both the body's *execution* and its terminal outcome:
    // the sleep still runs exactly once even though cancel() lands while
    // it's masked, and since the body's `poll` is never invoked, the
    // cancellation is never observed and the fiber completes normally
    // (spec §8 Scenario 3, Testable Property #4).
    let (executor, timer) = harness();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();

    let program = effect::uncancelable(move |_poll| {
        effect::flat_map(effect::sleep(Duration::from_millis(100)), move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
            effect::pure(effect::value(()))
        })
    });

    let (fiber, rx) = run_and_watch(program, executor, timer);
    fiber.cancel(); // lands while the fiber is masked and suspended on the sleep
    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never terminated");
    assert_eq!(ran.load(Ordering::SeqCst), 1, "masked body must still run to completion");
    match outcome {
        Outcome::Completed(value) => assert!(value.downcast_ref::<()>().is_some()),
        other => panic!("masked completion must not be reclassified as Canceled, got {other:?}"),
    }
}

#[test]
fn finalizer_runs_on_cancellation() {
    let (executor, timer) = harness();
    let finalized = Arc::new(AtomicUsize::new(0));
    let finalized2 = finalized.clone();

    let sleeper = effect::sleep(Duration::from_millis(300));
    let guarded = effect::on_case(sleeper, move |outcome| {
        if outcome.is_canceled() {
            finalized2.fetch_add(1, Ordering::SeqCst);
        }
        effect::pure(effect::value(()))
    });

    let (fiber, rx) = run_and_watch(guarded, executor, timer);
    std::thread::sleep(Duration::from_millis(30));
    fiber.cancel();
    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never terminated");
    assert!(outcome.is_canceled());
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn race_pair_left_wins_when_it_completes_first() {
    let (executor, timer) = harness();
    let fast = effect::pure(effect::value(1i32));
    let slow = effect::flat_map(effect::sleep(Duration::from_millis(300)), |_| {
        effect::pure(effect::value(2i32))
    });

    let raced = effect::flat_map(effect::race_pair(fast, slow), |value| {
        let outcome = value
            .downcast_ref::<RaceOutcome>()
            .expect("RacePair resolves to a RaceOutcome");
        let winner = match outcome {
            RaceOutcome::Left(value, loser) => {
                loser.cancel();
                *value.downcast_ref::<i32>().unwrap()
            }
            RaceOutcome::Right(_, _) => unreachable!("left should win this race"),
        };
        effect::pure(effect::value(winner))
    });

    let (_fiber, rx) = run_and_watch(raced, executor, timer);
    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never terminated");
    match outcome {
        Outcome::Completed(value) => assert_eq!(*value.downcast_ref::<i32>().unwrap(), 1),
        other => panic!("expected left to win, got {other:?}"),
    }
}

#[test]
fn async_effect_delivers_exactly_once() {
    let (executor, timer) = harness();
    let deliveries = Arc::new(AtomicUsize::new(0));
    let deliveries2 = deliveries.clone();

    let program = effect::async_effect(move |callback| {
        std::thread::spawn(move || {
            callback.succeed(effect::value(99i32));
            // A second delivery attempt must be a no-op (spec §4.2 at-most-once).
            callback.succeed(effect::value(100i32));
        });
        effect::no_cancel()
    });
    let program = effect::map(program, move |value| {
        deliveries2.fetch_add(1, Ordering::SeqCst);
        value
    });

    let (_fiber, rx) = run_and_watch(program, executor, timer);
    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never terminated");
    match outcome {
        Outcome::Completed(value) => assert_eq!(*value.downcast_ref::<i32>().unwrap(), 99),
        other => panic!("expected the first delivery to win, got {other:?}"),
    }
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
}

#[test]
fn join_observes_outcome_whether_registered_before_or_after_completion() {
    let (executor, timer) = harness();
    let child = fiber::run(effect::pure(effect::value(5i32)), executor.clone(), timer.clone());
    std::thread::sleep(Duration::from_millis(30)); // let it finish before we join

    let joiner_program = effect::flat_map(child.join(), |value| effect::pure(value));
    let (_fiber, rx) = run_and_watch(joiner_program, executor, timer);
    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("joiner never terminated");
    match outcome {
        Outcome::Completed(value) => assert_eq!(*value.downcast_ref::<i32>().unwrap(), 5),
        other => panic!("expected joiner to observe 5, got {other:?}"),
    }
}

#[test]
fn start_spawns_an_independently_joinable_child() {
    let (executor, timer) = harness();
    let program = effect::flat_map(effect::start(effect::pure(effect::value(3i32))), |child| {
        let child = child
            .downcast_ref::<Fiber>()
            .expect("Start resolves to a Fiber")
            .clone();
        child.join()
    });

    let (_fiber, rx) = run_and_watch(program, executor, timer);
    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never terminated");
    match outcome {
        Outcome::Completed(value) => assert_eq!(*value.downcast_ref::<i32>().unwrap(), 3),
        other => panic!("expected child's value via join, got {other:?}"),
    }
}

#[test]
fn error_propagates_through_map_and_flat_map_without_observing_it() {
    let (executor, timer) = harness();
    let touched = Arc::new(AtomicUsize::new(0));
    let touched2 = touched.clone();

    let boom = effect::raise_error(Error::Raised(effect::value("boom".to_string())));
    let program = effect::map(boom, move |value| {
        touched2.fetch_add(1, Ordering::SeqCst);
        value
    });

    let (_fiber, rx) = run_and_watch(program, executor, timer);
    let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never terminated");
    assert!(matches!(outcome, Outcome::Errored(_)));
    assert_eq!(touched.load(Ordering::SeqCst), 0, "map's function must not run on an error path");
}
