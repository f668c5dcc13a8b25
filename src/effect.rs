//! The effect node AST (spec §3 Data model): an immutable tree where every
//! node is a tagged variant carrying just the operands its combinator needs.
//! `fiber::interpreter` dispatches on the tag alone and never inspects
//! anything else about a node — see the spec §9 redesign flag this mirrors
//! for continuation frames.

use crate::executor::Executor;
use crate::outcome::Outcome;
use crate::Error;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// A type-erased effect result. `Arc`-backed (not boxed) for the same reason
/// as [`crate::Throwable`]: a completed fiber's value may be read by many
/// joiners (spec §4.5) without requiring it to be `Clone`.
pub type Value = Arc<dyn Any + Send + Sync>;

pub fn value<T: Any + Send + Sync>(inner: T) -> Value {
    Arc::new(inner)
}

pub type Thunk = Box<dyn FnOnce() -> Value + Send>;
pub type MapFn = Box<dyn FnOnce(Value) -> Value + Send>;
pub type FlatMapFn = Box<dyn FnOnce(Value) -> Effect + Send>;
pub type HandleFn = Box<dyn FnOnce(Error) -> Effect + Send>;

/// Guard effect run when a scope exits, observing the `Outcome` it exited
/// with. Invoked at most once, hence `FnOnce` rather than `Fn`.
pub type OnCaseFn = Box<dyn FnOnce(&Outcome) -> Effect + Send>;

/// Callback handed to an [`Effect::Async`] registrar. Delivers the async
/// operation's result exactly once; see `fiber::async_state`.
#[derive(Clone)]
pub struct Callback(pub(crate) Arc<dyn Fn(Result<Value, Error>) + Send + Sync>);

impl Callback {
    pub fn succeed(&self, value: Value) {
        (self.0)(Ok(value));
    }

    pub fn fail(&self, error: Error) {
        (self.0)(Err(error));
    }
}

/// Runs synchronously on the registering thread; returns the effect
/// producing `Option<cancel-effect>` the interpreter evaluates next
/// (spec §4.2).
pub type Registrar = Box<dyn FnOnce(Callback) -> Effect + Send>;

/// The restore-mask operation handed to an [`Effect::Uncancelable`] body.
/// Wraps an effect in an `Unmask` node tagged with the mask id the
/// enclosing `Uncancelable` was entered at, so it only ever matches that
/// specific `Uncancelable` (spec §3 Mask IDs).
#[derive(Clone, Copy)]
pub struct Poll(pub(crate) u32);

impl Poll {
    pub fn apply(&self, effect: Effect) -> Effect {
        Effect::Unmask(Box::new(effect), self.0)
    }
}

pub type Body = Box<dyn FnOnce(Poll) -> Effect + Send>;

/// Carries an `Async` registrar's `Option<cancel-effect>` result through the
/// generic `Value` channel. `Effect` itself can't be `Sync` (it holds boxed
/// `FnOnce` closures), but `Value` requires `Any + Send + Sync` so a
/// completed fiber's outcome can be read by many joiners without cloning.
/// `Mutex<T>` is `Sync` for any `T: Send` regardless of `T: Sync`, so
/// wrapping the effect in one closes the gap; the registrar's own
/// continuation is the only reader and takes ownership with `.take()`.
pub(crate) type CancelSlot = std::sync::Mutex<Option<Effect>>;

/// Resolves an `Async` registrar with no finalizer.
pub fn no_cancel() -> Effect {
    Effect::Pure(value(CancelSlot::new(None)))
}

/// Resolves an `Async` registrar with a finalizer to run if the fiber is
/// cancelled while suspended on it.
pub fn with_cancel(cancel_effect: Effect) -> Effect {
    Effect::Pure(value(CancelSlot::new(Some(cancel_effect))))
}

/// One node of a program (spec §3). Every variant is exactly one step; the
/// interpreter decides what "next" means by matching the tag.
pub enum Effect {
    Pure(Value),
    Delay(Thunk),
    Error(Error),
    Async(Registrar),
    ReadExecutor,
    EvalOn(Box<Effect>, Arc<dyn Executor>),
    Map(Box<Effect>, MapFn),
    FlatMap(Box<Effect>, FlatMapFn),
    HandleErrorWith(Box<Effect>, HandleFn),
    OnCase(Box<Effect>, OnCaseFn),
    Uncancelable(Body),
    Canceled,
    Start(Box<Effect>),
    RacePair(Box<Effect>, Box<Effect>),
    Sleep(Duration),
    RealTime,
    Monotonic,
    Cede,
    /// Internal: restores `masks` to `mask_id` around `inner` if `mask_id`
    /// matches the fiber's current mask id, otherwise a no-op. Never
    /// constructed directly by callers; produced by [`Poll::apply`].
    Unmask(Box<Effect>, u32),
}

pub fn pure(value: Value) -> Effect {
    Effect::Pure(value)
}

pub fn delay<F>(thunk: F) -> Effect
where
    F: FnOnce() -> Value + Send + 'static,
{
    Effect::Delay(Box::new(thunk))
}

pub fn raise_error(error: Error) -> Effect {
    Effect::Error(error)
}

pub fn async_effect<F>(registrar: F) -> Effect
where
    F: FnOnce(Callback) -> Effect + Send + 'static,
{
    Effect::Async(Box::new(registrar))
}

pub fn read_executor() -> Effect {
    Effect::ReadExecutor
}

pub fn eval_on(inner: Effect, executor: Arc<dyn Executor>) -> Effect {
    Effect::EvalOn(Box::new(inner), executor)
}

pub fn map<F>(inner: Effect, f: F) -> Effect
where
    F: FnOnce(Value) -> Value + Send + 'static,
{
    Effect::Map(Box::new(inner), Box::new(f))
}

pub fn flat_map<F>(inner: Effect, f: F) -> Effect
where
    F: FnOnce(Value) -> Effect + Send + 'static,
{
    Effect::FlatMap(Box::new(inner), Box::new(f))
}

pub fn handle_error_with<F>(inner: Effect, f: F) -> Effect
where
    F: FnOnce(Error) -> Effect + Send + 'static,
{
    Effect::HandleErrorWith(Box::new(inner), Box::new(f))
}

pub fn on_case<F>(inner: Effect, f: F) -> Effect
where
    F: FnOnce(&Outcome) -> Effect + Send + 'static,
{
    Effect::OnCase(Box::new(inner), Box::new(f))
}

pub fn uncancelable<F>(body: F) -> Effect
where
    F: FnOnce(Poll) -> Effect + Send + 'static,
{
    Effect::Uncancelable(Box::new(body))
}

pub fn canceled() -> Effect {
    Effect::Canceled
}

pub fn start(inner: Effect) -> Effect {
    Effect::Start(Box::new(inner))
}

pub fn race_pair(left: Effect, right: Effect) -> Effect {
    Effect::RacePair(Box::new(left), Box::new(right))
}

pub fn sleep(duration: Duration) -> Effect {
    Effect::Sleep(duration)
}

pub fn real_time() -> Effect {
    Effect::RealTime
}

pub fn monotonic() -> Effect {
    Effect::Monotonic
}

pub fn cede() -> Effect {
    Effect::Cede
}
