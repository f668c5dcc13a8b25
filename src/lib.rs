//! Fiber runtime core for an interpreter-driven effect system.
//!
//! A program is a tree of [`effect::Effect`] nodes. [`fiber::Fiber`]
//! evaluates one such tree on a pool of worker threads, cooperatively
//! scheduling suspension points through an injected [`executor::Executor`]
//! and [`timer::Timer`].
//!
//! This crate is the core only: effect construction sugar, a typeclass
//! hierarchy, and concurrency data structures built atop fibers (semaphores,
//! queues, refs) live elsewhere.

pub mod effect;
pub mod executor;
pub mod fiber;
pub mod outcome;
pub mod timer;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A user-level error, type-erased the way a caught exception would be.
///
/// `Arc`-backed rather than boxed: a fiber's outcome may be observed by many
/// joiners (spec §4.5), and none of them should need the payload to be
/// `Clone` just to read it. This is why the payload bound is `Send + Sync`
/// rather than plain `Send`.
///
/// Fatal errors (panics not recognized as ordinary throwables) are not
/// wrapped here; they unwind past the interpreter instead of becoming an
/// [`outcome::Outcome::Errored`].
pub type Throwable = Arc<dyn Any + Send + Sync>;

/// Wraps a [`Throwable`] for use with [`std::error::Error`]-based plumbing
/// (e.g. propagating a registrar failure through `Result`).
///
/// Mirrors the teacher's `Error<E>` shape: one variant for the wrapped
/// payload, one sentinel for a runtime-native terminal state.
#[derive(Clone, thiserror::Error)]
pub enum Error {
    /// A program-level throwable, opaque to the runtime.
    #[error("effect raised an error")]
    Raised(Throwable),

    /// The fiber was cancelled before this operation completed.
    #[error("fiber was cancelled")]
    Cancelled,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Raised(_) => f.debug_tuple("Raised").field(&"<opaque>").finish(),
            Error::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl Error {
    /// Downcasts the wrapped throwable to a concrete error type, if it is one.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        match self {
            Error::Raised(throwable) => throwable.downcast_ref::<E>(),
            Error::Cancelled => None,
        }
    }
}

/// Marks a panic as fatal: the interpreter re-raises it with
/// [`std::panic::resume_unwind`] instead of turning it into an
/// [`outcome::Outcome::Errored`]. Analogous to `NonFatal` in the runtime
/// this crate's design is descended from — most panics are ordinary
/// throwables, but a handful (double panics, allocator failure markers
/// supplied by a caller) should tear the process down instead.
#[derive(Debug)]
pub struct Fatal(pub Box<dyn Any + Send>);

/// Runs `f`, catching any panic and turning it into an [`Error::Raised`]
/// unless the payload is [`Fatal`], in which case it is re-raised.
pub(crate) fn catch_panic<F, T>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> T + std::panic::UnwindSafe,
{
    match std::panic::catch_unwind(f) {
        Ok(value) => Ok(value),
        Err(payload) => {
            if payload.is::<Fatal>() {
                std::panic::resume_unwind(payload);
            }
            Err(Error::Raised(Arc::new(PanicMessage(panic_message(payload)))))
        }
    }
}

#[derive(Debug)]
struct PanicMessage(String);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
