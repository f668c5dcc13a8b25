//! A fiber's terminal state (spec §3). Immutable and published at most once
//! per fiber; every joiner that registers before or after publication sees
//! the same `Outcome`.

use crate::effect::Value;
use crate::Error;
use std::fmt;

pub enum Outcome {
    /// The program ran to completion and produced `Value`.
    Completed(Value),
    /// The program raised an error that nothing downstream handled.
    Errored(Error),
    /// The fiber was cancelled before it reached a terminal value.
    Canceled,
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed(_) => write!(f, "Completed(..)"),
            Outcome::Errored(error) => f.debug_tuple("Errored").field(error).finish(),
            Outcome::Canceled => write!(f, "Canceled"),
        }
    }
}

impl Outcome {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    pub fn completed_value(&self) -> Option<&Value> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn errored(&self) -> Option<&Error> {
        match self {
            Outcome::Errored(error) => Some(error),
            _ => None,
        }
    }
}
