//! Joiner callback registry (spec §4.5, §9 open question): publishes a
//! fiber's terminal outcome to zero, one, or many listeners exactly once
//! each.
//!
//! Grounded on the spec §9 redesign flag ("model as a tagged variant
//! `{Empty, Single(fn), Many(collection)}`") and the small closed
//! lifecycle-state enums `src/runtime/mod.rs` uses for `JoinHandle`. The
//! `Single -> Many` transition is one swap of the whole slot under a single
//! lock acquisition, closing the concurrent-`register` race the open
//! question names instead of mutating a shared collection in place.

use crate::outcome::Outcome;
use std::sync::Mutex;

pub(crate) type Listener = Box<dyn FnOnce(&Outcome) + Send>;

enum Slot {
    Empty,
    Single(Listener),
    Many(Vec<Listener>),
}

pub(crate) struct CallbackRegistry(Mutex<Slot>);

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        CallbackRegistry(Mutex::new(Slot::Empty))
    }

    /// Installs `listener`. If `outcome` is already published, invokes it
    /// immediately instead of registering it, so a join that arrives after
    /// termination never blocks on a registry nobody will ever drain again.
    pub(crate) fn register(&self, listener: Listener, outcome: &Mutex<Option<Outcome>>) {
        {
            let guard = outcome.lock().unwrap();
            if let Some(published) = guard.as_ref() {
                listener(published);
                return;
            }
        }

        {
            let mut slot = self.0.lock().unwrap();
            *slot = match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Empty => Slot::Single(listener),
                Slot::Single(existing) => Slot::Many(vec![existing, listener]),
                Slot::Many(mut listeners) => {
                    listeners.push(listener);
                    Slot::Many(listeners)
                }
            };
        }

        // outcome may have published while we were installing; if so, drain
        // immediately rather than leaving the listener stranded.
        let guard = outcome.lock().unwrap();
        if let Some(published) = guard.as_ref() {
            for listener in drain(&self.0) {
                listener(published);
            }
        }
    }

    /// Drains every registered listener, delivering `outcome` to each.
    /// Called exactly once, by whoever wins the race to publish the
    /// fiber's outcome.
    pub(crate) fn publish(&self, outcome: &Outcome) {
        for listener in drain(&self.0) {
            listener(outcome);
        }
    }
}

fn drain(slot: &Mutex<Slot>) -> Vec<Listener> {
    match std::mem::replace(&mut *slot.lock().unwrap(), Slot::Empty) {
        Slot::Empty => Vec::new(),
        Slot::Single(listener) => vec![listener],
        Slot::Many(listeners) => listeners,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delivers_to_every_registered_listener() {
        let registry = CallbackRegistry::new();
        let outcome_cell: Mutex<Option<Outcome>> = Mutex::new(None);
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let hits = hits.clone();
            registry.register(Box::new(move |_| { hits.fetch_add(1, Ordering::SeqCst); }), &outcome_cell);
        }

        *outcome_cell.lock().unwrap() = Some(Outcome::Canceled);
        registry.publish(&Outcome::Canceled);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn late_registration_sees_published_outcome() {
        let registry = CallbackRegistry::new();
        let outcome_cell: Mutex<Option<Outcome>> = Mutex::new(Some(Outcome::Canceled));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        registry.register(Box::new(move |_| { hits2.fetch_add(1, Ordering::SeqCst); }), &outcome_cell);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
