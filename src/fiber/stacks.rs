//! Per-fiber stacks (spec §3): a continuation-tag stack, an object stack for
//! captured frame payloads, a boolean stack, and a stack of executors. A
//! fiber owns its stacks exclusively while resident on a worker thread; no
//! other thread observes them (spec §3 Ownership & lifecycle).
//!
//! `ContTag` and `StackSlot` implement the spec §9 redesign flag directly:
//! a closed enumeration of frame kinds replaces per-frame polymorphic
//! continuation objects. `ContTag` is the spec's "byte tag stack"; it stays
//! one byte per entry via `#[repr(u8)]`.

use crate::effect::{FlatMapFn, HandleFn, MapFn, Value};
use crate::executor::Executor;
use crate::fiber::async_state::AsyncCell;
use crate::Error;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ContTag {
    CancellationLoop,
    Async,
    EvalOn,
    Map,
    FlatMap,
    HandleErrorWith,
    OnCase,
    OnCaseForwarder,
    Uncancelable,
    Unmask,
}

/// The object stack's closed set of payload kinds. Replaces a raw `Any`
/// stack with a match over a known shape, per the system's "prefer enums at
/// interpreter seams" guidance.
pub(crate) enum StackSlot {
    Map(MapFn),
    FlatMap(FlatMapFn),
    HandleErrorWith(HandleFn),
    AsyncCell(Arc<AsyncCell>),
    PendingValue(Value),
    PendingError(Error),
}

pub(crate) struct Stacks {
    pub(crate) conts: Vec<ContTag>,
    pub(crate) object_state: Vec<StackSlot>,
    pub(crate) boolean_state: Vec<bool>,
    pub(crate) ctxs: Vec<Arc<dyn Executor>>,
}

impl Stacks {
    pub(crate) fn new(root_executor: Arc<dyn Executor>) -> Self {
        Stacks {
            conts: Vec::new(),
            object_state: Vec::new(),
            boolean_state: Vec::new(),
            ctxs: vec![root_executor],
        }
    }

    pub(crate) fn current_ctx(&self) -> Arc<dyn Executor> {
        self.ctxs
            .last()
            .expect("executor stack is never empty")
            .clone()
    }

    pub(crate) fn push_ctx(&mut self, executor: Arc<dyn Executor>) {
        self.ctxs.push(executor);
    }

    pub(crate) fn pop_ctx(&mut self) {
        self.ctxs.pop();
        debug_assert!(!self.ctxs.is_empty(), "popped the root executor");
    }
}
