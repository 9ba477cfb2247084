//! A linearizability checker in the style of Wing & Gong: feed it a
//! concurrent history and a sequential model of the data type under test,
//! and it tells you whether some legal interleaving of the concurrent
//! calls would have produced exactly that history.

#[macro_use]
extern crate log;

mod bitset;
mod checker;
mod model;

pub use bitset::Bitset;
pub use checker::{LinearizabilityResult, LinearizationInfo};
pub use model::{Action, Event, Model, Operation};

use std::time::Duration;

/// A `timeout` of zero means "don't bother timing out" rather than "time
/// out immediately" — callers that don't care pass `Duration::default()`,
/// and a same-instant timeout thread racing the search is never useful.
fn normalize_timeout(timeout: Duration) -> Option<Duration> {
    if timeout.as_nanos() == 0 {
        None
    } else {
        Some(timeout)
    }
}

/// `true` iff `history` is linearizable against `model`. Never times out.
pub fn check_operations<S, I, O>(model: &Model<S, I, O>, history: &[Operation<I, O>]) -> bool
where
    S: Clone + Send + Sync,
    I: Clone + Send + Sync,
    O: Clone + Send + Sync,
{
    let (result, _) = checker::check_operations(model, history, false, None);
    result == LinearizabilityResult::Ok
}

/// Same check, but gives up after `timeout` and reports `Unknown` rather
/// than blocking forever on a pathological history. A timed-out check may
/// report `Ok` on a history that is actually illegal, but never the
/// reverse: `Illegal` is always a genuine violation.
pub fn check_operations_timeout<S, I, O>(
    model: &Model<S, I, O>,
    history: &[Operation<I, O>],
    timeout: Duration,
) -> LinearizabilityResult
where
    S: Clone + Send + Sync,
    I: Clone + Send + Sync,
    O: Clone + Send + Sync,
{
    checker::check_operations(model, history, false, normalize_timeout(timeout)).0
}

/// Like [`check_operations_timeout`], but also returns the longest
/// partial linearizations found for each partition, for explaining a
/// failure to a human.
pub fn check_operations_verbose<S, I, O>(
    model: &Model<S, I, O>,
    history: &[Operation<I, O>],
    timeout: Duration,
) -> (LinearizabilityResult, LinearizationInfo)
where
    S: Clone + Send + Sync,
    I: Clone + Send + Sync,
    O: Clone + Send + Sync,
{
    let (result, info) = checker::check_operations(model, history, true, normalize_timeout(timeout));
    (result, info.expect("compute_info was requested"))
}

pub fn check_events<S, I, O>(model: &Model<S, I, O>, history: &[Event<I, O>]) -> bool
where
    S: Clone + Send + Sync,
    I: Clone + Send + Sync,
    O: Clone + Send + Sync,
{
    let (result, _) = checker::check_events(model, history, false, None);
    result == LinearizabilityResult::Ok
}

pub fn check_events_timeout<S, I, O>(
    model: &Model<S, I, O>,
    history: &[Event<I, O>],
    timeout: Duration,
) -> LinearizabilityResult
where
    S: Clone + Send + Sync,
    I: Clone + Send + Sync,
    O: Clone + Send + Sync,
{
    checker::check_events(model, history, false, normalize_timeout(timeout)).0
}

pub fn check_events_verbose<S, I, O>(
    model: &Model<S, I, O>,
    history: &[Event<I, O>],
    timeout: Duration,
) -> (LinearizabilityResult, LinearizationInfo)
where
    S: Clone + Send + Sync,
    I: Clone + Send + Sync,
    O: Clone + Send + Sync,
{
    let (result, info) = checker::check_events(model, history, true, normalize_timeout(timeout));
    (result, info.expect("compute_info was requested"))
}
