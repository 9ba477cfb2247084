//! The Wing & Gong linearizability check itself: build a doubly-linked list
//! of call/return entries, and depth-first search for an order in which
//! every call can legally take its step before its return is reached.
//!
//! A successful step lifts the call (and its return) out of the list and
//! recurses; a dead end pops the most recent lift back in (`unlift`) and
//! tries the next candidate. A cache of already-explored `(linearized set,
//! resulting state)` pairs prunes the search, the same way memoization
//! prunes Wing & Gong's original algorithm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bitset::Bitset;
use crate::model::{Action, Event, Model, Operation};

#[derive(Clone, Debug)]
struct Entry<I, O> {
    id: usize,
    time: i64,
    client_id: usize,
    action: Action<I, O>,
}

impl<I, O> Entry<I, O> {
    fn is_return(&self) -> bool {
        match self.action {
            Action::Return(_) => true,
            Action::Call(_) => false,
        }
    }
}

fn make_entries<I, O>(history: &[Operation<I, O>]) -> Vec<Entry<I, O>>
where
    I: Clone,
    O: Clone,
{
    let mut entries = Vec::with_capacity(history.len() * 2);
    for (id, op) in history.iter().enumerate() {
        entries.push(Entry {
            id,
            time: op.call_time,
            client_id: op.client_id,
            action: Action::Call(op.input.clone()),
        });
        entries.push(Entry {
            id,
            time: op.response_time,
            client_id: op.client_id,
            action: Action::Return(op.output.clone()),
        });
    }
    entries.sort_by_key(|e| (e.time, e.is_return()));
    entries
}

/// Compresses a partition's event ids to a contiguous `0..k` range while
/// keeping each call's id paired with its return's id.
fn renumber<I, O>(events: &[Event<I, O>]) -> Vec<Event<I, O>>
where
    I: Clone,
    O: Clone,
{
    let mut out = Vec::with_capacity(events.len());
    let mut seen = HashMap::new();
    let mut next_id = 0;
    for ev in events {
        let new_id = *seen.entry(ev.event_id).or_insert_with(|| {
            let id = next_id;
            next_id += 1;
            id
        });
        out.push(Event {
            client_id: ev.client_id,
            event_id: new_id,
            action: ev.action.clone(),
        });
    }
    out
}

fn convert_entries<I, O>(events: &[Event<I, O>]) -> Vec<Entry<I, O>>
where
    I: Clone,
    O: Clone,
{
    events
        .iter()
        .enumerate()
        .map(|(i, ev)| Entry {
            id: ev.event_id,
            time: i as i64,
            client_id: ev.client_id,
            action: ev.action.clone(),
        })
        .collect()
}

/// Arena of linked-list nodes, indexed by position rather than by pointer
/// so the splice operations (`lift`/`unlift`) stay entirely safe.
struct Arena<I, O> {
    value: Vec<Option<Action<I, O>>>,
    matches: Vec<Option<usize>>,
    entry_id: Vec<usize>,
    next: Vec<Option<usize>>,
    prev: Vec<Option<usize>>,
}

impl<I, O> Arena<I, O> {
    fn with_capacity(cap: usize) -> Self {
        Arena {
            value: Vec::with_capacity(cap),
            matches: Vec::with_capacity(cap),
            entry_id: Vec::with_capacity(cap),
            next: Vec::with_capacity(cap),
            prev: Vec::with_capacity(cap),
        }
    }

    fn push(&mut self, value: Option<Action<I, O>>, matches: Option<usize>, entry_id: usize) -> usize {
        let idx = self.value.len();
        self.value.push(value);
        self.matches.push(matches);
        self.entry_id.push(entry_id);
        self.next.push(None);
        self.prev.push(None);
        idx
    }

    fn insert_before(&mut self, n: usize, mark: Option<usize>) -> usize {
        if let Some(mark_idx) = mark {
            let before_mark = self.prev[mark_idx];
            self.prev[mark_idx] = Some(n);
            self.next[n] = Some(mark_idx);
            if let Some(bm) = before_mark {
                self.prev[n] = Some(bm);
                self.next[bm] = Some(n);
            }
        }
        n
    }

    fn lift(&mut self, entry: usize) {
        let p = self.prev[entry].expect("lifted entry has a predecessor");
        let n = self.next[entry];
        self.next[p] = n;
        if let Some(n) = n {
            self.prev[n] = Some(p);
        }
        let m = self.matches[entry].expect("call entry has a matching return");
        let mp = self.prev[m].expect("matching return has a predecessor");
        let mn = self.next[m];
        self.next[mp] = mn;
        if let Some(mn) = mn {
            self.prev[mn] = Some(mp);
        }
    }

    fn unlift(&mut self, entry: usize) {
        let m = self.matches[entry].expect("call entry has a matching return");
        let mp = self.prev[m].expect("matching return kept its predecessor link");
        let mn = self.next[m];
        self.next[mp] = Some(m);
        if let Some(mn) = mn {
            self.prev[mn] = Some(m);
        }
        let p = self.prev[entry].expect("entry kept its predecessor link");
        let n = self.next[entry];
        self.next[p] = Some(entry);
        if let Some(n) = n {
            self.prev[n] = Some(entry);
        }
    }
}

fn make_linked_entries<I, O>(entries: &[Entry<I, O>]) -> (Arena<I, O>, Option<usize>)
where
    I: Clone,
    O: Clone,
{
    let mut arena = Arena::with_capacity(entries.len());
    let mut root: Option<usize> = None;
    let mut match_of: HashMap<usize, usize> = HashMap::new();
    for entry in entries.iter().rev() {
        let idx = match &entry.action {
            Action::Return(v) => {
                let idx = arena.push(Some(Action::Return(v.clone())), None, entry.id);
                match_of.insert(entry.id, idx);
                idx
            }
            Action::Call(v) => {
                let match_idx = *match_of
                    .get(&entry.id)
                    .expect("every call has an earlier-seen return in the reversed scan");
                arena.push(Some(Action::Call(v.clone())), Some(match_idx), entry.id)
            }
        };
        root = Some(arena.insert_before(idx, root));
    }
    (arena, root)
}

struct CacheEntry<S> {
    linearized: Bitset,
    state: S,
}

fn cache_contains<S, I, O>(
    model: &Model<S, I, O>,
    cache: &HashMap<u64, Vec<CacheEntry<S>>>,
    entry: &CacheEntry<S>,
) -> bool {
    cache
        .get(&entry.linearized.hash())
        .map_or(false, |bucket| {
            bucket
                .iter()
                .any(|e| entry.linearized == e.linearized && (model.equal)(&entry.state, &e.state))
        })
}

struct CallsEntry<S> {
    entry: usize,
    state: S,
}

/// Runs the backtracking search for one partition of the history.
///
/// Returns `Some(true)`/`Some(false)` when the search actually ran to
/// completion (linearizable or not), and `None` when `kill` fired before
/// it could finish — a killed search must never be reported as `false`,
/// since that would turn "we ran out of time" into a false "illegal".
/// Also returns, for each original call index, the longest linearizable
/// prefix found that includes it (used to explain a failure to a human).
fn check_single<S, I, O>(
    model: &Model<S, I, O>,
    history: &[Entry<I, O>],
    compute_partial: bool,
    kill: &AtomicBool,
) -> (Option<bool>, Vec<Option<Vec<usize>>>)
where
    S: Clone,
    I: Clone,
    O: Clone,
{
    let n = history.len() / 2;
    let (mut arena, root) = make_linked_entries(history);
    let mut linearized = Bitset::new(n);
    let mut cache: HashMap<u64, Vec<CacheEntry<S>>> = HashMap::new();
    let mut calls: Vec<CallsEntry<S>> = Vec::new();
    let mut longest: Vec<Option<Vec<usize>>> = vec![None; n];

    let mut state = (model.init)();
    let head = arena.push(None, None, usize::MAX);
    arena.insert_before(head, root);
    let mut entry = root;

    loop {
        if arena.next[head].is_none() {
            break;
        }
        if kill.load(Ordering::SeqCst) {
            return (None, longest);
        }
        let e = entry.expect("a non-exhausted list always has a current entry");
        if let Some(match_idx) = arena.matches[e] {
            let (ok, new_state) = {
                let input = match arena.value[e].as_ref().unwrap() {
                    Action::Call(v) => v,
                    Action::Return(_) => unreachable!("call node always holds a call value"),
                };
                let output = match arena.value[match_idx].as_ref().unwrap() {
                    Action::Return(v) => v,
                    Action::Call(_) => unreachable!("return node always holds a return value"),
                };
                (model.step)(&state, input, output)
            };
            if ok {
                let id = arena.entry_id[e];
                let mut new_linearized = linearized.clone();
                new_linearized.set(id);
                let new_cache_entry = CacheEntry {
                    linearized: new_linearized,
                    state: new_state.clone(),
                };
                if !cache_contains(model, &cache, &new_cache_entry) {
                    let hash = new_cache_entry.linearized.hash();
                    cache.entry(hash).or_insert_with(Vec::new).push(new_cache_entry);
                    calls.push(CallsEntry { entry: e, state: state.clone() });
                    state = new_state;
                    linearized.set(id);
                    arena.lift(e);
                    entry = arena.next[head];
                } else {
                    entry = arena.next[e];
                }
            } else {
                entry = arena.next[e];
            }
        } else {
            if calls.is_empty() {
                return (Some(false), longest);
            }
            if compute_partial {
                let calls_len = calls.len();
                let mut seq: Option<Vec<usize>> = None;
                for v in &calls {
                    let id = arena.entry_id[v.entry];
                    let is_longer = longest[id].as_ref().map_or(true, |l| calls_len > l.len());
                    if is_longer {
                        if seq.is_none() {
                            seq = Some(calls.iter().map(|v| arena.entry_id[v.entry]).collect());
                        }
                        longest[id] = seq.clone();
                    }
                }
            }
            let top = calls.pop().unwrap();
            let id = arena.entry_id[top.entry];
            state = top.state;
            linearized.clear(id);
            arena.unlift(top.entry);
            entry = arena.next[top.entry];
        }
    }

    let seq: Vec<usize> = calls.iter().map(|v| arena.entry_id[v.entry]).collect();
    for slot in longest.iter_mut() {
        *slot = Some(seq.clone());
    }
    (Some(true), longest)
}

/// The three-valued outcome of a check: `Unknown` only appears when a
/// timeout cut the search short, meaning a false "linearizable" is
/// possible but a reported violation is always real.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinearizabilityResult {
    Ok,
    Illegal,
    Unknown,
}

/// The longest partial linearizations the checker found for each
/// partition, useful for pointing a human at why a history failed.
pub struct LinearizationInfo {
    pub partitions: usize,
    pub partial_linearizations: Vec<Vec<Vec<usize>>>,
}

fn check_parallel<S, I, O>(
    model: &Model<S, I, O>,
    history: Vec<Vec<Entry<I, O>>>,
    compute_info: bool,
    timeout: Option<Duration>,
) -> (LinearizabilityResult, Option<LinearizationInfo>)
where
    S: Clone + Send + Sync,
    I: Clone + Send + Sync,
    O: Clone + Send + Sync,
{
    let kill = Arc::new(AtomicBool::new(false));
    debug!(
        "porcupine: checking {} partition(s), timeout {:?}",
        history.len(),
        timeout
    );

    // `Some(false)` from any partition is a genuine violation and wins
    // outright. `None` (interrupted by `kill` before finishing) only
    // downgrades the result to `Unknown`, and only if no partition ever
    // came back with a genuine violation — a slow-but-legal history must
    // never be reported as `Illegal` just because the clock ran out.
    let mut found_illegal = false;
    let mut was_interrupted = false;
    let mut longest: Vec<Vec<Option<Vec<usize>>>> = Vec::with_capacity(history.len());

    crossbeam::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(history.len());
        for subhistory in &history {
            let kill = kill.clone();
            handles.push(scope.spawn(move |_| check_single(model, subhistory, compute_info, &kill)));
        }

        if let Some(timeout) = timeout {
            let kill = kill.clone();
            scope.spawn(move |_| {
                std::thread::sleep(timeout);
                kill.store(true, Ordering::SeqCst);
            });
        }

        for handle in handles {
            let (ok, sub_longest) = handle.join().expect("checker worker thread panicked");
            match ok {
                Some(false) => found_illegal = true,
                Some(true) => {}
                None => was_interrupted = true,
            }
            longest.push(sub_longest);
        }
    })
    .expect("checker scope panicked");

    if was_interrupted && !found_illegal {
        debug!("porcupine: check killed by timeout before reaching a verdict");
    }

    let info = if compute_info {
        let partial_linearizations = longest
            .into_iter()
            .map(|sub_longest| {
                let mut seen = std::collections::HashSet::new();
                sub_longest
                    .into_iter()
                    .flatten()
                    .filter(|seq| seen.insert(seq.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        Some(LinearizationInfo {
            partitions: history.len(),
            partial_linearizations,
        })
    } else {
        None
    };

    let result = if found_illegal {
        LinearizabilityResult::Illegal
    } else if was_interrupted {
        LinearizabilityResult::Unknown
    } else {
        LinearizabilityResult::Ok
    };

    (result, info)
}

pub fn check_operations<S, I, O>(
    model: &Model<S, I, O>,
    history: &[Operation<I, O>],
    compute_info: bool,
    timeout: Option<Duration>,
) -> (LinearizabilityResult, Option<LinearizationInfo>)
where
    S: Clone + Send + Sync,
    I: Clone + Send + Sync,
    O: Clone + Send + Sync,
{
    let partitions = (model.partition)(history);
    let entries = partitions.iter().map(|p| make_entries(p)).collect();
    check_parallel(model, entries, compute_info, timeout)
}

pub fn check_events<S, I, O>(
    model: &Model<S, I, O>,
    history: &[Event<I, O>],
    compute_info: bool,
    timeout: Option<Duration>,
) -> (LinearizabilityResult, Option<LinearizationInfo>)
where
    S: Clone + Send + Sync,
    I: Clone + Send + Sync,
    O: Clone + Send + Sync,
{
    let partitions = (model.partition_event)(history);
    let entries = partitions
        .iter()
        .map(|p| convert_entries(&renumber(p)))
        .collect();
    check_parallel(model, entries, compute_info, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;

    /// A trivial register model: put(v) sets it, get() must return the
    /// current value.
    #[derive(Clone, Debug, PartialEq)]
    enum Input {
        Put(i64),
        Get,
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Output(i64);

    fn register_model() -> Model<i64, Input, Output> {
        Model::new(
            || 0i64,
            |state: &i64, input: &Input, output: &Output| match input {
                Input::Put(v) => (true, *v),
                Input::Get => (output.0 == *state, *state),
            },
        )
    }

    #[test]
    fn sequential_history_is_linearizable() {
        let model = register_model();
        let history = vec![
            Operation { client_id: 0, input: Input::Put(1), call_time: 0, output: Output(0), response_time: 1 },
            Operation { client_id: 0, input: Input::Get, call_time: 2, output: Output(1), response_time: 3 },
        ];
        let (result, _) = check_operations(&model, &history, false, None);
        assert_eq!(result, LinearizabilityResult::Ok);
    }

    #[test]
    fn stale_read_is_not_linearizable() {
        let model = register_model();
        let history = vec![
            Operation { client_id: 0, input: Input::Put(1), call_time: 0, output: Output(0), response_time: 1 },
            Operation { client_id: 1, input: Input::Get, call_time: 2, output: Output(0), response_time: 3 },
        ];
        let (result, _) = check_operations(&model, &history, false, None);
        assert_eq!(result, LinearizabilityResult::Illegal);
    }

    #[test]
    fn overlapping_operations_can_linearize_either_order() {
        let model = register_model();
        // put(1) and get() overlap; get() returning 1 is one legal order.
        let history = vec![
            Operation { client_id: 0, input: Input::Put(1), call_time: 0, output: Output(0), response_time: 5 },
            Operation { client_id: 1, input: Input::Get, call_time: 1, output: Output(1), response_time: 2 },
        ];
        let (result, _) = check_operations(&model, &history, false, None);
        assert_eq!(result, LinearizabilityResult::Ok);
    }
}
