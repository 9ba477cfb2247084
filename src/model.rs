//! The sequential specification of a single key's value, plugged into
//! [`porcupine`] to check recorded client histories for linearizability.

use std::collections::BTreeMap;

use porcupine::{Model, Operation};

/// `op` discriminant mirrors the reference harness: `Append` (no return
/// value checked) exists so this model stays a faithful, reusable port on
/// its own, even though this crate's own clerk only ever logs appends as
/// `AppendWithReturn`.
#[derive(Clone, Debug, PartialEq)]
pub enum KvOp {
    Get,
    Put,
    Append,
    AppendWithReturn,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KvInput {
    pub op: KvOp,
    pub key: String,
    pub value: String,
}

impl KvInput {
    pub fn get(key: impl Into<String>) -> KvInput {
        KvInput { op: KvOp::Get, key: key.into(), value: String::new() }
    }

    pub fn put(key: impl Into<String>, value: impl Into<String>) -> KvInput {
        KvInput { op: KvOp::Put, key: key.into(), value: value.into() }
    }

    pub fn append(key: impl Into<String>, value: impl Into<String>) -> KvInput {
        KvInput { op: KvOp::AppendWithReturn, key: key.into(), value: value.into() }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct KvOutput {
    pub value: String,
}

/// Builds the reference model: a single string-valued register per key,
/// `Get` returning the current value, `Put` replacing it, and `Append`
/// returning the value from before the append.
pub fn kv_model() -> Model<String, KvInput, KvOutput> {
    Model::new(String::new, step).with_partition(partition_by_key).with_describe_operation(describe_operation)
}

fn step(state: &String, input: &KvInput, output: &KvOutput) -> (bool, String) {
    match input.op {
        KvOp::Get => (output.value == *state, state.clone()),
        KvOp::Put => (true, input.value.clone()),
        KvOp::Append => (true, format!("{}{}", state, input.value)),
        KvOp::AppendWithReturn => (output.value == *state, format!("{}{}", state, input.value)),
    }
}

fn partition_by_key(history: &[Operation<KvInput, KvOutput>]) -> Vec<Vec<Operation<KvInput, KvOutput>>> {
    let mut buckets: BTreeMap<String, Vec<Operation<KvInput, KvOutput>>> = BTreeMap::new();
    for op in history {
        buckets.entry(op.input.key.clone()).or_insert_with(Vec::new).push(op.clone());
    }
    buckets.into_iter().map(|(_, ops)| ops).collect()
}

fn describe_operation(input: &KvInput, output: &KvOutput) -> String {
    match input.op {
        KvOp::Get => format!("get('{}') -> '{}'", input.key, output.value),
        KvOp::Put => format!("put('{}', '{}')", input.key, input.value),
        KvOp::Append | KvOp::AppendWithReturn => format!("append('{}', '{}')", input.key, input.value),
    }
}
