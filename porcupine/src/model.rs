//! The pluggable description of a sequential data type: how to partition a
//! history, what its initial state is, and whether a given state can take a
//! given call/return step.

/// Either the call half or the return half of one logical operation,
/// tagged with which one it is.
#[derive(Clone, Debug)]
pub enum Action<I, O> {
    Call(I),
    Return(O),
}

/// One complete client operation: a call and its matching return, each with
/// a timestamp. Timestamps only need to be consistently ordered, not drawn
/// from any particular clock.
#[derive(Clone, Debug)]
pub struct Operation<I, O> {
    pub client_id: usize,
    pub input: I,
    pub call_time: i64,
    pub output: O,
    pub response_time: i64,
}

/// One half of an operation in event order, for histories recorded as an
/// interleaved call/return log rather than as timestamped operations.
#[derive(Clone, Debug)]
pub struct Event<I, O> {
    pub client_id: usize,
    pub event_id: usize,
    pub action: Action<I, O>,
}

pub fn no_partition<I, O>(history: &[Operation<I, O>]) -> Vec<Vec<Operation<I, O>>>
where
    I: Clone,
    O: Clone,
{
    vec![history.to_vec()]
}

pub fn no_partition_event<I, O>(history: &[Event<I, O>]) -> Vec<Vec<Event<I, O>>>
where
    I: Clone,
    O: Clone,
{
    vec![history.to_vec()]
}

/// A sequential specification for some data type: how it starts, and which
/// call/return pairs are legal from a given state.
pub struct Model<S, I, O> {
    pub(crate) partition: Box<dyn Fn(&[Operation<I, O>]) -> Vec<Vec<Operation<I, O>>> + Send + Sync>,
    pub(crate) partition_event: Box<dyn Fn(&[Event<I, O>]) -> Vec<Vec<Event<I, O>>> + Send + Sync>,
    pub(crate) init: Box<dyn Fn() -> S + Send + Sync>,
    pub(crate) step: Box<dyn Fn(&S, &I, &O) -> (bool, S) + Send + Sync>,
    pub(crate) equal: Box<dyn Fn(&S, &S) -> bool + Send + Sync>,
    pub(crate) describe_operation: Box<dyn Fn(&I, &O) -> String + Send + Sync>,
}

impl<S, I, O> Model<S, I, O>
where
    S: 'static,
    I: Clone + 'static,
    O: Clone + 'static,
{
    /// Builds a model from its two mandatory pieces: an initial state and a
    /// step function. Every other hook defaults to treating the whole
    /// history as one partition and states as plain `PartialEq` values.
    pub fn new<Init, Step>(init: Init, step: Step) -> Model<S, I, O>
    where
        Init: Fn() -> S + Send + Sync + 'static,
        Step: Fn(&S, &I, &O) -> (bool, S) + Send + Sync + 'static,
        S: PartialEq,
    {
        Model {
            partition: Box::new(no_partition),
            partition_event: Box::new(no_partition_event),
            init: Box::new(init),
            step: Box::new(step),
            equal: Box::new(|a: &S, b: &S| a == b),
            describe_operation: Box::new(|_, _| "<operation>".to_owned()),
        }
    }

    pub fn with_partition<F>(mut self, partition: F) -> Self
    where
        F: Fn(&[Operation<I, O>]) -> Vec<Vec<Operation<I, O>>> + Send + Sync + 'static,
    {
        self.partition = Box::new(partition);
        self
    }

    pub fn with_describe_operation<F>(mut self, describe: F) -> Self
    where
        F: Fn(&I, &O) -> String + Send + Sync + 'static,
    {
        self.describe_operation = Box::new(describe);
        self
    }

    pub fn with_equal<F>(mut self, equal: F) -> Self
    where
        F: Fn(&S, &S) -> bool + Send + Sync + 'static,
    {
        self.equal = Box::new(equal);
        self
    }
}
