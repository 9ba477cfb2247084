//! A sharded, replicated-in-name-only key/value store built on a
//! simulated, fault-injecting RPC fabric ([`labrpc`]), with a
//! Wing & Gong linearizability checker ([`porcupine`]) available to
//! verify recorded client histories.

#[macro_use]
extern crate log;

mod client;
mod config;
mod error;
mod model;
mod server;

pub use client::Clerk;
pub use config::{Config, OpLog};
pub use error::{Error, Result};
pub use model::{kv_model, KvInput, KvOp, KvOutput};
pub use server::{shard_of, Err, GetArgs, GetReply, KvShard, PutAppendArgs, PutAppendReply};
