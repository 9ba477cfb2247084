//! The clerk: the only thing application code talks to. It hides shard
//! routing, retries, and request-id bookkeeping behind three calls that
//! never fail visibly — they just keep retrying until they succeed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;

use labrpc::ClientEnd;

use crate::error::{Error, Result};
use crate::server::{shard_of, Err, GetArgs, GetReply, PutAppendArgs, PutAppendReply};

/// A client session. Not safe to share across concurrent callers — each
/// clerk assumes it is the only caller assigning its `seq` counter.
pub struct Clerk {
    id: usize,
    client_id: u64,
    seq: AtomicU64,
    endpoints: Vec<ClientEnd>,
}

impl Clerk {
    pub(crate) fn new(id: usize, endpoints: Vec<ClientEnd>) -> Clerk {
        let client_id = rand::thread_rng().gen_range(0u64, 1u64 << 62);
        Clerk { id, client_id, seq: AtomicU64::new(0), endpoints }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    fn n_shards(&self) -> usize {
        self.endpoints.len()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns `""` if the key does not exist. Retries forever in the
    /// face of transport failure or a wrong-shard rejection.
    pub fn get(&self, key: &str) -> String {
        let seq = self.next_seq();
        let shard = shard_of(key, self.n_shards());
        let args = GetArgs { key: key.to_owned(), client_id: self.client_id, seq };
        loop {
            match self.call_get(shard, &args) {
                Ok(value) => return value,
                Err(Error::WrongShard) => backoff(),
                Err(Error::Rpc(_)) => {}
            }
        }
    }

    fn call_get(&self, shard: usize, args: &GetArgs) -> Result<String> {
        let reply: GetReply = self.endpoints[shard].call("KVServer.Get", args)?;
        match reply.err {
            Err::Ok => Ok(reply.value),
            Err::WrongShard => Err(Error::WrongShard),
        }
    }

    pub fn put(&self, key: &str, value: &str) {
        self.put_append(key, value, "KVServer.Put");
    }

    /// Appends `value` to `key` and returns the value from just before
    /// the append.
    pub fn append(&self, key: &str, value: &str) -> String {
        self.put_append(key, value, "KVServer.Append")
    }

    fn put_append(&self, key: &str, value: &str, method: &'static str) -> String {
        let seq = self.next_seq();
        let shard = shard_of(key, self.n_shards());
        let args = PutAppendArgs {
            key: key.to_owned(),
            value: value.to_owned(),
            client_id: self.client_id,
            seq,
        };
        loop {
            match self.call_put_append(shard, method, &args) {
                Ok(value) => return value,
                Err(Error::WrongShard) => backoff(),
                Err(Error::Rpc(_)) => {}
            }
        }
    }

    fn call_put_append(&self, shard: usize, method: &'static str, args: &PutAppendArgs) -> Result<String> {
        let reply: PutAppendReply = self.endpoints[shard].call(method, args)?;
        match reply.err {
            Err::Ok => Ok(reply.value),
            Err::WrongShard => Err(Error::WrongShard),
        }
    }
}

/// A small jittered pause before retrying a wrong-shard rejection, so a
/// misrouted client doesn't hammer the wrong server in a tight loop.
fn backoff() {
    let ms = rand::thread_rng().gen_range(0, 100);
    std::thread::sleep(Duration::from_millis(ms));
}
