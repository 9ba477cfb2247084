//! A shard owner: serves `Get`/`Put`/`Append` for whichever keys hash to
//! its shard, rejecting everything else with [`Err::WrongShard`], and
//! deduplicating retried requests from the same client.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex};

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use labrpc::{Server, ServerBuilder, ServiceBuilder};

pub fn shard_of(key: &str, n_shards: usize) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    (hasher.finish() % n_shards as u64) as usize
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Err {
    Ok,
    WrongShard,
}

impl Default for Err {
    fn default() -> Err {
        Err::Ok
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client_id: u64,
    pub seq: u64,
}

impl labcodec::Codable for GetArgs {
    const NAME: &'static str = "GetArgs";
    const FIELDS: &'static [&'static str] = &["Key", "ClientId", "Seq"];
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetReply {
    pub value: String,
    pub err: Err,
}

impl labcodec::Codable for GetReply {
    const NAME: &'static str = "GetReply";
    const FIELDS: &'static [&'static str] = &["Value", "Err"];
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub client_id: u64,
    pub seq: u64,
}

impl labcodec::Codable for PutAppendArgs {
    const NAME: &'static str = "PutAppendArgs";
    const FIELDS: &'static [&'static str] = &["Key", "Value", "ClientId", "Seq"];
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub value: String,
    pub err: Err,
}

impl labcodec::Codable for PutAppendReply {
    const NAME: &'static str = "PutAppendReply";
    const FIELDS: &'static [&'static str] = &["Value", "Err"];
}

enum CachedReply {
    Get(GetReply),
    PutAppend(PutAppendReply),
}

struct DedupEntry {
    seq: u64,
    reply: CachedReply,
}

#[derive(Default)]
struct Inner {
    store: HashMap<String, String>,
    dedup: HashMap<u64, DedupEntry>,
}

/// One shard's in-memory state. `server_id` doubles as the shard index it
/// owns, matching the single-owner-per-shard core described for this
/// service (replication factor is recorded elsewhere but never consulted
/// here).
pub struct KvShard {
    server_id: usize,
    n_shards: usize,
    inner: Mutex<Inner>,
}

impl KvShard {
    pub fn new(server_id: usize, n_shards: usize) -> Arc<KvShard> {
        Arc::new(KvShard {
            server_id,
            n_shards,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn build(self: &Arc<Self>) -> Server {
        let mut svc = ServiceBuilder::new("KVServer");

        let get_shard = self.clone();
        svc.add_method("Get", move |req: &[u8]| {
            let args: GetArgs = labcodec::decode(req).map_err(labrpc::Error::Decode)?;
            let reply = get_shard.get(&args);
            let mut buf = Vec::new();
            labcodec::encode(&reply, &mut buf).map_err(labrpc::Error::Encode)?;
            Ok(buf)
        });

        let put_shard = self.clone();
        svc.add_method("Put", move |req: &[u8]| {
            let args: PutAppendArgs = labcodec::decode(req).map_err(labrpc::Error::Decode)?;
            let reply = put_shard.put(&args);
            let mut buf = Vec::new();
            labcodec::encode(&reply, &mut buf).map_err(labrpc::Error::Encode)?;
            Ok(buf)
        });

        let append_shard = self.clone();
        svc.add_method("Append", move |req: &[u8]| {
            let args: PutAppendArgs = labcodec::decode(req).map_err(labrpc::Error::Decode)?;
            let reply = append_shard.append(&args);
            let mut buf = Vec::new();
            labcodec::encode(&reply, &mut buf).map_err(labrpc::Error::Encode)?;
            Ok(buf)
        });

        let mut builder = ServerBuilder::new(format!("kvserver-{}", self.server_id));
        builder.add_service(svc.build());
        builder.build()
    }

    fn owns(&self, key: &str) -> bool {
        shard_of(key, self.n_shards) == self.server_id
    }

    fn get(&self, args: &GetArgs) -> GetReply {
        if !self.owns(&args.key) {
            debug!("kvshard {}: Get({}) rejected, wrong shard", self.server_id, args.key);
            return GetReply { value: String::new(), err: Err::WrongShard };
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.dedup.get(&args.client_id) {
            if args.seq == entry.seq {
                if let CachedReply::Get(cached) = &entry.reply {
                    debug!("kvshard {}: Get({}) client {} seq {} dedup hit", self.server_id, args.key, args.client_id, args.seq);
                    return cached.clone();
                }
            } else if args.seq < entry.seq {
                debug!("kvshard {}: Get({}) client {} seq {} is stale", self.server_id, args.key, args.client_id, args.seq);
                let value = inner.store.get(&args.key).cloned().unwrap_or_default();
                return GetReply { value, err: Err::Ok };
            }
        }
        let value = inner.store.get(&args.key).cloned().unwrap_or_default();
        debug!("kvshard {}: Get({}) client {} seq {} fresh apply", self.server_id, args.key, args.client_id, args.seq);
        let reply = GetReply { value, err: Err::Ok };
        inner.dedup.insert(args.client_id, DedupEntry { seq: args.seq, reply: CachedReply::Get(reply.clone()) });
        reply
    }

    fn put(&self, args: &PutAppendArgs) -> PutAppendReply {
        if !self.owns(&args.key) {
            debug!("kvshard {}: Put({}) rejected, wrong shard", self.server_id, args.key);
            return PutAppendReply { value: String::new(), err: Err::WrongShard };
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.dedup.get(&args.client_id) {
            if args.seq == entry.seq {
                if let CachedReply::PutAppend(cached) = &entry.reply {
                    debug!("kvshard {}: Put({}) client {} seq {} dedup hit", self.server_id, args.key, args.client_id, args.seq);
                    return cached.clone();
                }
            } else if args.seq < entry.seq {
                debug!("kvshard {}: Put({}) client {} seq {} is stale", self.server_id, args.key, args.client_id, args.seq);
                return PutAppendReply { value: String::new(), err: Err::Ok };
            }
        }
        inner.store.insert(args.key.clone(), args.value.clone());
        debug!("kvshard {}: Put({}) client {} seq {} fresh apply", self.server_id, args.key, args.client_id, args.seq);
        let reply = PutAppendReply { value: String::new(), err: Err::Ok };
        inner.dedup.insert(args.client_id, DedupEntry { seq: args.seq, reply: CachedReply::PutAppend(reply.clone()) });
        reply
    }

    fn append(&self, args: &PutAppendArgs) -> PutAppendReply {
        if !self.owns(&args.key) {
            debug!("kvshard {}: Append({}) rejected, wrong shard", self.server_id, args.key);
            return PutAppendReply { value: String::new(), err: Err::WrongShard };
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.dedup.get(&args.client_id) {
            if args.seq == entry.seq {
                if let CachedReply::PutAppend(cached) = &entry.reply {
                    debug!("kvshard {}: Append({}) client {} seq {} dedup hit", self.server_id, args.key, args.client_id, args.seq);
                    return cached.clone();
                }
            } else if args.seq < entry.seq {
                debug!("kvshard {}: Append({}) client {} seq {} is stale", self.server_id, args.key, args.client_id, args.seq);
                let prev = inner.store.get(&args.key).cloned().unwrap_or_default();
                return PutAppendReply { value: prev, err: Err::Ok };
            }
        }
        let prev = inner.store.get(&args.key).cloned().unwrap_or_default();
        inner.store.insert(args.key.clone(), format!("{}{}", prev, args.value));
        debug!("kvshard {}: Append({}) client {} seq {} fresh apply", self.server_id, args.key, args.client_id, args.seq);
        let reply = PutAppendReply { value: prev, err: Err::Ok };
        inner.dedup.insert(args.client_id, DedupEntry { seq: args.seq, reply: CachedReply::PutAppend(reply.clone()) });
        reply
    }
}
