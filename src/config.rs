//! Test-harness glue: stands up a cluster of shard owners on a simulated
//! network, hands out clerks wired to it, and records the operation log a
//! scenario test later feeds to the linearizability checker.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use labrpc::Network;

use crate::client::Clerk;
use crate::model::{KvInput, KvOutput};
use crate::server::KvShard;

fn randstring(n: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..n).map(|_| CHARSET[rng.gen_range(0, CHARSET.len())] as char).collect()
}

/// The recorded history of client operations for one scenario run, fed to
/// [`porcupine::check_operations_timeout`] once the scenario is over.
pub struct OpLog {
    start: Instant,
    entries: Mutex<Vec<porcupine::Operation<KvInput, KvOutput>>>,
}

impl OpLog {
    fn new() -> OpLog {
        OpLog { start: Instant::now(), entries: Mutex::new(Vec::new()) }
    }

    /// Nanoseconds since this log (and its `Config`) were created.
    pub fn now(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }

    pub fn record(&self, client_id: usize, input: KvInput, call_time: i64, output: KvOutput, response_time: i64) {
        self.entries.lock().unwrap().push(porcupine::Operation { client_id, input, call_time, output, response_time });
    }

    pub fn operations(&self) -> Vec<porcupine::Operation<KvInput, KvOutput>> {
        self.entries.lock().unwrap().clone()
    }
}

struct Inner {
    net: Network,
    n_servers: usize,
    n_replicas: usize,
    running_servers: HashSet<usize>,
    clerk_endpoints: HashMap<usize, Vec<String>>,
    next_clerk_id: usize,
    ops: usize,
}

impl Inner {
    /// A client endpoint is enabled iff its target server is running and
    /// the client has not been deleted.
    fn connect_clerk_unlocked(&self, endnames: &[String]) {
        for (srv_id, name) in endnames.iter().enumerate() {
            self.net.enable(name, self.running_servers.contains(&srv_id));
        }
    }
}

/// Owns a simulated network, a set of shard owners hosted on it, and every
/// clerk made against it. Mirrors the original test harness's `Config`.
pub struct Config {
    inner: Mutex<Inner>,
    pub log: OpLog,
    timing: Mutex<Option<(Instant, usize)>>,
}

impl Config {
    fn start_cluster(n_servers: usize, n_replicas: usize, unreliable: bool) -> Config {
        let net = Network::new();
        let mut running = HashSet::new();
        for id in 0..n_servers {
            let shard = KvShard::new(id, n_servers);
            net.add_server(id.to_string(), shard.build());
            running.insert(id);
        }
        net.set_reliable(!unreliable);
        Config {
            inner: Mutex::new(Inner {
                net,
                n_servers,
                n_replicas,
                running_servers: running,
                clerk_endpoints: HashMap::new(),
                next_clerk_id: 0,
                ops: 0,
            }),
            log: OpLog::new(),
            timing: Mutex::new(None),
        }
    }

    pub fn make_single_config(unreliable: bool) -> Config {
        Config::start_cluster(1, 1, unreliable)
    }

    pub fn make_shard_config(n_shards: usize, n_replicas: usize, unreliable: bool) -> Config {
        Config::start_cluster(n_shards, n_replicas, unreliable)
    }

    /// Recorded but never consulted by any dispatch path: this core has
    /// one owner per shard and no replication.
    pub fn n_replicas(&self) -> usize {
        self.inner.lock().unwrap().n_replicas
    }

    pub fn n_servers(&self) -> usize {
        self.inner.lock().unwrap().n_servers
    }

    pub fn make_client(&self) -> Clerk {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_clerk_id;
        inner.next_clerk_id += 1;

        let endnames: Vec<String> = (0..inner.n_servers).map(|_| randstring(20)).collect();
        let endpoints = endnames
            .iter()
            .enumerate()
            .map(|(srv_id, name)| {
                let end = inner.net.make_end(name.clone());
                inner.net.connect(name.clone(), srv_id.to_string());
                end
            })
            .collect();

        inner.connect_clerk_unlocked(&endnames);
        inner.clerk_endpoints.insert(id, endnames);
        Clerk::new(id, endpoints)
    }

    /// Like `make_client`, but the clerk is only told about the first
    /// `visible_servers` shards. Used to rig a client that routes every
    /// key through a too-small modulus, so it talks to the wrong shard
    /// for keys outside that range and sees them rejected forever.
    pub fn make_client_limited(&self, visible_servers: usize) -> Clerk {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_clerk_id;
        inner.next_clerk_id += 1;

        let endnames: Vec<String> = (0..visible_servers).map(|_| randstring(20)).collect();
        let endpoints = endnames
            .iter()
            .enumerate()
            .map(|(srv_id, name)| {
                let end = inner.net.make_end(name.clone());
                inner.net.connect(name.clone(), srv_id.to_string());
                end
            })
            .collect();

        inner.connect_clerk_unlocked(&endnames);
        inner.clerk_endpoints.insert(id, endnames);
        Clerk::new(id, endpoints)
    }

    pub fn delete_client(&self, ck: &Clerk) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(endnames) = inner.clerk_endpoints.remove(&ck.id()) {
            for name in &endnames {
                inner.net.delete_end(name);
            }
        }
    }

    pub fn start_server(&self, server_id: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.running_servers.contains(&server_id) {
            return;
        }
        inner.running_servers.insert(server_id);
        info!("config: server {} started", server_id);
        for endnames in inner.clerk_endpoints.clone().values() {
            inner.net.enable(&endnames[server_id], true);
        }
    }

    pub fn stop_server(&self, server_id: usize) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running_servers.contains(&server_id) {
            return;
        }
        inner.running_servers.remove(&server_id);
        info!("config: server {} stopped", server_id);
        for endnames in inner.clerk_endpoints.clone().values() {
            inner.net.enable(&endnames[server_id], false);
        }
    }

    fn rpc_total(&self) -> usize {
        self.inner.lock().unwrap().net.get_total_count()
    }

    /// Marks the start of a named scenario; `end` logs how long it ran
    /// and how much traffic it generated.
    pub fn begin(&self, description: &str) {
        info!("{} ...", description);
        self.inner.lock().unwrap().ops = 0;
        *self.timing.lock().unwrap() = Some((Instant::now(), self.rpc_total()));
    }

    pub fn op(&self) {
        self.inner.lock().unwrap().ops += 1;
    }

    pub fn end(&self) {
        if let Some((started, rpcs0)) = *self.timing.lock().unwrap() {
            let elapsed = started.elapsed();
            let nrpc = self.rpc_total() - rpcs0;
            let ops = self.inner.lock().unwrap().ops;
            info!("... passed -- t {:?} nrpc {} ops {}", elapsed, nrpc, ops);
        }
    }

    pub fn cleanup(&self) {
        self.inner.lock().unwrap().net.cleanup();
    }

    /// Checks the log recorded so far against the KV reference model.
    pub fn check_linearizable(&self, timeout: Duration) -> porcupine::LinearizabilityResult {
        let model = crate::model::kv_model();
        porcupine::check_operations_timeout(&model, &self.log.operations(), timeout)
    }
}
