//! A deterministic, controllably-unreliable in-process RPC fabric.
//!
//! Clients talk to servers through [`ClientEnd`]s that are wired up with
//! [`Network::connect`]; the network itself can drop, delay, or reorder
//! replies to exercise retry logic the way a flaky real network would.
//! Nothing here ever touches a socket — everything is channels and threads
//! inside one process, which is what makes the failure injection
//! deterministic enough to build a test suite on top of.

#[macro_use]
extern crate log;

mod error;
mod server;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Future;
use futures_cpupool::CpuPool;
use futures_timer::Delay;
use hashbrown::HashMap;
use rand::Rng;

pub use error::{Error, Result};
pub use server::{Server, ServerBuilder, Service, ServiceBuilder};

/// How often a dispatch worker checks whether the server it's waiting on
/// has been disabled or replaced out from under it.
const SERVER_DEAD_POLL: Duration = Duration::from_millis(100);

/// A single in-flight RPC, from the caller's enqueue to the one reply it
/// will ever receive.
struct Rpc {
    end_name: String,
    fq_name: &'static str,
    req: Vec<u8>,
    resp: SyncSender<Result<Vec<u8>>>,
}

/// The caller's handle to a named endpoint on the network.
///
/// Each `ClientEnd` is wired to at most one server via [`Network::connect`];
/// calling it before it's connected, before it's enabled, or after the
/// destination server has been removed all fail the same way a dead
/// connection would.
#[derive(Clone)]
pub struct ClientEnd {
    end_name: String,
    sender: Sender<Rpc>,
    stopped: Arc<AtomicBool>,
}

impl ClientEnd {
    pub fn name(&self) -> &str {
        &self.end_name
    }

    /// Encodes `req`, sends it, and blocks for the matching reply.
    ///
    /// Returns `Err` for every transport-level failure (drop, disabled
    /// endpoint, dead server, or a network that's been torn down) — the
    /// caller cannot distinguish these from one another, by design.
    pub fn call<Req, Rsp>(&self, fq_name: &'static str, req: &Req) -> Result<Rsp>
    where
        Req: labcodec::Codable + serde::Serialize,
        Rsp: labcodec::Codable + serde::de::DeserializeOwned + Default + PartialEq,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }

        let mut buf = Vec::new();
        labcodec::encode(req, &mut buf).map_err(Error::Encode)?;

        let (tx, rx) = sync_channel(1);
        let rpc = Rpc {
            end_name: self.end_name.clone(),
            fq_name,
            req: buf,
            resp: tx,
        };

        self.sender.send(rpc).map_err(|_| Error::Stopped)?;
        match rx.recv() {
            Ok(Ok(reply)) => labcodec::decode(&reply).map_err(Error::Decode),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::Recv(e)),
        }
    }
}

struct EndInfo {
    enabled: bool,
    reliable: bool,
    long_reordering: bool,
    long_delays: bool,
    server_id: Option<String>,
    server: Option<Server>,
}

struct Endpoints {
    enabled: HashMap<String, bool>,
    servers: HashMap<String, Option<Server>>,
    connections: HashMap<String, Option<String>>,
}

struct Core {
    reliable: AtomicBool,
    long_delays: AtomicBool,
    long_reordering: AtomicBool,
    endpoints: Mutex<Endpoints>,
    total_count: AtomicUsize,
    total_bytes: AtomicUsize,
    sender: Sender<Rpc>,
    pool: CpuPool,
    stopped: Arc<AtomicBool>,
}

/// The simulated network. Cheap to clone; every clone shares the same
/// underlying state.
#[derive(Clone)]
pub struct Network {
    core: Arc<Core>,
}

impl Default for Network {
    fn default() -> Self {
        Network::new()
    }
}

impl Network {
    pub fn new() -> Network {
        let (sender, incoming) = std::sync::mpsc::channel();
        let net = Network {
            core: Arc::new(Core {
                reliable: AtomicBool::new(true),
                long_delays: AtomicBool::new(false),
                long_reordering: AtomicBool::new(false),
                endpoints: Mutex::new(Endpoints {
                    enabled: HashMap::new(),
                    servers: HashMap::new(),
                    connections: HashMap::new(),
                }),
                total_count: AtomicUsize::new(0),
                total_bytes: AtomicUsize::new(0),
                pool: CpuPool::new_num_cpus(),
                sender,
                stopped: Arc::new(AtomicBool::new(false)),
            }),
        };
        net.start(incoming);
        net
    }

    /// Spawns the single central dispatcher thread. It drains `incoming`
    /// and hands each request to a pool worker; the worker does every
    /// potentially slow step (delay, dispatch, reordering) so the
    /// dispatcher itself never blocks on one request.
    fn start(&self, incoming: Receiver<Rpc>) {
        let net = self.clone();
        std::thread::spawn(move || loop {
            if net.core.stopped.load(Ordering::SeqCst) {
                break;
            }
            match incoming.recv_timeout(SERVER_DEAD_POLL) {
                Ok(rpc) => {
                    net.core.total_count.fetch_add(1, Ordering::SeqCst);
                    net.core
                        .total_bytes
                        .fetch_add(rpc.req.len(), Ordering::SeqCst);
                    let net = net.clone();
                    let pool = net.core.pool.clone();
                    pool.spawn_fn(move || {
                        net.process_rpc(rpc);
                        futures::finished::<(), ()>(())
                    })
                    .forget();
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });
    }

    /// Tears the network down: the dispatcher thread exits and every
    /// subsequent `ClientEnd::call` fails immediately with `Stopped`.
    pub fn cleanup(&self) {
        self.core.stopped.store(true, Ordering::SeqCst);
    }

    pub fn make_end(&self, name: impl Into<String>) -> ClientEnd {
        let name = name.into();
        let mut eps = self.core.endpoints.lock().unwrap();
        if eps.enabled.contains_key(&name) {
            panic!("labrpc: make_end: {} already exists", name);
        }
        eps.enabled.insert(name.clone(), false);
        eps.connections.insert(name.clone(), None);
        ClientEnd {
            end_name: name,
            sender: self.core.sender.clone(),
            stopped: self.core.stopped.clone(),
        }
    }

    /// Removes an endpoint. Idempotent: deleting an endpoint that doesn't
    /// exist (or was already deleted) is not an error.
    pub fn delete_end(&self, name: &str) {
        let mut eps = self.core.endpoints.lock().unwrap();
        eps.enabled.remove(name);
        eps.connections.remove(name);
    }

    pub fn add_server(&self, id: impl Into<String>, server: Server) {
        let mut eps = self.core.endpoints.lock().unwrap();
        eps.servers.insert(id.into(), Some(server));
    }

    /// Replaces the server at `id` with "no server". Any call that was
    /// mid-dispatch against the old instance will observe `is_server_dead`
    /// go true and fail rather than deliver a reply.
    pub fn delete_server(&self, id: &str) {
        let mut eps = self.core.endpoints.lock().unwrap();
        eps.servers.insert(id.to_owned(), None);
    }

    pub fn connect(&self, end_name: impl Into<String>, server_id: impl Into<String>) {
        let mut eps = self.core.endpoints.lock().unwrap();
        eps.connections.insert(end_name.into(), Some(server_id.into()));
    }

    pub fn enable(&self, end_name: &str, enabled: bool) {
        debug!(
            "labrpc: {} is now {}",
            end_name,
            if enabled { "enabled" } else { "disabled" }
        );
        let mut eps = self.core.endpoints.lock().unwrap();
        eps.enabled.insert(end_name.to_owned(), enabled);
    }

    pub fn set_reliable(&self, yes: bool) {
        self.core.reliable.store(yes, Ordering::SeqCst);
    }

    pub fn set_long_reordering(&self, yes: bool) {
        self.core.long_reordering.store(yes, Ordering::SeqCst);
    }

    pub fn set_long_delays(&self, yes: bool) {
        self.core.long_delays.store(yes, Ordering::SeqCst);
    }

    pub fn get_count(&self, server_id: &str) -> usize {
        let eps = self.core.endpoints.lock().unwrap();
        eps.servers
            .get(server_id)
            .and_then(|s| s.as_ref())
            .map_or(0, Server::count)
    }

    pub fn get_total_count(&self) -> usize {
        self.core.total_count.load(Ordering::SeqCst)
    }

    pub fn get_total_bytes(&self) -> usize {
        self.core.total_bytes.load(Ordering::SeqCst)
    }

    fn end_info(&self, end_name: &str) -> EndInfo {
        let eps = self.core.endpoints.lock().unwrap();
        let server_id = eps.connections.get(end_name).and_then(|s| s.clone());
        let server = server_id
            .as_ref()
            .and_then(|id| eps.servers.get(id))
            .and_then(|s| s.clone());
        EndInfo {
            enabled: *eps.enabled.get(end_name).unwrap_or(&false),
            reliable: self.core.reliable.load(Ordering::SeqCst),
            long_reordering: self.core.long_reordering.load(Ordering::SeqCst),
            long_delays: self.core.long_delays.load(Ordering::SeqCst),
            server_id,
            server,
        }
    }

    fn is_server_dead(&self, end_name: &str, server_id: &str, instance_id: usize) -> bool {
        let eps = self.core.endpoints.lock().unwrap();
        if !*eps.enabled.get(end_name).unwrap_or(&false) {
            return true;
        }
        match eps.servers.get(server_id) {
            Some(Some(server)) => server.id() != instance_id,
            _ => true,
        }
    }

    /// Runs entirely on a `CpuPool` worker thread; every sleep in here
    /// blocks that worker, not the dispatcher.
    fn process_rpc(&self, rpc: Rpc) {
        let info = self.end_info(&rpc.end_name);
        let mut rng = rand::thread_rng();

        let (server, server_id) = match (info.enabled, info.server, info.server_id) {
            (true, Some(server), Some(server_id)) => (server, server_id),
            _ => {
                let ms = if info.long_delays {
                    rng.gen_range(0, 7000)
                } else {
                    rng.gen_range(0, 100)
                };
                Delay::new(Duration::from_millis(ms)).wait().ok();
                let _ = rpc.resp.send(Err(Error::Timeout));
                return;
            }
        };

        if !info.reliable {
            let ms = rng.gen_range(0, 27);
            Delay::new(Duration::from_millis(ms)).wait().ok();
            if rng.gen_range(0, 1000) < 100 {
                let _ = rpc.resp.send(Err(Error::Timeout));
                return;
            }
        }

        let instance_id = server.id();
        let (dispatch_tx, dispatch_rx) = sync_channel(1);
        {
            let server = server.clone();
            let fq_name = rpc.fq_name;
            let req = rpc.req.clone();
            std::thread::spawn(move || {
                let reply = server.dispatch(fq_name, &req);
                let _ = dispatch_tx.send(reply);
            });
        }

        let reply = loop {
            match dispatch_rx.recv_timeout(SERVER_DEAD_POLL) {
                Ok(reply) => break Some(reply),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if self.is_server_dead(&rpc.end_name, &server_id, instance_id) {
                        break None;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break None,
            }
        };

        let reply = match reply {
            Some(reply) => reply,
            None => {
                let _ = rpc.resp.send(Err(Error::Timeout));
                return;
            }
        };

        if !info.reliable && rng.gen_range(0, 1000) < 100 {
            let _ = rpc.resp.send(Err(Error::Timeout));
            return;
        }

        if info.long_reordering && rng.gen_range(0, 900) < 600 {
            let ms = 200 + rng.gen_range(0, 2000);
            Delay::new(Duration::from_millis(ms)).wait().ok();
        }

        let _ = rpc.resp.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::mpsc;
    use std::thread;

    #[derive(Clone, Default, PartialEq, Debug, Serialize, Deserialize)]
    struct JunkArgs {
        x: i64,
    }
    impl labcodec::Codable for JunkArgs {
        const NAME: &'static str = "JunkArgs";
        const FIELDS: &'static [&'static str] = &["X"];
    }

    #[derive(Clone, Default, PartialEq, Debug, Serialize, Deserialize)]
    struct JunkReply {
        x: String,
    }
    impl labcodec::Codable for JunkReply {
        const NAME: &'static str = "JunkReply";
        const FIELDS: &'static [&'static str] = &["X"];
    }

    #[derive(Default)]
    struct JunkInner {
        log2: Vec<i64>,
    }

    struct JunkServer {
        inner: Arc<Mutex<JunkInner>>,
    }

    impl JunkServer {
        fn new() -> JunkServer {
            JunkServer {
                inner: Arc::default(),
            }
        }

        fn build(&self) -> Server {
            let inner = self.inner.clone();
            let mut svc = ServiceBuilder::new("junk");
            svc.add_method("handler2", move |req: &[u8]| {
                let args: JunkArgs = labcodec::decode(req).map_err(Error::Decode)?;
                inner.lock().unwrap().log2.push(args.x);
                let reply = JunkReply {
                    x: format!("handler2-{}", args.x),
                };
                let mut buf = Vec::new();
                labcodec::encode(&reply, &mut buf).map_err(Error::Encode)?;
                Ok(buf)
            });
            svc.add_method("handler4", move |_req: &[u8]| {
                let reply = JunkReply {
                    x: "pointer".to_owned(),
                };
                let mut buf = Vec::new();
                labcodec::encode(&reply, &mut buf).map_err(Error::Encode)?;
                Ok(buf)
            });
            let mut builder = ServerBuilder::new("test_server");
            builder.add_service(svc.build());
            builder.build()
        }
    }

    fn junk_suit() -> (Network, JunkServer) {
        let rn = Network::new();
        let junk = JunkServer::new();
        let server = junk.build();
        rn.add_server("test_server", server);
        (rn, junk)
    }

    fn call_handler4(end: &ClientEnd) -> Result<JunkReply> {
        end.call("junk.handler4", &JunkArgs::default())
    }

    fn call_handler2(end: &ClientEnd, x: i64) -> Result<JunkReply> {
        end.call("junk.handler2", &JunkArgs { x })
    }

    #[test]
    fn basic_call_succeeds_once_connected_and_enabled() {
        let (rn, _junk) = junk_suit();
        let end = rn.make_end("c1");
        rn.connect("c1", "test_server");
        rn.enable("c1", true);

        let rsp = call_handler4(&end).unwrap();
        assert_eq!(rsp.x, "pointer");
    }

    #[test]
    fn disabled_endpoint_fails_until_enabled() {
        let (rn, _junk) = junk_suit();
        let end = rn.make_end("c1");
        rn.connect("c1", "test_server");

        call_handler4(&end).unwrap_err();

        rn.enable("c1", true);
        let rsp = call_handler4(&end).unwrap();
        assert_eq!(rsp.x, "pointer");
    }

    #[test]
    fn get_count_tracks_dispatches() {
        let (rn, _junk) = junk_suit();
        let end = rn.make_end("c1");
        rn.connect("c1", "test_server");
        rn.enable("c1", true);

        for i in 0..5 {
            let rsp = call_handler2(&end, i).unwrap();
            assert_eq!(rsp.x, format!("handler2-{}", i));
        }
        assert_eq!(rn.get_count("test_server"), 5);
    }

    #[test]
    fn deleting_server_kills_future_calls() {
        let (rn, _junk) = junk_suit();
        let end = rn.make_end("c1");
        rn.connect("c1", "test_server");
        rn.enable("c1", true);

        rn.delete_server("test_server");
        call_handler4(&end).unwrap_err();
    }

    #[test]
    fn cleanup_stops_new_calls() {
        let (rn, _junk) = junk_suit();
        let end = rn.make_end("c1");
        rn.connect("c1", "test_server");
        rn.enable("c1", true);
        rn.cleanup();
        assert_eq!(call_handler4(&end), Err(Error::Stopped));
    }

    #[test]
    fn unreliable_network_does_not_always_succeed_or_always_fail() {
        let (rn, _junk) = junk_suit();
        rn.set_reliable(false);
        let (tx, rx) = mpsc::channel();
        let nclients = 200;
        for i in 0..nclients {
            let rn = rn.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let end = rn.make_end(format!("c{}", i));
                rn.connect(end.name().to_owned(), "test_server");
                rn.enable(end.name(), true);
                let ok = call_handler2(&end, i as i64).is_ok();
                tx.send(ok).unwrap();
            });
        }
        drop(tx);
        let mut succeeded = 0;
        for ok in rx {
            if ok {
                succeeded += 1;
            }
        }
        assert!(
            succeeded != 0 && succeeded != nclients,
            "expected a mix of successes and failures, got {}/{}",
            succeeded,
            nclients
        );
    }
}
