//! Servers are a fixed set of named services, each a fixed set of named
//! methods. The registry is built once at startup and never mutated
//! afterward, so looking up an unknown service or method can only mean a
//! wiring mistake — we treat that the way the original course harness
//! treats it and abort rather than return a soft error.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::error::{Error, Result};

static ID_ALLOC: AtomicUsize = AtomicUsize::new(0);

type MethodFn = dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync;

/// One method on a [`Service`]: decode, invoke, encode, all in one closure.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Box<MethodFn>>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn add_method<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.methods.insert(name.clone(), Box::new(handler)).is_some() {
            panic!(
                "labrpc: service {} already has a method named {}",
                self.name, name
            );
        }
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: Arc::new(self.methods),
        }
    }
}

#[derive(Clone)]
pub struct Service {
    name: String,
    methods: Arc<HashMap<String, Box<MethodFn>>>,
}

impl Service {
    fn dispatch(&self, method_name: &str, req: &[u8]) -> Result<Vec<u8>> {
        match self.methods.get(method_name) {
            Some(handler) => {
                match panic::catch_unwind(AssertUnwindSafe(|| handler(req))) {
                    Ok(result) => result,
                    Err(_) => Err(Error::Unimplemented(format!(
                        "{}.{} panicked while handling the request",
                        self.name, method_name
                    ))),
                }
            }
            None => {
                let mut choices: Vec<&str> = self.methods.keys().map(String::as_str).collect();
                choices.sort_unstable();
                panic!(
                    "labrpc: unknown method {} on service {} (have: {:?})",
                    method_name, self.name, choices
                );
            }
        }
    }
}

/// Registers the services a [`Server`] will host.
pub struct ServerBuilder {
    name: String,
    services: HashMap<String, Service>,
}

impl ServerBuilder {
    pub fn new(name: impl Into<String>) -> ServerBuilder {
        ServerBuilder {
            name: name.into(),
            services: HashMap::new(),
        }
    }

    pub fn add_service(&mut self, service: Service) {
        let name = service.name.clone();
        if self.services.insert(name.clone(), service).is_some() {
            panic!(
                "labrpc: server {} already has a service named {}",
                self.name, name
            );
        }
    }

    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerCore {
                id: ID_ALLOC.fetch_add(1, Ordering::SeqCst),
                services: self.services,
                count: AtomicUsize::new(0),
            }),
        }
    }
}

struct ServerCore {
    id: usize,
    services: HashMap<String, Service>,
    count: AtomicUsize,
}

/// A bundle of services reachable under one network identity.
///
/// Cheap to clone: every clone refers to the same instance, which is what
/// lets [`crate::Network::delete_server`] invalidate every outstanding
/// clone by swapping the id it hands out next.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerCore>,
}

impl Server {
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Splits `fq_name` on its last `.` into service and method, and
    /// invokes it. Panics (a fatal configuration error, not a runtime
    /// failure) if either half is unknown.
    pub fn dispatch(&self, fq_name: &str, req: &[u8]) -> Result<Vec<u8>> {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        let dot = fq_name.rfind('.').unwrap_or_else(|| {
            panic!("labrpc: malformed rpc name {}, want Service.Method", fq_name)
        });
        let (service_name, method_name) = (&fq_name[..dot], &fq_name[dot + 1..]);
        match self.inner.services.get(service_name) {
            Some(service) => service.dispatch(method_name, req),
            None => {
                let mut choices: Vec<&str> = self.inner.services.keys().map(String::as_str).collect();
                choices.sort_unstable();
                panic!(
                    "labrpc: unknown service {} (have: {:?})",
                    service_name, choices
                );
            }
        }
    }
}
