//! State shared by the messenger, its listener, and every pipe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;

use super::config::MessengerConfig;
use crate::core::{AuthorizerProvider, CryptoService, DispatchSink, MAX_SEQ_START, Throttle};
use crate::pipe::{ConnectionIdentity, Pipe, Policy};
use crate::transport::{EntityName, PeerAddress};

/// Peer-address registry: at most one pipe per address, one identity per
/// address.
///
/// Lock order: registry, then a pipe, then an identity.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pipes: HashMap<PeerAddress, Arc<Pipe>>,
    identities: HashMap<PeerAddress, Arc<ConnectionIdentity>>,
    stopped: bool,
}

impl Registry {
    /// Whether the messenger is shutting down.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Registered pipe for `addr`.
    pub fn lookup(&self, addr: &PeerAddress) -> Option<Arc<Pipe>> {
        self.pipes.get(addr).cloned()
    }

    /// Register `pipe` under its peer address.
    pub fn register(&mut self, pipe: &Arc<Pipe>) {
        let addr = pipe.peer_addr();
        tracing::debug!(peer = %addr, "register pipe");
        self.pipes.insert(addr, Arc::clone(pipe));
    }

    /// Unregister `pipe` if it is still the registered one.
    pub fn unregister(&mut self, pipe: &Pipe) -> bool {
        let addr = pipe.peer_addr();
        match self.pipes.get(&addr) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), pipe) => {
                tracing::debug!(peer = %addr, "unregister pipe");
                self.pipes.remove(&addr);
                true
            }
            _ => false,
        }
    }

    /// Remove whatever pipe is registered for `addr`.
    pub fn remove(&mut self, addr: &PeerAddress) -> Option<Arc<Pipe>> {
        self.pipes.remove(addr)
    }

    /// Identity for `addr`, created on first use.
    pub fn get_or_create(&mut self, addr: PeerAddress) -> Arc<ConnectionIdentity> {
        Arc::clone(
            self.identities
                .entry(addr)
                .or_insert_with(|| Arc::new(ConnectionIdentity::new(addr))),
        )
    }

    /// Forget the identity for `addr`.
    pub fn forget(&mut self, addr: &PeerAddress) -> Option<Arc<ConnectionIdentity>> {
        self.identities.remove(addr)
    }

    /// Mark stopped and hand back every pipe.
    pub fn shut_down(&mut self) -> Vec<Arc<Pipe>> {
        self.stopped = true;
        self.identities.clear();
        self.pipes.drain().map(|(_, pipe)| pipe).collect()
    }
}

/// Everything a pipe needs from its messenger.
pub(crate) struct Shared {
    pub config: MessengerConfig,
    pub sink: Arc<dyn DispatchSink>,
    pub authorizer: Arc<dyn AuthorizerProvider>,
    pub crypto: Option<Arc<dyn CryptoService>>,
    pub dispatch_throttle: Arc<dyn Throttle>,
    registry: Mutex<Registry>,
    my_addr: Mutex<PeerAddress>,
    need_addr: AtomicBool,
    global_seq: Mutex<u32>,
}

impl Shared {
    pub fn new(
        config: MessengerConfig,
        my_addr: PeerAddress,
        sink: Arc<dyn DispatchSink>,
        authorizer: Arc<dyn AuthorizerProvider>,
        crypto: Option<Arc<dyn CryptoService>>,
        dispatch_throttle: Arc<dyn Throttle>,
    ) -> Self {
        Self {
            config,
            sink,
            authorizer,
            crypto,
            dispatch_throttle,
            registry: Mutex::new(Registry::default()),
            need_addr: AtomicBool::new(my_addr.is_blank_ip()),
            my_addr: Mutex::new(my_addr),
            global_seq: Mutex::new(0),
        }
    }

    pub fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.registry().is_stopped()
    }

    pub fn my_name(&self) -> EntityName {
        self.config.entity
    }

    pub fn my_type(&self) -> u32 {
        self.config.entity.entity_type
    }

    pub fn my_addr(&self) -> PeerAddress {
        *self.my_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adopt the IP a peer saw us connect from, if we never knew ours.
    pub fn learned_addr(&self, seen: PeerAddress) {
        if !self.need_addr.load(Ordering::Acquire) {
            return;
        }
        let mut addr = self.my_addr.lock().unwrap_or_else(PoisonError::into_inner);
        if self.need_addr.swap(false, Ordering::AcqRel) {
            *addr = addr.with_ip(seen.addr.ip());
            tracing::info!(addr = %*addr, "learned my address");
        }
    }

    /// Next process-wide global sequence, strictly above `at_least`.
    pub fn global_seq(&self, at_least: u32) -> u32 {
        let mut g = self.global_seq.lock().unwrap_or_else(PoisonError::into_inner);
        if *g < at_least {
            *g = at_least;
        }
        *g = g.wrapping_add(1);
        *g
    }

    /// Starting value for a fresh outbound sequence.
    pub fn initial_out_seq(&self) -> u64 {
        if self.config.randomize_initial_seq {
            rand::thread_rng().gen_range(0..MAX_SEQ_START)
        } else {
            0
        }
    }

    pub fn policy_for(&self, peer_type: u32) -> Policy {
        self.config.policy_for(peer_type)
    }

    pub fn protocol_version_for(&self, peer_type: u32) -> u32 {
        self.config.protocol_version_for(peer_type)
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("entity", &self.config.entity)
            .field("my_addr", &self.my_addr())
            .finish_non_exhaustive()
    }
}
