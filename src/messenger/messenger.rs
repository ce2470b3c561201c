//! The messenger: listener, pipe registry, and the application-facing API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::config::MessengerConfig;
use super::shared::Shared;
use crate::core::{AuthorizerProvider, CryptoService, DispatchSink, MessengerError, NoAuth};
use crate::pipe::{ConnectionIdentity, Pipe, PipeStats, accept};
use crate::transport::{ByteThrottle, EntityName, Message, PeerAddress};

/// Pause after a failed `accept()` before trying again.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// A TETHER messenger: one listening socket and a pipe per peer.
///
/// # Example
///
/// ```ignore
/// use tether_protocol::prelude::*;
///
/// let config = MessengerConfigBuilder::new()
///     .bind_addr("127.0.0.1:0".parse()?)
///     .entity(EntityName::new(entity_type::OSD, 3))
///     .build()?;
///
/// let messenger = Messenger::bind(config, sink).await?;
/// messenger.send_message(peer, entity_type::OSD, Message::new(42, "hello"))?;
/// ```
pub struct Messenger {
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    listener: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Messenger {
    /// Bind with no authorizer and, when the `crypto` feature is on, the
    /// default BLAKE2s signer.
    pub async fn bind(
        config: MessengerConfig,
        sink: Arc<dyn DispatchSink>,
    ) -> Result<Self, MessengerError> {
        #[cfg(feature = "crypto")]
        let crypto: Option<Arc<dyn CryptoService>> = Some(Arc::new(crate::crypto::Blake2Signer::new()));
        #[cfg(not(feature = "crypto"))]
        let crypto: Option<Arc<dyn CryptoService>> = None;

        Self::bind_with_auth(config, sink, Arc::new(NoAuth), crypto).await
    }

    /// Bind with an explicit authorizer provider and signer.
    pub async fn bind_with_auth(
        config: MessengerConfig,
        sink: Arc<dyn DispatchSink>,
        authorizer: Arc<dyn AuthorizerProvider>,
        crypto: Option<Arc<dyn CryptoService>>,
    ) -> Result<Self, MessengerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| MessengerError::Bind(e.to_string()))?;
        let local_addr = listener.local_addr()?;
        let my_addr = PeerAddress::new(local_addr, config.nonce);
        let dispatch_throttle = ByteThrottle::shared("dispatch", config.dispatch_throttle_bytes);

        tracing::info!(addr = %my_addr, entity = %config.entity, "messenger bound");

        let shared = Arc::new(Shared::new(
            config,
            my_addr,
            sink,
            authorizer,
            crypto,
            dispatch_throttle,
        ));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let listener = tokio::spawn(accept_loop(Arc::clone(&shared), listener, shutdown_rx));

        Ok(Self {
            shared,
            shutdown_tx: Some(shutdown_tx),
            listener: Some(listener),
            local_addr,
        })
    }

    /// Address peers reach us at.
    pub fn my_addr(&self) -> PeerAddress {
        self.shared.my_addr()
    }

    /// Socket address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Our entity name.
    pub fn entity(&self) -> EntityName {
        self.shared.my_name()
    }

    /// Queue `msg` for the peer at `addr`, connecting if needed.
    ///
    /// # Errors
    /// `Shutdown` after [`shutdown`](Self::shutdown); `NotConnected` when
    /// our policy for `peer_type` forbids initiating a connection and none
    /// exists.
    pub fn send_message(
        &self,
        addr: PeerAddress,
        peer_type: u32,
        mut msg: Message,
    ) -> Result<(), MessengerError> {
        msg.src = self.shared.my_name();

        if addr == self.shared.my_addr() {
            tracing::trace!(%msg, "local delivery");
            let priority = msg.priority;
            self.shared.sink.deliver(msg, priority);
            return Ok(());
        }

        let mut registry = self.shared.registry();
        if registry.is_stopped() {
            return Err(MessengerError::Shutdown);
        }
        if let Some(pipe) = registry.lookup(&addr) {
            match pipe.submit(msg) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    tracing::debug!(peer = %addr, "pipe closed, replacing");
                    registry.unregister(&pipe);
                    msg = returned;
                }
            }
        }

        if self.shared.policy_for(peer_type).server {
            tracing::debug!(peer = %addr, "no pipe and policy forbids connecting, dropping");
            return Err(MessengerError::NotConnected(addr.to_string()));
        }

        let identity = registry.get_or_create(addr);
        let pipe = Pipe::outgoing(&self.shared, Arc::clone(&identity), peer_type);
        identity.rebind(&pipe);
        registry.register(&pipe);
        pipe.launch(Some(msg));
        Ok(())
    }

    /// Connection identity for `addr`, opening a pipe if there is none.
    ///
    /// # Errors
    /// As for [`send_message`](Self::send_message).
    pub fn connect(
        &self,
        addr: PeerAddress,
        peer_type: u32,
    ) -> Result<Arc<ConnectionIdentity>, MessengerError> {
        let mut registry = self.shared.registry();
        if registry.is_stopped() {
            return Err(MessengerError::Shutdown);
        }
        if let Some(pipe) = registry.lookup(&addr) {
            if !pipe.state().is_closed() {
                return Ok(pipe.identity());
            }
            registry.unregister(&pipe);
        }
        if self.shared.policy_for(peer_type).server {
            return Err(MessengerError::NotConnected(addr.to_string()));
        }

        let identity = registry.get_or_create(addr);
        let pipe = Pipe::outgoing(&self.shared, Arc::clone(&identity), peer_type);
        identity.rebind(&pipe);
        registry.register(&pipe);
        pipe.launch(None);
        Ok(identity)
    }

    /// Identity for `addr`, if one exists.
    pub fn connection(&self, addr: PeerAddress) -> Option<Arc<ConnectionIdentity>> {
        self.shared.registry().lookup(&addr).map(|pipe| pipe.identity())
    }

    /// Ask the pipe to `addr` to send a keepalive. Returns `false` if there
    /// is no live pipe.
    pub fn send_keepalive(&self, addr: PeerAddress) -> bool {
        let pipe = self.shared.registry().lookup(&addr);
        pipe.is_some_and(|pipe| pipe.request_keepalive())
    }

    /// Drop the connection to `addr` now, discarding anything queued.
    pub fn mark_down(&self, addr: PeerAddress) {
        let (pipe, _identity) = {
            let mut registry = self.shared.registry();
            (registry.remove(&addr), registry.forget(&addr))
        };
        match pipe {
            Some(pipe) => {
                tracing::info!(peer = %addr, "mark down");
                pipe.mark_down();
            }
            None => tracing::debug!(peer = %addr, "mark down, no pipe"),
        }
    }

    /// Close the connection to `addr` once everything queued has been
    /// acknowledged.
    pub fn mark_down_on_empty(&self, addr: PeerAddress) {
        let pipe = self.shared.registry().lookup(&addr);
        if let Some(pipe) = pipe {
            let stopped = pipe.close_on_empty();
            tracing::debug!(peer = %addr, stopped, "mark down on empty");
        }
    }

    /// Abort the current socket to `addr`; the pipe recovers as it would
    /// from any socket failure.
    pub fn reset_socket(&self, addr: PeerAddress) -> bool {
        let pipe = self.shared.registry().lookup(&addr);
        match pipe {
            Some(pipe) => {
                tracing::info!(peer = %addr, "resetting socket");
                pipe.reset_socket();
                true
            }
            None => false,
        }
    }

    /// Next process-wide global sequence, strictly above `at_least`.
    pub fn global_seq(&self, at_least: u32) -> u32 {
        self.shared.global_seq(at_least)
    }

    /// Counters of the pipe to `addr`.
    pub fn pipe_stats(&self, addr: PeerAddress) -> Option<PipeStats> {
        self.shared.registry().lookup(&addr).map(|pipe| pipe.stats())
    }

    /// Stop listening, close every pipe, and forget every peer.
    pub async fn shutdown(mut self) {
        self.stop_listening();
        let pipes = self.shared.registry().shut_down();
        tracing::info!(pipes = pipes.len(), "messenger shutting down");
        for pipe in pipes {
            pipe.stop();
        }
        if let Some(listener) = self.listener.take() {
            let _ = listener.await;
        }
    }

    fn stop_listening(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("shared", &self.shared)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            res = listener.accept() => match res {
                Ok((stream, from)) => {
                    tracing::debug!(%from, "accepted socket");
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        match accept(&shared, stream).await {
                            Ok(pipe) => {
                                tracing::debug!(peer = %pipe.peer_addr(), "accept done");
                            }
                            Err(e) if e.is_protocol_violation() || e.is_auth_failure() => {
                                tracing::warn!(%from, error = %e, "accept failed");
                            }
                            Err(e) => {
                                tracing::debug!(%from, error = %e, "accept failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            },
        }
    }
    tracing::debug!("listener stopped");
}
