//! Messenger configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::core::{
    CLUSTER_PROTOCOL_VERSION, DEFAULT_DISPATCH_THROTTLE_BYTES, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_MAX_BACKOFF, DEFAULT_READ_TIMEOUT, MessengerError, PUBLIC_PROTOCOL_VERSION,
};
use crate::pipe::Policy;
use crate::transport::{EntityName, entity_type};

/// Messenger configuration.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub bind_addr: SocketAddr,

    /// Our own entity name, stamped on outgoing messages.
    pub entity: EntityName,

    /// Per-process nonce distinguishing restarts on the same address.
    pub nonce: u32,

    /// Protocol version overrides per peer entity type.
    pub protocol_versions: HashMap<u32, u32>,

    /// Socket read/write timeout. `None` waits forever.
    pub tcp_read_timeout: Option<Duration>,

    /// Disable Nagle's algorithm on pipe sockets.
    pub tcp_nodelay: bool,

    /// Compute and check section CRCs.
    pub crc: bool,

    /// First reconnect backoff after a failed connect.
    pub initial_backoff: Duration,

    /// Upper bound for the reconnect backoff.
    pub max_backoff: Duration,

    /// Bytes of received-but-undelivered messages allowed process-wide.
    pub dispatch_throttle_bytes: u64,

    /// Start outbound sequences at a random value below 2^31.
    pub randomize_initial_seq: bool,

    /// Policy for peer types without an explicit entry.
    pub default_policy: Policy,

    /// Policy per peer entity type.
    pub policies: HashMap<u32, Policy>,
}

impl MessengerConfig {
    /// Policy for peers of `peer_type`.
    pub fn policy_for(&self, peer_type: u32) -> Policy {
        self.policies
            .get(&peer_type)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// Protocol version spoken with peers of `peer_type`.
    ///
    /// Peers of our own type speak the cluster protocol; everyone else the
    /// public one, unless overridden.
    pub fn protocol_version_for(&self, peer_type: u32) -> u32 {
        if let Some(version) = self.protocol_versions.get(&peer_type) {
            return *version;
        }
        if peer_type == self.entity.entity_type {
            CLUSTER_PROTOCOL_VERSION
        } else {
            PUBLIC_PROTOCOL_VERSION
        }
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            entity: EntityName::new(entity_type::CLIENT, 0),
            nonce: 0,
            protocol_versions: HashMap::new(),
            tcp_read_timeout: Some(DEFAULT_READ_TIMEOUT),
            tcp_nodelay: true,
            crc: true,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            dispatch_throttle_bytes: DEFAULT_DISPATCH_THROTTLE_BYTES,
            randomize_initial_seq: true,
            default_policy: Policy::default(),
            policies: HashMap::new(),
        }
    }
}

/// Builder for [`MessengerConfig`].
#[derive(Debug)]
pub struct MessengerConfigBuilder {
    config: MessengerConfig,
}

impl MessengerConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self {
            config: MessengerConfig::default(),
        }
    }

    /// Set the listen address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set our entity name.
    pub fn entity(mut self, entity: EntityName) -> Self {
        self.config.entity = entity;
        self
    }

    /// Set the address nonce.
    pub fn nonce(mut self, nonce: u32) -> Self {
        self.config.nonce = nonce;
        self
    }

    /// Override the protocol version for one peer type.
    pub fn protocol_version(mut self, peer_type: u32, version: u32) -> Self {
        self.config.protocol_versions.insert(peer_type, version);
        self
    }

    /// Set the socket timeout (`None` for unbounded).
    pub fn tcp_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.tcp_read_timeout = timeout;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    /// Enable or disable section CRCs.
    pub fn crc(mut self, enabled: bool) -> Self {
        self.config.crc = enabled;
        self
    }

    /// Set the reconnect backoff bounds.
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.initial_backoff = initial;
        self.config.max_backoff = max;
        self
    }

    /// Set the dispatch throttle budget.
    pub fn dispatch_throttle_bytes(mut self, bytes: u64) -> Self {
        self.config.dispatch_throttle_bytes = bytes;
        self
    }

    /// Enable or disable random initial sequence numbers.
    pub fn randomize_initial_seq(mut self, enabled: bool) -> Self {
        self.config.randomize_initial_seq = enabled;
        self
    }

    /// Set the fallback policy.
    pub fn default_policy(mut self, policy: Policy) -> Self {
        self.config.default_policy = policy;
        self
    }

    /// Set the policy for one peer type.
    pub fn policy(mut self, peer_type: u32, policy: Policy) -> Self {
        self.config.policies.insert(peer_type, policy);
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    /// Returns `Config` if the backoff bounds are inverted or zero, or the
    /// dispatch budget is zero.
    pub fn build(self) -> Result<MessengerConfig, MessengerError> {
        let config = self.config;
        if config.initial_backoff.is_zero() {
            return Err(MessengerError::Config("initial backoff must be non-zero".into()));
        }
        if config.initial_backoff > config.max_backoff {
            return Err(MessengerError::Config(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                config.initial_backoff, config.max_backoff
            )));
        }
        if config.dispatch_throttle_bytes == 0 {
            return Err(MessengerError::Config("dispatch throttle must be non-zero".into()));
        }
        Ok(config)
    }
}

impl Default for MessengerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MessengerConfig::default();
        assert_eq!(config.initial_backoff, Duration::from_millis(200));
        assert_eq!(config.max_backoff, Duration::from_secs(15));
        assert_eq!(config.dispatch_throttle_bytes, 100 << 20);
        assert!(config.randomize_initial_seq);
        assert!(config.crc);
    }

    #[test]
    fn test_protocol_version_selection() {
        let config = MessengerConfigBuilder::new()
            .entity(EntityName::new(entity_type::OSD, 1))
            .protocol_version(entity_type::MON, 15)
            .build()
            .unwrap();
        assert_eq!(config.protocol_version_for(entity_type::OSD), CLUSTER_PROTOCOL_VERSION);
        assert_eq!(config.protocol_version_for(entity_type::CLIENT), PUBLIC_PROTOCOL_VERSION);
        assert_eq!(config.protocol_version_for(entity_type::MON), 15);
    }

    #[test]
    fn test_policy_lookup() {
        let config = MessengerConfigBuilder::new()
            .policy(entity_type::CLIENT, Policy::stateless_server())
            .build()
            .unwrap();
        assert!(config.policy_for(entity_type::CLIENT).server);
        assert!(!config.policy_for(entity_type::OSD).server);
    }

    #[test]
    fn test_build_validation() {
        let inverted = MessengerConfigBuilder::new()
            .backoff(Duration::from_secs(2), Duration::from_secs(1))
            .build();
        assert!(matches!(inverted, Err(MessengerError::Config(_))));

        let no_budget = MessengerConfigBuilder::new().dispatch_throttle_bytes(0).build();
        assert!(no_budget.is_err());
    }
}
