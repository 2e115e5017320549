//! parley chat node.
//!
//! The binary wires a TCP acceptor to a msg-id dispatcher, the P2P and
//! group routing engines, and the cluster coordinator. External
//! collaborators (directory SQL, message cache, presence KV, message bus)
//! are capability traits injected at boot; no service lives in a global.
use std::sync::Arc;

pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod registry;
pub mod routing;
pub mod server;
pub mod session;
pub mod store;

use cluster::Coordinator;
use config::ServerConfig;
use parley_auth::session::SessionMirror;
use parley_auth::signature::SignatureVerifier;
use parley_auth::{TokenConfig, TokenKeeper};
use parley_bus::MessageBus;
use parley_presence::PresenceRegistry;
use parley_storage::{KvCache, MessageStore};
use registry::ConnectionRegistry;
use std::time::Duration;
use store::DirectoryStore;

/// Shared leaf services handed to handlers and the coordinator.
pub struct Services {
    pub config: Arc<ServerConfig>,
    pub node_id: String,
    pub registry: Arc<ConnectionRegistry>,
    pub directory: Arc<dyn DirectoryStore>,
    pub messages: Arc<dyn MessageStore>,
    pub cache: Arc<dyn KvCache>,
    pub presence: Arc<dyn PresenceRegistry>,
    pub bus: Arc<dyn MessageBus>,
    pub tokens: Arc<TokenKeeper>,
    pub session_mirror: Arc<SessionMirror>,
    pub signature: Option<Arc<SignatureVerifier>>,
}

impl Services {
    pub fn new(
        config: ServerConfig,
        directory: Arc<dyn DirectoryStore>,
        messages: Arc<dyn MessageStore>,
        cache: Arc<dyn KvCache>,
        presence: Arc<dyn PresenceRegistry>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let node_id = config.node_id.clone();
        let mut token_config =
            TokenConfig::new(config.auth.jwt_secret.clone(), config.auth.jwt_issuer.clone());
        token_config.ttl = Duration::from_secs(config.auth.jwt_expires_in_secs);
        let tokens = Arc::new(TokenKeeper::new(&token_config));
        let session_mirror = Arc::new(SessionMirror::new(
            Arc::clone(&cache),
            Duration::from_secs(config.auth.session_expiration_secs),
        ));
        let signature = config.auth.signature_check_enabled.then(|| {
            Arc::new(
                SignatureVerifier::new(config.auth.signature_secret.clone(), Arc::clone(&cache))
                    .with_tolerance(config.auth.timestamp_tolerance_secs)
                    .with_nonce_ttl(Duration::from_secs(config.auth.nonce_expiration_secs)),
            )
        });
        Self {
            config: Arc::new(config),
            node_id,
            registry: Arc::new(ConnectionRegistry::new()),
            directory,
            messages,
            cache,
            presence,
            bus,
            tokens,
            session_mirror,
            signature,
        }
    }
}

/// Handler-facing context: leaf services plus the cluster coordinator.
pub struct AppContext {
    pub services: Arc<Services>,
    pub coordinator: Arc<Coordinator>,
}

impl AppContext {
    pub fn new(services: Arc<Services>) -> Self {
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&services)));
        Self {
            services,
            coordinator,
        }
    }
}
