//! Shared harness: a test cluster holds the backends every node attaches
//! to, which is the same topology a real deployment gets from its shared
//! cache, registry, and broker.
use chatd::config::ServerConfig;
use chatd::server::ServerHandle;
use chatd::store::memory::MemoryDirectory;
use chatd::store::DirectoryStore;
use chatd::{AppContext, Services};
use parley_bus::{InProcessBus, MessageBus};
use parley_client::ChatClient;
use parley_presence::{MemoryPresence, PresenceRegistry};
use parley_proto::LoginData;
use parley_storage::{KvCache, MemoryCache, MemoryMessageStore, MessageStore};
use std::sync::Arc;

pub struct TestCluster {
    pub bus: Arc<InProcessBus>,
    pub presence: Arc<MemoryPresence>,
    pub directory: Arc<MemoryDirectory>,
    pub messages: Arc<MemoryMessageStore>,
    pub cache: Arc<MemoryCache>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(InProcessBus::new()),
            presence: Arc::new(MemoryPresence::new()),
            directory: Arc::new(MemoryDirectory::new()),
            messages: Arc::new(MemoryMessageStore::new(None)),
            cache: Arc::new(MemoryCache::new()),
        }
    }

    pub fn node_config(&self, node_id: &str) -> ServerConfig {
        let mut config = ServerConfig::for_tests();
        config.node_id = node_id.to_string();
        config
    }

    pub async fn spawn_node(&self, node_id: &str) -> ServerHandle {
        self.spawn_node_with(self.node_config(node_id)).await
    }

    pub async fn spawn_node_with(&self, config: ServerConfig) -> ServerHandle {
        let services = Arc::new(Services::new(
            config,
            Arc::clone(&self.directory) as Arc<dyn DirectoryStore>,
            Arc::clone(&self.messages) as Arc<dyn MessageStore>,
            Arc::clone(&self.cache) as Arc<dyn KvCache>,
            Arc::clone(&self.presence) as Arc<dyn PresenceRegistry>,
            Arc::clone(&self.bus) as Arc<dyn MessageBus>,
        ));
        let ctx = Arc::new(AppContext::new(services));
        chatd::server::start(ctx).await.expect("start node")
    }
}

pub async fn register_and_login(
    client: &ChatClient,
    username: &str,
    password: &str,
    email: &str,
) -> LoginData {
    client
        .register(username, password, email)
        .await
        .expect("register");
    client.login(username, password).await.expect("login")
}
