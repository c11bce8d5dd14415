use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::ServerConfig;

/// Source of configuration that can be reloaded while the proxy runs.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the current configuration.
    async fn load_config(&self) -> Result<ServerConfig>;

    /// Channel that fires whenever the configuration changed. The receiver
    /// is handed out once; later calls return `None`.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}
