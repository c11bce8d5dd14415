use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::ServerConfig},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider that loads from a local file and watches for changes.
pub struct FileConfigProvider {
    path: PathBuf,
    // kept alive for as long as the provider exists
    _watcher: notify::RecommendedWatcher,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);
        let watcher = watch_file(&path, tx)?;

        Ok(Self {
            path,
            _watcher: watcher,
            update_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Watch the parent directory and signal on any event touching the file name.
/// Editors often replace files instead of writing in place.
fn watch_file(path: &Path, tx: mpsc::Sender<()>) -> Result<notify::RecommendedWatcher> {
    let file_name = path
        .file_name()
        .ok_or_else(|| eyre::eyre!("Invalid config path: {}", path.display()))?
        .to_owned();

    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                let relevant = event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
                if relevant && event.paths.iter().any(|p| p.file_name() == Some(&file_name)) {
                    tracing::debug!("Config file changed: {:?}", event.kind);
                    // a pending signal already covers this change
                    let _ = tx.try_send(());
                }
            }
            Err(e) => tracing::error!("File watch error: {:?}", e),
        })?;

    let watch_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    watcher
        .watch(watch_dir, RecursiveMode::NonRecursive)
        .wrap_err("Failed to watch config directory")?;
    Ok(watcher)
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<ServerConfig> {
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid path"))?;
        load_config(path_str).await
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
