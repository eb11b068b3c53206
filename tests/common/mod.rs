use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chatshard::chat::{ChatManager, ManualScheduler};
use chatshard::config::StorageConfig;
use chatshard::storage::MemoryStore;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn manual_manager(store: Arc<MemoryStore>) -> (ChatManager, Arc<ManualScheduler>) {
    let scheduler = Arc::new(ManualScheduler::new());
    let manager = ChatManager::new(store, scheduler.clone(), StorageConfig::default());
    (manager, scheduler)
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
