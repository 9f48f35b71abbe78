//! Registry persistence
//!
//! Agents and tunnels survive bridge restarts through a [`RegistryStore`].
//! The default implementation keeps two JSON files in a state directory and
//! replaces them atomically on save.

use crate::agents::AgentSpec;
use crate::tunnels::Tunnel;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Durable backing for registry state
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load_agents(&self) -> Result<Vec<AgentSpec>, StoreError>;
    async fn load_tunnels(&self) -> Result<Vec<Tunnel>, StoreError>;
    async fn save_agents(&self, agents: &[AgentSpec]) -> Result<(), StoreError>;
    async fn save_tunnels(&self, tunnels: &[Tunnel]) -> Result<(), StoreError>;
}

/// JSON files under a state directory
pub struct JsonFileStore {
    agents_path: PathBuf,
    tunnels_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            agents_path: dir.join("agents.json"),
            tunnels_path: dir.join("tunnels.json"),
        }
    }

    async fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            // A missing file is an empty registry, not an error
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save<T: serde::Serialize>(path: &Path, items: &[T]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(items)?;

        // Write-then-rename so a crash never leaves a torn file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), count = items.len(), "registry state saved");
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for JsonFileStore {
    async fn load_agents(&self) -> Result<Vec<AgentSpec>, StoreError> {
        Self::load(&self.agents_path).await
    }

    async fn load_tunnels(&self) -> Result<Vec<Tunnel>, StoreError> {
        Self::load(&self.tunnels_path).await
    }

    async fn save_agents(&self, agents: &[AgentSpec]) -> Result<(), StoreError> {
        Self::save(&self.agents_path, agents).await
    }

    async fn save_tunnels(&self, tunnels: &[Tunnel]) -> Result<(), StoreError> {
        Self::save(&self.tunnels_path, tunnels).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessRule;
    use burrow_proto::{PipelineMode, TunnelMode};

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        assert!(store.load_agents().await.unwrap().is_empty());
        assert!(store.load_tunnels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        let agents = vec![AgentSpec {
            id: "agent-1".to_string(),
            secret: "s1".to_string(),
            max_traffic_bytes: Some(1 << 30),
        }];
        let tunnels = vec![Tunnel {
            id: "web".to_string(),
            agent: "agent-1".to_string(),
            mode: TunnelMode::Http {
                host: "app.example.com".to_string(),
                path_prefix: "/".to_string(),
            },
            target: "127.0.0.1:3000".to_string(),
            enabled: true,
            pipeline: PipelineMode::Both,
            http_auth: vec!["admin:hunter2".to_string()],
            http_headers: vec![("X-Forwarded-Proto".to_string(), "http".to_string())],
            access: AccessRule::default(),
        }];

        store.save_agents(&agents).await.unwrap();
        store.save_tunnels(&tunnels).await.unwrap();

        assert_eq!(store.load_agents().await.unwrap(), agents);
        assert_eq!(store.load_tunnels().await.unwrap(), tunnels);
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        let first = vec![AgentSpec {
            id: "a".to_string(),
            secret: "s".to_string(),
            max_traffic_bytes: None,
        }];
        store.save_agents(&first).await.unwrap();
        store.save_agents(&[]).await.unwrap();

        assert!(store.load_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_reports_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("agents.json"), b"{not json")
            .await
            .unwrap();

        let store = JsonFileStore::new(dir.path());
        assert!(matches!(
            store.load_agents().await.unwrap_err(),
            StoreError::Decode(_)
        ));
    }
}
