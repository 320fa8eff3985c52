use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    /// Entries directly under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", path))
    }
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = Path::new(prefix);
        let mut entries = Vec::new();

        if path.is_dir() {
            let mut dir = tokio::fs::read_dir(path).await?;
            while let Some(entry) = dir.next_entry().await? {
                entries.push(entry.path().to_string_lossy().to_string());
            }
        } else if path.exists() {
            entries.push(prefix.to_string());
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parent_dirs_and_lists() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("nested");
        let file = root.join("a.json");
        let file_str = file.to_string_lossy().to_string();

        let storage = NativeStorage::new();
        storage.write(&file_str, b"[]").await?;

        assert!(storage.exists(&file_str).await?);
        assert_eq!(storage.read_to_string(&file_str).await?, "[]");

        let listed = storage.list(&root.to_string_lossy()).await?;
        assert_eq!(listed, vec![file_str.clone()]);
        assert!(!storage.exists(&root.join("b.json").to_string_lossy()).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let missing = temp_dir.path().join("nope");
        let listed = NativeStorage::new().list(&missing.to_string_lossy()).await?;
        assert!(listed.is_empty());
        Ok(())
    }
}
