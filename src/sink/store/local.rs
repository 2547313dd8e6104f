use super::{ShardStore, ShardStream};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::BufWriter;
use tracing::debug;

const PARTIAL_SUFFIX: &str = ".partial";

/// Writes shards under a directory. Bytes go to `<name>.partial` and the file
/// is renamed to `<name>` on seal, so a shard only appears under its final
/// name once complete.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn final_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn partial_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}{PARTIAL_SUFFIX}"))
    }
}

#[async_trait]
impl ShardStore for LocalDirStore {
    async fn open(&self, name: &str) -> io::Result<ShardStream> {
        let partial = self.partial_path(name);
        if let Some(parent) = partial.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(&partial).await?;
        debug!(path = %partial.display(), "Opened shard file");
        Ok(Box::new(BufWriter::new(file)))
    }

    async fn seal(&self, name: &str) -> io::Result<()> {
        fs::rename(self.partial_path(name), self.final_path(name)).await
    }

    async fn discard(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.partial_path(name)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
