mod local;
mod memory;
mod notify;

pub use local::LocalDirStore;
pub use memory::MemoryStore;
pub use notify::NotifyingStore;

use async_trait::async_trait;
use std::io;
use tokio::io::AsyncWrite;

pub type ShardStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Destination of shard bytes.
///
/// A shard is opened, written through the returned stream, then either
/// sealed (complete and discoverable) or discarded.
#[async_trait]
pub trait ShardStore: Send + Sync {
    async fn open(&self, name: &str) -> io::Result<ShardStream>;

    /// Called after the stream was flushed and shut down.
    async fn seal(&self, name: &str) -> io::Result<()>;

    async fn discard(&self, name: &str) -> io::Result<()>;
}
