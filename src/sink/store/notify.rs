use super::{ShardStore, ShardStream};
use async_trait::async_trait;
use std::io;
use tokio::sync::mpsc;
use tracing::warn;

/// Publishes the name of every sealed shard on a channel, e.g. to feed an
/// ingestion queue. Everything else is delegated to the inner store.
pub struct NotifyingStore<S> {
    inner: S,
    sealed_tx: mpsc::Sender<String>,
}

impl<S: ShardStore> NotifyingStore<S> {
    pub fn new(inner: S, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (sealed_tx, sealed_rx) = mpsc::channel(capacity.max(1));
        (Self { inner, sealed_tx }, sealed_rx)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ShardStore> ShardStore for NotifyingStore<S> {
    async fn open(&self, name: &str) -> io::Result<ShardStream> {
        self.inner.open(name).await
    }

    async fn seal(&self, name: &str) -> io::Result<()> {
        self.inner.seal(name).await?;
        if self.sealed_tx.send(name.to_string()).await.is_err() {
            warn!(shard = name, "Sealed-shard listener is gone");
        }
        Ok(())
    }

    async fn discard(&self, name: &str) -> io::Result<()> {
        self.inner.discard(name).await
    }
}
