use super::{ShardStore, ShardStream};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

/// Keeps shards in memory. Also records how many streams were open at the
/// same time, which makes fan-out behaviour observable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    open: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
    sealed: Mutex<BTreeMap<String, Bytes>>,
    discarded: AtomicUsize,
    open_now: AtomicUsize,
    peak_open: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sealed shards by name.
    pub fn shards(&self) -> BTreeMap<String, Bytes> {
        self.sealed.lock().clone()
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.sealed.lock().get(name).cloned()
    }

    pub fn sealed_count(&self) -> usize {
        self.sealed.lock().len()
    }

    pub fn discarded_count(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn open_now(&self) -> usize {
        self.open_now.load(Ordering::Acquire)
    }

    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::Acquire)
    }

    fn close(&self, name: &str) -> io::Result<Arc<Mutex<Vec<u8>>>> {
        let buffer = self.open.lock().remove(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("shard {name} is not open"))
        })?;
        self.open_now.fetch_sub(1, Ordering::AcqRel);
        Ok(buffer)
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    async fn open(&self, name: &str) -> io::Result<ShardStream> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        {
            let mut open = self.open.lock();
            if open.contains_key(name) || self.sealed.lock().contains_key(name) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("shard {name} already exists"),
                ));
            }
            open.insert(name.to_string(), buffer.clone());
        }
        let now = self.open_now.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_open.fetch_max(now, Ordering::AcqRel);
        Ok(Box::new(MemoryStream { buffer }))
    }

    async fn seal(&self, name: &str) -> io::Result<()> {
        let buffer = self.close(name)?;
        let bytes = Bytes::from(std::mem::take(&mut *buffer.lock()));
        self.sealed.lock().insert(name.to_string(), bytes);
        Ok(())
    }

    async fn discard(&self, name: &str) -> io::Result<()> {
        self.close(name)?;
        self.discarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct MemoryStream {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
